use std::time::Duration;

/// Minimum log level, mirroring `Common/constants.py::_LOGGING_MAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            // There is no "critical" level in `log`; both map to Error, the
            // closest the crate offers.
            LogLevel::Error | LogLevel::Critical => log::LevelFilter::Error,
        }
    }
}

/// Which readiness backend the reactor should use to wait for I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PollerType {
    Poll,
    Select,
}

impl PollerType {
    /// `poll` everywhere `poll(2)` exists; `select` is the portable fallback.
    pub fn default_for_platform() -> PollerType {
        PollerType::Poll
    }
}

/// Every tunable default the relay needs, threaded through construction
/// instead of living as Python module-level globals (`Common/constants.py`).
#[derive(Debug, Clone)]
pub struct Config {
    pub rudp_port: u16,
    pub control_port: u16,
    pub http_port: u16,
    /// Percentage (0..=100) chance an inbound datagram is dropped for testing.
    pub random_drop: u8,
    pub log_file: Option<String>,
    pub log_level: LogLevel,
    pub daemon: bool,
    pub poller_type: PollerType,

    pub keep_alive_interval: Duration,
    pub retry_interval: Duration,
    pub connection_approval_interval: Duration,
    pub retry_count: u32,
    pub max_connections: u32,
    pub data_length: usize,
    pub reactor_timeout: Duration,

    pub data_block_size: usize,
    pub data_buff_limit: usize,
    pub control_block_size: usize,
    pub control_buff_limit: usize,
    pub http_block_size: usize,
    pub http_buff_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rudp_port: 1026,
            control_port: 1025,
            http_port: 80,
            random_drop: 0,
            log_file: None,
            log_level: LogLevel::Info,
            daemon: false,
            poller_type: PollerType::default_for_platform(),

            keep_alive_interval: Duration::from_millis(20_000),
            retry_interval: Duration::from_millis(1_000),
            connection_approval_interval: Duration::from_millis(10_000),
            retry_count: 15,
            max_connections: 1 << 16,
            data_length: 1024,
            reactor_timeout: Duration::from_millis(2_000),

            data_block_size: 1024,
            data_buff_limit: 4096,
            control_block_size: 1024,
            control_buff_limit: 4096,
            http_block_size: 1024,
            http_buff_limit: 4096,
        }
    }
}
