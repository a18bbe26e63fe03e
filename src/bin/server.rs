//! CLI entry point: parses arguments, sets up logging, optionally
//! daemonizes, wires the RUDP multiplexer and the control/HTTP surfaces
//! into one `Reactor`, and runs until `SIGINT`/`SIGTERM`.
//!
//! Grounded on `Server/__main__.py` and `Common/util.py::daemon`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use clap::Parser;
use concurrent_queue::ConcurrentQueue;
use log::info;

use rudp_relay::config::{Config, LogLevel, PollerType};
use rudp_relay::control::ControlListener;
use rudp_relay::http::HttpListener;
use rudp_relay::reactor::Reactor;
use rudp_relay::rudp::mux::{DatagramMux, MuxPollable};

#[derive(Parser, Debug)]
#[command(name = "rudp-relay-server", about = "Reliable-datagram relay")]
struct Args {
    #[arg(long, default_value_t = Config::default().rudp_port)]
    rudp_port: u16,

    #[arg(long, default_value_t = Config::default().control_port)]
    control_port: u16,

    #[arg(long, default_value_t = Config::default().http_port)]
    http_port: u16,

    /// Percentage chance (0-100) that an inbound RUDP packet is dropped,
    /// for testing.
    #[arg(long, default_value_t = 0)]
    random_drop: u8,

    /// Log filename; stderr if unset.
    #[arg(long)]
    log: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Turn the server into a background daemon process.
    #[arg(long, default_value_t = false)]
    daemon: bool,

    #[arg(long, value_enum, default_value_t = PollerType::default_for_platform())]
    poller_type: PollerType,
}

/// Detaches from the controlling terminal the way `util.daemon()` does:
/// fork, exit the parent, close inherited descriptors, redirect
/// stdin/stdout/stderr to `/dev/null`, ignore `SIGHUP`.
fn daemonize() -> std::io::Result<()> {
    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if pid > 0 {
            libc::_exit(0);
        }
        if libc::setsid() < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).max(1024) as libc::c_int;
        for fd in 3..max_fd {
            libc::close(fd);
        }

        let devnull = std::ffi::CString::new("/dev/null").unwrap();
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, 0);
            libc::dup2(fd, 1);
            libc::dup2(fd, 2);
            if fd > 2 {
                libc::close(fd);
            }
        }

        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
    Ok(())
}

fn init_log(log_file: &Option<String>, level: LogLevel) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level.as_filter());
    builder.format_timestamp_millis();
    if let Some(path) = log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => {
                eprintln!("failed to open log file {}: {}", path, err);
            }
        }
    }
    builder.init();
}

fn run(args: Args) -> rudp_relay::Result<()> {
    let mut config = Config::default();
    config.rudp_port = args.rudp_port;
    config.control_port = args.control_port;
    config.http_port = args.http_port;
    config.random_drop = args.random_drop;
    config.log_file = args.log.clone();
    config.log_level = args.log_level;
    config.daemon = args.daemon;
    config.poller_type = args.poller_type;

    let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let mut reactor = Reactor::new(&config);
    let spawn_queue = reactor.spawn_queue();
    let send_queue = Rc::new(ConcurrentQueue::unbounded());

    let mux = Rc::new(std::cell::RefCell::new(DatagramMux::bind(
        SocketAddr::new(unspecified, config.rudp_port),
        &config,
        send_queue,
        spawn_queue.clone(),
    )?));
    reactor.register(Box::new(MuxPollable::new(mux.clone())))?;

    let control_listener = ControlListener::bind(
        SocketAddr::new(unspecified, config.control_port),
        mux.clone(),
        spawn_queue.clone(),
        &config,
    )?;
    reactor.register(Box::new(control_listener))?;

    let http_listener = HttpListener::bind(
        SocketAddr::new(unspecified, config.http_port),
        mux.clone(),
        spawn_queue,
        &config,
    )?;
    reactor.register(Box::new(http_listener))?;

    let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())
        .map_err(rudp_relay::RudpError::Io)?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())
        .map_err(rudp_relay::RudpError::Io)?;

    info!(
        "RUDP relay listening: rudp={} control={} http={}",
        config.rudp_port, config.control_port, config.http_port
    );

    while !reactor.is_empty() {
        if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
            info!("closing RUDP server...");
            reactor.init_close();
            shutdown.store(false, std::sync::atomic::Ordering::Relaxed);
        }
        match reactor.run_once() {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => reactor.init_close(),
            Err(err) => {
                log::error!("fatal reactor error, terminating: {}", err);
                reactor.terminate();
                return Err(rudp_relay::RudpError::Io(err));
            }
        }
    }
    info!("RUDP server terminated");
    Ok(())
}

fn main() {
    let args = Args::parse();
    if args.daemon {
        if let Err(err) = daemonize() {
            eprintln!("failed to daemonize: {}", err);
            std::process::exit(1);
        }
    }
    init_log(&args.log, args.log_level);
    if let Err(err) = run(args) {
        log::error!("fatal error: {}", err);
        std::process::exit(1);
    }
}
