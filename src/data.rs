//! Data TCP bridge: one TCPStream paired one-to-one with a Connection, and
//! the listener that spins up that pairing for locally-initiated flows.
//!
//! Grounded on `Server/dataserver.py::DataSocket`/`DataListener`.

use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::info;

use crate::error::Result;
use crate::reactor::{Pollable, SpawnQueue};
use crate::ready::Ready;
use crate::rudp::{Connection, DatagramMux};
use crate::tcp::TcpStream;

/// Shared state behind a [`DataStream`], kept out of the `Pollable` wrapper
/// itself so both `Connection` (dial path) and `DataListener` (accept path)
/// can hold a plain `Rc<RefCell<..>>` to it before it is ever registered
/// with the Reactor.
pub struct DataStreamInner {
    tcp: TcpStream,
    connection: Option<Rc<RefCell<Connection>>>,
}

impl DataStreamInner {
    fn new(tcp: TcpStream) -> DataStreamInner {
        DataStreamInner { tcp, connection: None }
    }

    pub fn attach_connection(&mut self, connection: Rc<RefCell<Connection>>) {
        self.connection = Some(connection);
    }

    /// Bytes arriving from the Connection (DATA frames) are queued straight
    /// onto the TCP send buffer.
    pub fn queue_send(&mut self, data: &[u8]) {
        self.tcp.queue_send(data);
    }

    pub fn is_closing(&self) -> bool {
        self.tcp.core.is_closing()
    }

    pub fn init_close(&mut self) {
        self.tcp.core.init_close();
    }

    fn fd(&self) -> RawFd {
        self.tcp.as_raw_fd()
    }

    /// Forwards TCP-received bytes to the Connection unless the handshake
    /// is still in flight (spec.md §4.6 backpressure composition).
    fn read(&mut self) {
        self.tcp.read();
        let blocked = self
            .connection
            .as_ref()
            .map(|c| c.borrow().is_handshake_blocking())
            .unwrap_or(true);
        if blocked {
            return;
        }
        let received = self.tcp.take_received();
        if received.is_empty() {
            return;
        }
        if let Some(conn) = &self.connection {
            conn.borrow_mut().queue_buffer(&received);
        }
    }

    /// Also the only place `connect_state` ever advances to `Connected`
    /// (via `drive_connect`, called from here for the not-yet-connected
    /// cases); that's exactly when the Answerer's dial to the destination
    /// has succeeded, so `approve_data_socket` fires right off the `true`
    /// return instead of being inferred later from `update()`.
    fn write(&mut self) {
        let just_connected = self.tcp.write();
        if just_connected {
            if let Some(conn) = &self.connection {
                conn.borrow_mut().approve_data_socket();
            }
        }
    }

    /// Becomes readable again once the handshake clears, even though no new
    /// socket event fired in the meantime; `receiving()` folds that in via
    /// `io_mask`.
    fn io_mask(&self) -> Ready {
        let mut mask = self.tcp.io_mask();
        let blocked = self
            .connection
            .as_ref()
            .map(|c| c.borrow().is_handshake_blocking())
            .unwrap_or(true);
        if blocked {
            mask = mask.intersection_without_readable();
        }
        mask
    }

    fn update(&mut self) {
        self.tcp.update();
    }

    fn is_terminated(&self) -> bool {
        self.tcp.core.is_terminated()
    }

    fn terminate(&mut self) {
        self.tcp.core.terminate();
        if let Some(conn) = self.connection.take() {
            if !conn.borrow().is_closing() {
                conn.borrow_mut().init_close(true);
            }
        }
    }
}

/// Dials the destination for an Answerer-side Connection. `connection.rs`
/// stores the returned handle, attaches itself to it, and hands the wrapped
/// `DataStream` to the Connection's spawn queue for Reactor registration.
pub fn dial(addr: SocketAddr, block_size: usize, buff_limit: usize) -> Result<Rc<RefCell<DataStreamInner>>> {
    let tcp = TcpStream::connect(addr, block_size, buff_limit)?;
    Ok(Rc::new(RefCell::new(DataStreamInner::new(tcp))))
}

/// Thin `Pollable`/`Display` wrapper; the real state lives in
/// [`DataStreamInner`] so the orphan-rule-safe newtype pattern applies the
/// same way it does for [`MuxPollable`](crate::rudp::mux::MuxPollable).
pub struct DataStream(Rc<RefCell<DataStreamInner>>);

impl DataStream {
    pub fn new(inner: Rc<RefCell<DataStreamInner>>) -> DataStream {
        DataStream(inner)
    }
}

impl fmt::Display for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Data Socket ({})", self.0.borrow().fd())
    }
}

impl Pollable for DataStream {
    fn fd(&self) -> RawFd {
        self.0.borrow().fd()
    }
    fn io_mask(&self) -> Ready {
        self.0.borrow().io_mask()
    }
    fn sleep_time(&self) -> Duration {
        Duration::from_millis(0)
    }
    fn read(&mut self) {
        self.0.borrow_mut().read();
    }
    fn write(&mut self) {
        self.0.borrow_mut().write();
    }
    fn update(&mut self) {
        self.0.borrow_mut().update();
    }
    fn init_close(&mut self) {
        self.0.borrow_mut().init_close();
    }
    fn is_terminated(&self) -> bool {
        self.0.borrow().is_terminated()
    }
    fn terminate(&mut self) {
        self.0.borrow_mut().terminate();
    }
}

/// Accepts local TCP connections and opens a matching Initiator Connection
/// for each, through the owning mux's `init_connection`. TTL-bound: `None`
/// means infinite, matching `ttl=0` in the control protocol.
pub struct DataListener {
    listener: crate::tcp::TcpListener,
    exit_peer: SocketAddr,
    dest: SocketAddr,
    deadline: Option<Instant>,
    closing: bool,
    terminated: bool,
    mux: Rc<RefCell<DatagramMux>>,
    spawn_queue: SpawnQueue,
    block_size: usize,
    buff_limit: usize,
}

impl DataListener {
    pub fn bind(
        bind_addr: SocketAddr,
        exit_peer: SocketAddr,
        dest: SocketAddr,
        ttl: Option<Duration>,
        mux: Rc<RefCell<DatagramMux>>,
        spawn_queue: SpawnQueue,
        block_size: usize,
        buff_limit: usize,
    ) -> Result<DataListener> {
        let listener = crate::tcp::TcpListener::bind(bind_addr)?;
        Ok(DataListener {
            listener,
            exit_peer,
            dest,
            deadline: ttl.map(|ttl| Instant::now() + ttl),
            closing: false,
            terminated: false,
            mux,
            spawn_queue,
            block_size,
            buff_limit,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl fmt::Display for DataListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Data Listener Socket ({})", self.listener.as_raw_fd())
    }
}

impl Pollable for DataListener {
    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn io_mask(&self) -> Ready {
        let mut mask = Ready::error();
        if !self.closing {
            mask.insert(Ready::readable());
        }
        mask
    }

    fn sleep_time(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(u64::MAX),
        }
    }

    fn read(&mut self) {
        match self.listener.accept() {
            Ok(Some((stream, local_addr))) => match TcpStream::from_connected(stream, self.block_size, self.buff_limit)
            {
                Ok(tcp) => {
                    let inner = Rc::new(RefCell::new(DataStreamInner::new(tcp)));
                    let connection = self.mux.borrow_mut().init_connection(
                        self.exit_peer,
                        local_addr,
                        self.dest,
                        inner.clone(),
                    );
                    match connection {
                        Ok(connection) => {
                            inner.borrow_mut().attach_connection(connection);
                            let _ = self.spawn_queue.push(Box::new(DataStream::new(inner)));
                        }
                        Err(err) => {
                            info!("{}: failed to open connection for accepted client: {}", self, err);
                        }
                    }
                }
                Err(err) => {
                    info!("{}: failed to wrap accepted socket: {}", self, err);
                }
            },
            Ok(None) => {}
            Err(err) => {
                info!("{}: accept failed: {}", self, err);
            }
        }
    }

    fn write(&mut self) {}

    fn update(&mut self) {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.closing = true;
            }
        }
        if self.closing {
            self.terminated = true;
        }
    }

    fn init_close(&mut self) {
        self.closing = true;
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}
