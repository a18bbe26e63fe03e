//! Non-blocking TCP stream and listener wrappers.
//!
//! Generalizes the teacher's `net::tcp::{TcpStream, TcpListener}` with an
//! explicit connect-state machine: the teacher never originates outbound
//! connections (it only wraps accepted/already-connected sockets), but the
//! Answerer side of a relayed connection has to dial the destination itself.

use std::io::{self, Read, Write};
use std::net::{self, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, warn};

use crate::ready::Ready;

/// Where a [`TcpStream`] is in its non-blocking connect sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// Not yet attempted; the next OUT readiness issues `connect()`.
    BeforeConnect,
    /// Connect issued, in progress; the next OUT readiness checks the result.
    Connecting,
    /// Connect finished successfully.
    Connected,
}

/// Buffering and backpressure state shared by every stream variant
/// (`ControlStream`, `DataStream`, `HttpStream`), composed in rather than
/// inherited, per the flattening of the source's subclass hierarchy.
#[derive(Debug)]
pub struct TcpCore {
    pub recv_buf: Vec<u8>,
    pub send_buf: Vec<u8>,
    block_size: usize,
    buff_limit: usize,
    closing: bool,
    terminated: bool,
    disconnected: bool,
}

impl TcpCore {
    pub fn new(block_size: usize, buff_limit: usize) -> TcpCore {
        TcpCore {
            recv_buf: Vec::new(),
            send_buf: Vec::new(),
            block_size,
            buff_limit,
            closing: false,
            terminated: false,
            disconnected: false,
        }
    }

    /// False once the receive buffer has hit its limit: exerts backpressure
    /// on the peer by withdrawing read interest until the buffer drains.
    pub fn receiving(&self) -> bool {
        !self.closing && self.recv_buf.len() < self.buff_limit
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    pub fn init_close(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Drains `inner` into `recv_buf` in `block_size` chunks until
    /// `WouldBlock`, EOF, or the buffer limit is hit. Returns whether the
    /// peer disconnected (EOF or reset).
    fn fill_from<R: Read>(&mut self, inner: &mut R) -> bool {
        let mut chunk = vec![0u8; self.block_size];
        loop {
            if self.recv_buf.len() >= self.buff_limit {
                return false;
            }
            match inner.read(&mut chunk) {
                Ok(0) => return true,
                Ok(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_disconnect(&err) => return true,
                Err(err) => {
                    warn!("tcp read error: {}", err);
                    return true;
                }
            }
        }
    }

    /// Best-effort drain of `send_buf` into `inner`. Partial writes resume on
    /// the next OUT readiness since unsent bytes stay queued.
    fn drain_to<W: Write>(&mut self, inner: &mut W) {
        while !self.send_buf.is_empty() {
            match inner.write(&self.send_buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.send_buf.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("tcp write error: {}", err);
                    self.terminated = true;
                    break;
                }
            }
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

/// A non-blocking TCP stream, optionally mid-connect.
#[derive(Debug)]
pub struct TcpStream {
    inner: net::TcpStream,
    pub core: TcpCore,
    connect_state: ConnectState,
    peer_addr: SocketAddr,
}

impl TcpStream {
    /// Wrap an already-connected socket (the accept-side case).
    pub fn from_connected(inner: net::TcpStream, block_size: usize, buff_limit: usize) -> io::Result<TcpStream> {
        inner.set_nonblocking(true)?;
        let peer_addr = inner.peer_addr()?;
        Ok(TcpStream {
            inner,
            core: TcpCore::new(block_size, buff_limit),
            connect_state: ConnectState::Connected,
            peer_addr,
        })
    }

    /// Begin a non-blocking outbound connect to `addr` (the dial-side case,
    /// used by the Answerer to reach the relay's destination).
    pub fn connect<A: ToSocketAddrs>(addr: A, block_size: usize, buff_limit: usize) -> io::Result<TcpStream> {
        let peer_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no socket address resolved"))?;
        let socket = net2_connect(peer_addr)?;
        Ok(TcpStream {
            inner: socket,
            core: TcpCore::new(block_size, buff_limit),
            connect_state: ConnectState::BeforeConnect,
            peer_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connect_state == ConnectState::Connected
    }

    pub fn queue_send(&mut self, data: &[u8]) {
        self.core.send_buf.extend_from_slice(data);
    }

    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.core.recv_buf)
    }

    pub fn io_mask(&self) -> Ready {
        let mut mask = Ready::error();
        match self.connect_state {
            ConnectState::BeforeConnect | ConnectState::Connecting => {
                mask.insert(Ready::writable());
            }
            ConnectState::Connected => {
                if self.core.has_pending_send() {
                    mask.insert(Ready::writable());
                }
                if self.core.receiving() {
                    mask.insert(Ready::readable());
                }
            }
        }
        mask
    }

    /// Advances the connect state machine on writable readiness; returns
    /// true once a transition to `Connected` just happened this call.
    pub fn drive_connect(&mut self) -> bool {
        match self.connect_state {
            ConnectState::BeforeConnect => {
                match self.inner.connect(self.peer_addr) {
                    Ok(()) => {
                        self.connect_state = ConnectState::Connected;
                        true
                    }
                    Err(err) if connect_in_progress(&err) => {
                        self.connect_state = ConnectState::Connecting;
                        false
                    }
                    Err(err) => {
                        warn!("connect to {} failed: {}", self.peer_addr, err);
                        self.core.terminated = true;
                        false
                    }
                }
            }
            ConnectState::Connecting => match self.inner.take_error() {
                Ok(None) => {
                    self.connect_state = ConnectState::Connected;
                    true
                }
                Ok(Some(err)) => {
                    warn!("connect to {} failed: {}", self.peer_addr, err);
                    self.core.terminated = true;
                    false
                }
                Err(err) => {
                    warn!("connect to {} failed: {}", self.peer_addr, err);
                    self.core.terminated = true;
                    false
                }
            },
            ConnectState::Connected => false,
        }
    }

    pub fn read(&mut self) {
        if self.connect_state != ConnectState::Connected {
            return;
        }
        if self.core.fill_from(&mut self.inner) {
            debug!("tcp stream {} disconnected", self.peer_addr);
            self.core.terminated = true;
        }
    }

    /// Returns `true` the one time this call drives `connect_state` from
    /// `BeforeConnect`/`Connecting` to `Connected`, so a caller pairing this
    /// stream with a `Connection` can fire `approve_data_socket` exactly
    /// once, right when the transition happens rather than guessing at it
    /// from the next `update()`.
    pub fn write(&mut self) -> bool {
        match self.connect_state {
            ConnectState::Connected => {
                self.core.drain_to(&mut self.inner);
                false
            }
            _ => self.drive_connect(),
        }
    }

    pub fn update(&mut self) {
        if self.core.closing && !self.core.has_pending_send() {
            self.core.terminated = true;
        }
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    // There is no ErrorKind for EINPROGRESS.
    matches!(err.raw_os_error(), Some(code) if code == libc::EINPROGRESS)
}

/// Opens a non-blocking socket and issues `connect()` immediately, the same
/// `set_nonblocking` + raw `connect(2)` sequence as the teacher's
/// `sys::socket::Socket::connect_timeout`, minus the blocking poll loop: our
/// Reactor drives the rest of the handshake through `drive_connect`.
fn net2_connect(addr: SocketAddr) -> io::Result<net::TcpStream> {
    use std::mem::size_of_val;
    use std::os::unix::io::FromRawFd;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let stream = unsafe { net::TcpStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;

    let ret = match addr {
        SocketAddr::V4(a) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::connect(
                    fd,
                    &raw as *const _ as *const libc::sockaddr,
                    size_of_val(&raw) as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(a) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                libc::connect(
                    fd,
                    &raw as *const _ as *const libc::sockaddr,
                    size_of_val(&raw) as libc::socklen_t,
                )
            }
        }
    };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if !connect_in_progress(&err) {
            return Err(err);
        }
    }
    Ok(stream)
}

/// A non-blocking listening socket; on IN readiness, accepts one connection.
#[derive(Debug)]
pub struct TcpListener {
    inner: net::TcpListener,
}

impl TcpListener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
        let inner = net::TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(TcpListener { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts at most one connection; `Ok(None)` means no pending
    /// connection right now (WouldBlock), not an error.
    pub fn accept(&self) -> io::Result<Option<(net::TcpStream, SocketAddr)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(true)?;
                Ok(Some((stream, addr)))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Closes both halves of `stream` without surfacing an error if it is
/// already gone; used by pairings that need to tear down a raw socket handle
/// outside the `TcpStream` wrapper (e.g. an aborted accept).
pub fn shutdown_quietly(stream: &net::TcpStream) {
    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;

    #[test]
    fn accept_returns_none_when_no_pending_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn stream_from_connected_pair_round_trips_data() {
        let std_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let client = net::TcpStream::connect(addr).unwrap();
        let (server, _) = std_listener.accept().unwrap();

        let mut client_stream = TcpStream::from_connected(client, 64, 4096).unwrap();
        let mut server_stream = TcpStream::from_connected(server, 64, 4096).unwrap();

        client_stream.queue_send(b"hello");
        client_stream.write();

        std::thread::sleep(std::time::Duration::from_millis(20));
        server_stream.read();
        assert_eq!(server_stream.take_received(), b"hello");
    }

    #[test]
    fn io_mask_requests_write_while_send_buffer_nonempty() {
        let std_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let client = net::TcpStream::connect(addr).unwrap();
        let mut stream = TcpStream::from_connected(client, 64, 4096).unwrap();
        assert!(!stream.io_mask().is_writable());
        stream.queue_send(b"x");
        assert!(stream.io_mask().is_writable());
    }
}
