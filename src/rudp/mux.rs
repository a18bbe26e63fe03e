//! Single non-blocking UDP socket multiplexing many logical connections,
//! routed by `(peer address, CID)`.
//!
//! Grounded on `Server/rudpmanager.py::RUDPManager`. The per-peer CID table
//! is a plain [`IndexMap`] rather than a `slab::Slab`: an Answerer-side
//! connection is keyed by whatever CID the Initiator put on the wire, which
//! has to land at an arbitrary, externally chosen key — an operation
//! `slab` has no API for (it only ever hands back the next vacant key it
//! picked itself). CID allocation for connections *we* initiate still does
//! the lowest-free scan `find_cid` in the Python does, bounded by
//! `max_connections`, which the spec's Open Question explicitly allows.

use std::cell::RefCell;
use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use concurrent_queue::ConcurrentQueue;
use indexmap::IndexMap;
use log::{debug, info, warn};
use rand::Rng;

use crate::config::Config;
use crate::data::DataStreamInner;
use crate::error::{RudpError, Result};
use crate::reactor::{Pollable, SpawnQueue};
use crate::ready::Ready;
use crate::rudp::connection::{CloseQueue, Connection, ConnectionTunables, SendQueue};
use crate::rudp::wire::{Flag, Packet, MAX_DATAGRAM_SIZE};
use crate::stats::{ConnectionStats, TotalStats};

fn tunables_from_config(config: &Config) -> ConnectionTunables {
    ConnectionTunables {
        retry_interval: config.retry_interval,
        retry_count: config.retry_count,
        keep_alive_interval: config.keep_alive_interval,
        connection_approval_interval: config.connection_approval_interval,
        data_length: config.data_length,
        data_block_size: config.data_block_size,
        data_buff_limit: config.data_buff_limit,
        default_keep_alive_interval: Config::default().keep_alive_interval,
    }
}

pub struct DatagramMux {
    socket: UdpSocket,
    connections: IndexMap<SocketAddr, IndexMap<u32, Rc<RefCell<Connection>>>>,
    send_queue: SendQueue,
    spawn_queue: SpawnQueue,
    close_queue: CloseQueue,
    random_drop: u8,
    max_connections: u32,
    tunables: ConnectionTunables,
    default_timeout: Duration,
    closing: bool,
    terminated: bool,
}

impl DatagramMux {
    pub fn bind(bind_addr: SocketAddr, config: &Config, send_queue: SendQueue, spawn_queue: SpawnQueue) -> Result<DatagramMux> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        Ok(DatagramMux {
            socket,
            connections: IndexMap::new(),
            send_queue,
            spawn_queue,
            close_queue: Rc::new(ConcurrentQueue::unbounded()),
            random_drop: config.random_drop,
            max_connections: config.max_connections,
            tunables: tunables_from_config(config),
            default_timeout: config.reactor_timeout,
            closing: false,
            terminated: false,
        })
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Lowest CID in `[0, max_connections)` unused in `peer`'s table,
    /// matching `find_cid`'s linear scan over the *live* table (so it can
    /// never collide with a CID an Answerer connection already occupies).
    fn find_cid(&self, peer: SocketAddr) -> Option<u32> {
        let table = self.connections.get(&peer);
        for cid in 0..self.max_connections {
            if table.map(|t| t.contains_key(&cid)).unwrap_or(false) {
                continue;
            }
            return Some(cid);
        }
        None
    }

    /// External operation from spec.md §4.7: allocates the lowest unused
    /// CID for `exit_peer`, constructs an Initiator [`Connection`], and
    /// sends its handshake INIT.
    pub fn init_connection(
        &mut self,
        exit_peer: SocketAddr,
        initiator: SocketAddr,
        endpoint: SocketAddr,
        data_socket: Rc<RefCell<DataStreamInner>>,
    ) -> Result<Rc<RefCell<Connection>>> {
        let cid = match self.find_cid(exit_peer) {
            Some(cid) => cid,
            None => {
                warn!("couldn't accept connection, maximum connections reached for peer {}", exit_peer);
                data_socket.borrow_mut().init_close();
                return Err(RudpError::ResourceExhausted("maximum connections reached".into()));
            }
        };
        info!(
            "creating new connection: RUDP peer: {}; CID: {}; initiating user: {}; target user: {}",
            exit_peer, cid, initiator, endpoint
        );
        let conn = Rc::new_cyclic(|weak| {
            RefCell::new(Connection::new_initiator(
                weak,
                exit_peer,
                cid,
                initiator,
                endpoint,
                self.tunables.clone(),
                self.send_queue.clone(),
                self.spawn_queue.clone(),
                self.close_queue.clone(),
            ))
        });
        conn.borrow_mut().attach_data_stream(data_socket);
        self.connections.entry(exit_peer).or_insert_with(IndexMap::new).insert(cid, conn.clone());
        conn.borrow_mut().connect_to_remote();
        Ok(conn)
    }

    /// External operation from spec.md §4.7: idempotent removal.
    pub fn close_connection(&mut self, peer: SocketAddr, cid: u32) {
        if let Some(table) = self.connections.get_mut(&peer) {
            if table.shift_remove(&cid).is_some() {
                info!("connection {}, {} closed", peer, cid);
            }
            if table.is_empty() {
                self.connections.shift_remove(&peer);
            }
        }
    }

    pub fn total_stats(&self) -> TotalStats {
        TotalStats {
            number_of_connections: self.connections.values().map(|t| t.len()).sum(),
        }
    }

    pub fn connection_stats(&self, peer: SocketAddr, cid: u32) -> Option<ConnectionStats> {
        let conn = self.connections.get(&peer)?.get(&cid)?.borrow();
        Some(ConnectionStats {
            bytes_sent: conn.bytes_sent(),
            bytes_received: conn.bytes_received(),
            sequence_number: conn.sequence_num(),
            peer_sequence_number: conn.peer_sequence_num(),
            close_user: conn.close_user(),
            remote_user: conn.remote_user(),
        })
    }

    /// Overview of every live connection, for the HTTP connections table.
    pub fn connections_overview(&self) -> Vec<(SocketAddr, u32, ConnectionStats)> {
        let mut out = Vec::new();
        for (peer, table) in &self.connections {
            for (cid, conn) in table {
                let conn = conn.borrow();
                out.push((
                    *peer,
                    *cid,
                    ConnectionStats {
                        bytes_sent: conn.bytes_sent(),
                        bytes_received: conn.bytes_received(),
                        sequence_number: conn.sequence_num(),
                        peer_sequence_number: conn.peer_sequence_num(),
                        close_user: conn.close_user(),
                        remote_user: conn.remote_user(),
                    },
                ));
            }
        }
        out
    }

    fn io_mask(&self) -> Ready {
        let mut mask = Ready::error();
        if !self.closing {
            mask.insert(Ready::readable());
        }
        if !self.send_queue.is_empty() {
            mask.insert(Ready::writable());
        }
        mask
    }

    fn sleep_time(&self) -> Duration {
        let mut t = self.default_timeout;
        for table in self.connections.values() {
            for conn in table.values() {
                t = t.min(conn.borrow().sleep_time(self.default_timeout));
            }
        }
        t
    }

    /// One non-blocking `recvfrom`, per spec.md §4.4's receive path: "Read
    /// one datagram." A level-triggered poller re-reports readiness
    /// immediately if the kernel socket buffer still has more queued.
    fn read(&mut self) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        match self.socket.recv_from(&mut buf) {
            Ok((n, peer)) => self.handle_datagram(peer, &buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => warn!("rudp socket recv error: {}", err),
        }
    }

    fn handle_datagram(&mut self, peer: SocketAddr, raw: &[u8]) {
        if self.random_drop > 0 && rand::thread_rng().gen_range(0..100) < self.random_drop as u32 {
            info!("packet from RUDP server {} dropped for testing purposes", peer);
            return;
        }
        let pkt = match Packet::decode(raw) {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!("malformed datagram from {}: {}", peer, err);
                return;
            }
        };
        info!("received packet from RUDP server {}, with CID {}", peer, pkt.cid);
        if self.closing {
            return;
        }

        let existing = self.connections.get(&peer).and_then(|t| t.get(&pkt.cid)).cloned();
        let conn = match existing {
            Some(conn) => conn,
            None if pkt.flag == Flag::Init && !pkt.data.is_empty() => {
                info!("unknown RUDP address {}, {} with init flag, creating new connection", peer, pkt.cid);
                let conn = Rc::new_cyclic(|weak| {
                    RefCell::new(Connection::new_answerer(
                        weak,
                        peer,
                        pkt.cid,
                        self.tunables.clone(),
                        self.send_queue.clone(),
                        self.spawn_queue.clone(),
                        self.close_queue.clone(),
                    ))
                });
                self.connections.entry(peer).or_insert_with(IndexMap::new).insert(pkt.cid, conn.clone());
                conn
            }
            None => {
                debug!("unknown RUDP address {}, {}, discarding packet", peer, pkt.cid);
                return;
            }
        };
        conn.borrow_mut().receive_datagram(pkt);
    }

    /// Drains the send queue. Matches `rudpmanager.py::write`'s behavior of
    /// popping a queued datagram before attempting `sendto`: on the rare
    /// `WouldBlock` a UDP socket can report, that datagram is dropped
    /// rather than requeued, exactly as the original does.
    fn write(&mut self) {
        while let Ok(d) = self.send_queue.pop() {
            match self.socket.send_to(&d.bytes, d.peer) {
                Ok(_) => {
                    if let Some(conn) = d.connection.upgrade() {
                        let payload_start = d.bytes.len() - d.data_len;
                        conn.borrow_mut().datagram_sent(d.flag, d.sqn, &d.bytes[payload_start..], d.is_retry);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    warn!("rudp socket send to {} would block, dropping queued datagram", d.peer);
                }
                Err(err) => warn!("rudp socket send error to {}: {}", d.peer, err),
            }
        }
    }

    /// Per-iteration: advance every Connection, then remove whichever ones
    /// called `init_close` (here or during `receive_datagram`/`write`
    /// earlier this same iteration), and terminate once closing with
    /// nothing left to drain (spec.md §4.4 Shutdown).
    fn update(&mut self) {
        for table in self.connections.values() {
            for conn in table.values() {
                conn.borrow_mut().update();
            }
        }
        self.drain_close_queue();
        if self.closing && self.connections.is_empty() && self.send_queue.is_empty() {
            self.terminated = true;
        }
    }

    /// Performs the removal a closed `Connection` can't safely trigger
    /// itself (see [`CloseQueue`]'s doc comment): this is the only caller
    /// of `close_connection`.
    fn drain_close_queue(&mut self) {
        while let Ok((peer, cid)) = self.close_queue.pop() {
            self.close_connection(peer, cid);
        }
    }

    fn init_close(&mut self) {
        self.closing = true;
        for table in self.connections.values() {
            for conn in table.values() {
                if !conn.borrow().is_closing() {
                    conn.borrow_mut().init_close(true);
                }
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

/// Thin `Pollable`/`Display` wrapper over a shared [`DatagramMux`], the same
/// newtype split `data::DataStream`/`DataStreamInner` uses: other owners
/// (`DataListener`, the control/HTTP surfaces) hold the `Rc<RefCell<..>>`
/// directly, while only one `MuxPollable` is ever registered with the
/// Reactor.
pub struct MuxPollable(Rc<RefCell<DatagramMux>>);

impl MuxPollable {
    pub fn new(mux: Rc<RefCell<DatagramMux>>) -> MuxPollable {
        MuxPollable(mux)
    }
}

impl fmt::Display for MuxPollable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RUDP Connection Manager ({})", self.0.borrow().fd())
    }
}

impl Pollable for MuxPollable {
    fn fd(&self) -> RawFd {
        self.0.borrow().fd()
    }
    fn io_mask(&self) -> Ready {
        self.0.borrow().io_mask()
    }
    fn sleep_time(&self) -> Duration {
        self.0.borrow().sleep_time()
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

#[cfg(test)]
mod tests {
    use super::*;
    use concurrent_queue::ConcurrentQueue;
    use std::net::Ipv4Addr;

    fn mux_at(port: u16) -> DatagramMux {
        let config = Config::default();
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
        let send_queue: SendQueue = Rc::new(ConcurrentQueue::unbounded());
        let spawn_queue: SpawnQueue = Rc::new(ConcurrentQueue::unbounded());
        DatagramMux::bind(addr, &config, send_queue, spawn_queue).unwrap()
    }

    #[test]
    fn find_cid_picks_lowest_free_slot() {
        let mux = mux_at(0);
        let peer = SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 1026);
        assert_eq!(mux.find_cid(peer), Some(0));
    }

    #[test]
    fn handle_datagram_with_empty_init_for_unknown_cid_is_discarded() {
        let mut mux = mux_at(0);
        let peer = SocketAddr::new(Ipv4Addr::new(10, 0, 0, 2).into(), 1026);
        let pkt = Packet::new(5, Flag::Init, 0, Vec::new());
        mux.handle_datagram(peer, &pkt.encode());
        assert!(mux.connections.is_empty());
    }

    #[test]
    fn handle_datagram_with_init_payload_for_unknown_cid_creates_answerer() {
        let mut mux = mux_at(0);
        let peer = SocketAddr::new(Ipv4Addr::new(10, 0, 0, 3).into(), 1026);
        let payload = b"Source Address:1.2.3.4\nSource Port:10\nDestination Address:5.6.7.8\nDestination Port:20\n".to_vec();
        let pkt = Packet::new(1, Flag::Init, 0, payload);
        mux.handle_datagram(peer, &pkt.encode());
        assert!(mux.connections.get(&peer).unwrap().contains_key(&1));
    }

    #[test]
    fn total_stats_counts_across_peers() {
        let mut mux = mux_at(0);
        let peer_a = SocketAddr::new(Ipv4Addr::new(10, 0, 0, 4).into(), 1026);
        let peer_b = SocketAddr::new(Ipv4Addr::new(10, 0, 0, 5).into(), 1026);
        let payload = b"Source Address:1.2.3.4\nSource Port:10\nDestination Address:5.6.7.8\nDestination Port:20\n".to_vec();
        mux.handle_datagram(peer_a, &Packet::new(0, Flag::Init, 0, payload.clone()).encode());
        mux.handle_datagram(peer_b, &Packet::new(0, Flag::Init, 0, payload).encode());
        assert_eq!(mux.total_stats().number_of_connections, 2);
    }
}
