//! Per-flow protocol state machine: handshake, reliable delivery of a single
//! in-flight frame, keep-alive, retransmission, and close.
//!
//! Grounded on `Server/rudpconnection.py::RUDPConnection`. A `Connection` is
//! owned by the `DatagramMux` table it lives in; it reaches its paired
//! `DataStream` through an `Option<Rc<RefCell<..>>>` that both sides null out
//! on close, breaking what would otherwise be a permanent reference cycle
//! (DESIGN NOTES §9).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::{debug, info, warn};
use rand::Rng;

use crate::data::DataStreamInner;
use crate::error::{RudpError, Result};
use crate::reactor::SpawnQueue;
use crate::rudp::wire::{Flag, MAX_DATA_LEN};

/// FIFO entry the mux drains to actually `sendto` a frame, tagged with
/// enough to call `Connection::datagram_sent` back once it's really on the
/// wire (`Server/rudpmanager.py`'s `_queued_datagrams` list of
/// `(connection, datagram, params)` tuples).
pub struct OutboundDatagram {
    pub peer: SocketAddr,
    pub bytes: Vec<u8>,
    pub flag: Flag,
    pub sqn: u32,
    pub data_len: usize,
    pub is_retry: bool,
    pub connection: Weak<RefCell<Connection>>,
}

pub type SendQueue = Rc<ConcurrentQueue<OutboundDatagram>>;

/// `(peer, cid)` pairs a closed `Connection` hands to the mux for removal.
/// `Connection` cannot call `DatagramMux::close_connection` back directly —
/// it's reached through the same `Rc<RefCell<DatagramMux>>` the mux's own
/// dispatch methods are already borrowing mutably whenever a `Connection`'s
/// `init_close` runs from inside `receive_datagram`/`update`/`init_close`,
/// so a direct callback would panic on the re-entrant `borrow_mut`. Queueing
/// it, the same way `SpawnQueue` sidesteps the equivalent problem for the
/// Reactor, lets the mux perform the removal itself once it's done
/// iterating.
pub type CloseQueue = Rc<ConcurrentQueue<(SocketAddr, u32)>>;

/// The seven states from spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    InitInitiator,
    InitAnswerer,
    WaitingForInitAck,
    WaitingConnectStatus,
    WaitingRemoteConnectionApproval,
    WaitingForAck,
    ReadyForSend,
}

impl ConnState {
    /// The set in which a paired DataStream must withhold forwarding and
    /// exert backpressure (spec.md §4.6, pinned against the real
    /// `_WAITING_REMOTE_CONNECTION_APPROVAL` constant rather than the
    /// original's typo'd, nonexistent `_WAITING_CONNECTION_APPROVAL`).
    pub fn is_handshake_blocking(self) -> bool {
        matches!(
            self,
            ConnState::WaitingForAck | ConnState::WaitingForInitAck | ConnState::WaitingRemoteConnectionApproval
        )
    }
}

/// Tunables a Connection needs, threaded in at construction instead of
/// reaching for `crate::config::Config` globals.
#[derive(Debug, Clone)]
pub struct ConnectionTunables {
    pub retry_interval: Duration,
    pub retry_count: u32,
    pub keep_alive_interval: Duration,
    pub connection_approval_interval: Duration,
    pub data_length: usize,
    pub data_block_size: usize,
    pub data_buff_limit: usize,
    pub default_keep_alive_interval: Duration,
}

pub struct Connection {
    peer: SocketAddr,
    cid: u32,
    state: ConnState,
    sequence_num: u32,
    peer_sequence_num: Option<u32>,
    close_user: Option<SocketAddr>,
    remote_user: Option<SocketAddr>,
    data_stream: Option<Rc<RefCell<DataStreamInner>>>,

    tunables: ConnectionTunables,
    jittered_keep_alive: Duration,

    next_keepalive: Option<Instant>,
    next_retransmit: Option<Instant>,
    give_up_deadline: Option<Instant>,
    last_sent: Option<(Flag, u32, Vec<u8>)>,
    send_buff: VecDeque<u8>,
    retries_used: u32,
    bytes_sent: u64,
    bytes_received: u64,
    closing: bool,

    send_queue: SendQueue,
    spawn_queue: SpawnQueue,
    close_queue: CloseQueue,
    self_ref: Weak<RefCell<Connection>>,
}

impl Connection {
    /// Constructs an Initiator connection (role: locally opened) and wires
    /// its self-reference so it can tag outbound datagrams for the mux's
    /// `datagram_sent` callback. Must be built with `Rc::new_cyclic`.
    pub fn new_initiator(
        weak: &Weak<RefCell<Connection>>,
        peer: SocketAddr,
        cid: u32,
        close_user: SocketAddr,
        remote_user: SocketAddr,
        tunables: ConnectionTunables,
        send_queue: SendQueue,
        spawn_queue: SpawnQueue,
        close_queue: CloseQueue,
    ) -> Connection {
        let jittered_keep_alive = jitter(&tunables);
        let conn = Connection {
            peer,
            cid,
            state: ConnState::InitInitiator,
            sequence_num: 0,
            peer_sequence_num: None,
            close_user: Some(close_user),
            remote_user: Some(remote_user),
            data_stream: None,
            tunables,
            jittered_keep_alive,
            next_keepalive: None,
            next_retransmit: None,
            give_up_deadline: None,
            last_sent: None,
            send_buff: VecDeque::new(),
            retries_used: 0,
            bytes_sent: 0,
            bytes_received: 0,
            closing: false,
            send_queue,
            spawn_queue,
            close_queue,
            self_ref: weak.clone(),
        };
        info!("{}: Initialized", conn);
        conn
    }

    /// Constructs an Answerer connection (role: created on remote INIT).
    /// `close_user`/`remote_user` are unknown until the INIT payload is
    /// parsed in `receive_init`.
    pub fn new_answerer(
        weak: &Weak<RefCell<Connection>>,
        peer: SocketAddr,
        cid: u32,
        tunables: ConnectionTunables,
        send_queue: SendQueue,
        spawn_queue: SpawnQueue,
        close_queue: CloseQueue,
    ) -> Connection {
        let jittered_keep_alive = jitter(&tunables);
        let conn = Connection {
            peer,
            cid,
            state: ConnState::InitAnswerer,
            sequence_num: 0,
            peer_sequence_num: None,
            close_user: None,
            remote_user: None,
            data_stream: None,
            tunables,
            jittered_keep_alive,
            next_keepalive: None,
            next_retransmit: None,
            give_up_deadline: None,
            last_sent: None,
            send_buff: VecDeque::new(),
            retries_used: 0,
            bytes_sent: 0,
            bytes_received: 0,
            closing: false,
            send_queue,
            spawn_queue,
            close_queue,
            self_ref: weak.clone(),
        };
        info!("{}: Initialized", conn);
        conn
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_handshake_blocking(&self) -> bool {
        self.state.is_handshake_blocking()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn sequence_num(&self) -> u32 {
        self.sequence_num
    }

    pub fn peer_sequence_num(&self) -> Option<u32> {
        self.peer_sequence_num
    }

    pub fn close_user(&self) -> Option<SocketAddr> {
        self.close_user
    }

    pub fn remote_user(&self) -> Option<SocketAddr> {
        self.remote_user
    }

    /// Attaches the paired DataStream after both sides exist (the Initiator
    /// path: the DataStream is constructed first by the accept-side
    /// DataListener, then linked here once the Connection itself exists).
    pub fn attach_data_stream(&mut self, data_stream: Rc<RefCell<DataStreamInner>>) {
        self.data_stream = Some(data_stream);
    }

    /// Initiator: sends the handshake INIT carrying the four address lines.
    pub fn connect_to_remote(&mut self) {
        let close_user = self.close_user.expect("initiator has close_user set at construction");
        let remote_user = self.remote_user.expect("initiator has remote_user set at construction");
        info!(
            "{}: Trying to connect to {} through {}, waiting for response",
            self, remote_user, self.peer
        );
        let payload = format!(
            "Source Address:{}\nSource Port:{}\nDestination Address:{}\nDestination Port:{}\n",
            close_user.ip(),
            close_user.port(),
            remote_user.ip(),
            remote_user.port(),
        );
        self.queue_datagram(Flag::Init, self.sequence_num, payload.into_bytes(), false);
    }

    fn parse_init_payload(data: &[u8]) -> Result<(SocketAddr, SocketAddr)> {
        let text = std::str::from_utf8(data).map_err(|_| RudpError::Protocol("non-UTF8 init payload".into()))?;
        // Open Question (spec.md §9): accept both the 4-line and the
        // trailing-empty-5th-segment form.
        let mut lines: Vec<&str> = text.split('\n').collect();
        if lines.last() == Some(&"") {
            lines.pop();
        }
        if lines.len() != 4 {
            return Err(RudpError::Protocol("invalid init payload: expected 4 fields".into()));
        }
        let mut values = Vec::with_capacity(4);
        for line in &lines {
            let (_, value) = line
                .split_once(':')
                .ok_or_else(|| RudpError::Protocol("invalid init payload: missing ':'".into()))?;
            values.push(value);
        }
        let src_addr: std::net::IpAddr = values[0]
            .parse()
            .map_err(|_| RudpError::Protocol("invalid source address".into()))?;
        let src_port: u16 = values[1].parse().map_err(|_| RudpError::Protocol("invalid source port".into()))?;
        let dst_addr: std::net::IpAddr = values[2]
            .parse()
            .map_err(|_| RudpError::Protocol("invalid destination address".into()))?;
        let dst_port: u16 = values[3]
            .parse()
            .map_err(|_| RudpError::Protocol("invalid destination port".into()))?;
        Ok((SocketAddr::new(src_addr, src_port), SocketAddr::new(dst_addr, dst_port)))
    }

    fn receive_init(&mut self, data: &[u8]) {
        match self.state {
            ConnState::WaitingRemoteConnectionApproval => {
                info!(
                    "{}: Connection to remote user successful, allowing user at {:?} to send and receive",
                    self, self.close_user
                );
                self.give_up_deadline = None;
                self.state = ConnState::ReadyForSend;
            }
            ConnState::InitAnswerer => {
                let (initiator, endpoint) = match Self::parse_init_payload(data) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!("{}: failed to parse init payload: {}", self, err);
                        self.init_close(false);
                        return;
                    }
                };
                self.close_user = Some(endpoint);
                self.remote_user = Some(initiator);
                info!(
                    "{}: Received request to init connection with {:?} from RUDP server {}. Trying to connect...",
                    self, self.close_user, self.peer
                );
                match crate::data::dial(
                    endpoint,
                    self.tunables.data_block_size,
                    self.tunables.data_buff_limit,
                ) {
                    Ok(inner) => {
                        if let Some(conn_rc) = self.self_ref.upgrade() {
                            inner.borrow_mut().attach_connection(conn_rc);
                        }
                        self.data_stream = Some(inner.clone());
                        let _ = self
                            .spawn_queue
                            .push(Box::new(crate::data::DataStream::new(inner)));
                        self.state = ConnState::WaitingConnectStatus;
                    }
                    Err(err) => {
                        warn!("{}: failed to initialize connection: {}", self, err);
                        self.init_close(true);
                    }
                }
            }
            // Duplicate-approval race (pinned from rudpconnection.py): the
            // peer's own ACK to our INIT was lost and it has already moved
            // on to sending the approval. Log only.
            _ => {
                info!("{}: received connection approval before init ack, init ack probably lost", self);
            }
        }
    }

    fn receive_data(&mut self, data: &[u8]) {
        self.bytes_received += data.len() as u64;
        if let Some(ds) = &self.data_stream {
            ds.borrow_mut().queue_send(data);
        }
    }

    fn receive_ack(&mut self, sqn: u32) {
        if sqn != self.sequence_num {
            return;
        }
        if self.state == ConnState::WaitingForInitAck {
            self.state = ConnState::WaitingRemoteConnectionApproval;
            self.give_up_deadline = Some(Instant::now() + self.tunables.connection_approval_interval);
            info!("{}: Received init ack", self);
        } else {
            self.state = ConnState::ReadyForSend;
        }
        debug!("{}: Incremented sequence number from {} to {}", self, self.sequence_num, self.sequence_num + 1);
        self.sequence_num += 1;
        self.retries_used = 0;
        self.next_retransmit = None;
    }

    fn receive_close(&mut self) {
        if self.state == ConnState::WaitingForInitAck {
            info!(
                "{}: Connection process to user {:?} through {} unsuccessful, closing connection with user {:?}",
                self, self.remote_user, self.peer, self.close_user
            );
        } else {
            info!("{}: Received a closing packet, closing connection...", self);
        }
        self.init_close(false);
    }

    /// Routes a decoded packet through the handshake/dedup/delivery rules.
    pub fn receive_datagram(&mut self, cid_flag_sqn_data: crate::rudp::wire::Packet) {
        let pkt = cid_flag_sqn_data;
        self.next_keepalive = Some(Instant::now() + self.jittered_keep_alive);
        debug!(
            "{}: Datagram received: Flag: {:?}; Sequence number: {}; Data length: {}",
            self,
            pkt.flag,
            pkt.sqn,
            pkt.data.len()
        );

        if pkt.flag == Flag::Ack {
            self.receive_ack(pkt.sqn);
            return;
        }
        if pkt.flag == Flag::Init && self.state == ConnState::WaitingForInitAck {
            self.receive_init(&pkt.data);
            return;
        }

        let mut duplicate = false;
        match self.peer_sequence_num {
            None => self.peer_sequence_num = Some(pkt.sqn),
            Some(highest) if pkt.sqn <= highest => duplicate = true,
            Some(_) => {}
        }

        if !duplicate {
            match pkt.flag {
                Flag::Init => self.receive_init(&pkt.data),
                Flag::Data => self.receive_data(&pkt.data),
                Flag::Close => self.receive_close(),
                Flag::KpAlive => {}
                Flag::Ack => unreachable!("handled above"),
            }
            self.peer_sequence_num = Some(pkt.sqn);
        } else {
            info!(
                "{}: sequence num of received packet {} <= highest already received {:?}, discarding duplicate",
                self, pkt.sqn, self.peer_sequence_num
            );
        }

        // Duplicates ARE acked (Open Question, spec.md §9): any accepted
        // non-ACK, non-CLOSE frame gets exactly one ACK, whether or not it
        // was a duplicate. CLOSE is never ACKed either way.
        if pkt.flag != Flag::Close {
            self.queue_ack();
        }
    }

    fn queue_ack(&mut self) {
        let sqn = self.peer_sequence_num.unwrap_or(0);
        self.queue_datagram(Flag::Ack, sqn, Vec::new(), false);
    }

    fn queue_kp_alive(&mut self) {
        self.queue_datagram(Flag::KpAlive, self.sequence_num, Vec::new(), false);
    }

    fn queue_close(&mut self) {
        self.queue_datagram(Flag::Close, self.sequence_num, Vec::new(), false);
    }

    /// Answerer: local TCP connect to the destination succeeded; announce
    /// it to the Initiator with an empty-payload INIT ("approval").
    pub fn approve_data_socket(&mut self) {
        info!(
            "{}: Connection to user {:?} successful, completing connection process with {}",
            self, self.close_user, self.peer
        );
        self.queue_datagram(Flag::Init, self.sequence_num, Vec::new(), false);
    }

    fn queue_datagram(&mut self, flag: Flag, sqn: u32, data: Vec<u8>, retry: bool) {
        let pkt = crate::rudp::wire::Packet::new(self.cid, flag, sqn, data);
        let data_len = pkt.data.len();
        let bytes = pkt.encode();
        let _ = self.send_queue.push(OutboundDatagram {
            peer: self.peer,
            bytes,
            flag,
            sqn,
            data_len,
            is_retry: retry,
            connection: self.self_ref.clone(),
        });

        match flag {
            Flag::Init if sqn == self.sequence_num && data_len == 0 => {
                self.state = ConnState::WaitingForAck;
            }
            Flag::Init => self.state = ConnState::WaitingForInitAck,
            Flag::Ack => {}
            _ => self.state = ConnState::WaitingForAck,
        }
        if retry {
            self.retries_used += 1;
        }
    }

    /// Called by the mux once a queued datagram actually leaves the socket.
    pub fn datagram_sent(&mut self, flag: Flag, sqn: u32, data: &[u8], is_retry: bool) {
        debug!(
            "{}: Datagram sent: Flag: {:?}; Sequence number: {}; Data length: {}",
            self,
            flag,
            sqn,
            data.len()
        );
        if flag == Flag::Data {
            self.bytes_sent += data.len() as u64;
        }
        self.next_keepalive = Some(Instant::now() + self.jittered_keep_alive);
        if flag != Flag::Ack {
            self.last_sent = Some((flag, sqn, data.to_vec()));
            self.next_retransmit = Some(Instant::now() + self.tunables.retry_interval);
        }
        if is_retry {
            info!(
                "{}: no acknowledgement received from peer, resent packet for the {} time out of {}",
                self, self.retries_used, self.tunables.retry_count
            );
        }
    }

    fn retry_send(&mut self) {
        if let Some((flag, sqn, data)) = self.last_sent.clone() {
            self.queue_datagram(flag, sqn, data, true);
        }
    }

    /// Appends `buf` to the application send buffer and flushes one frame's
    /// worth (up to DATA_LENGTH bytes) if nothing is currently in flight.
    pub fn queue_buffer(&mut self, buf: &[u8]) {
        self.send_buff.extend(buf.iter().copied());
        if self.state != ConnState::ReadyForSend {
            return;
        }
        self.flush_one_frame();
    }

    fn flush_one_frame(&mut self) {
        if self.send_buff.is_empty() {
            return;
        }
        let take = self.tunables.data_length.min(MAX_DATA_LEN).min(self.send_buff.len());
        let frame: Vec<u8> = self.send_buff.drain(..take).collect();
        self.queue_datagram(Flag::Data, self.sequence_num, frame, false);
    }

    pub fn init_close(&mut self, queue_close: bool) {
        if self.closing {
            return;
        }
        self.closing = true;
        if let Some(ds) = self.data_stream.take() {
            let already_closing = ds.borrow().is_closing();
            if !already_closing {
                ds.borrow_mut().init_close();
            }
        }
        if queue_close {
            self.queue_close();
        }
        let _ = self.close_queue.push((self.peer, self.cid));
    }

    pub fn sleep_time(&self, default: Duration) -> Duration {
        let now = Instant::now();
        let mut t = default;
        for deadline in [self.next_keepalive, self.give_up_deadline, self.next_retransmit] {
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(now);
                t = t.min(remaining);
            }
        }
        t
    }

    /// Per-tick protocol progress: keep-alive, retransmit, approval timeout,
    /// and opportunistic flush of buffered application bytes.
    pub fn update(&mut self) {
        let now = Instant::now();
        if let Some(deadline) = self.next_keepalive {
            if now >= deadline {
                self.queue_kp_alive();
            }
        }
        if let Some(deadline) = self.give_up_deadline {
            if now >= deadline {
                info!("{}: peer not approving connection, closing connection...", self);
                self.init_close(true);
            }
        }
        if !self.closing {
            if let Some(deadline) = self.next_retransmit {
                if now >= deadline
                    && matches!(self.state, ConnState::WaitingForAck | ConnState::WaitingForInitAck)
                {
                    if self.retries_used >= self.tunables.retry_count {
                        info!("{}: peer not answering packets, closing connection...", self);
                        self.init_close(false);
                    } else {
                        self.retry_send();
                    }
                }
            }
        }
        if !self.closing && self.state == ConnState::ReadyForSend && !self.send_buff.is_empty() {
            self.flush_one_frame();
        }
    }
}

/// Keep-alive jitter: only applied when the configured interval equals the
/// *default* (spec.md §4.5 pinned detail from `rudpconnection.py`'s
/// `if keep_alive_interval == constants._KEEP_ALIVE_INTERVAL:`); an
/// operator-overridden interval is used verbatim.
fn jitter(tunables: &ConnectionTunables) -> Duration {
    if tunables.keep_alive_interval == tunables.default_keep_alive_interval {
        let jitter_ms = rand::thread_rng().gen_range(0..1000);
        tunables.keep_alive_interval.saturating_sub(Duration::from_millis(jitter_ms))
    } else {
        tunables.keep_alive_interval
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection ({}), {}", self.peer, self.cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tunables() -> ConnectionTunables {
        ConnectionTunables {
            retry_interval: Duration::from_millis(1000),
            retry_count: 15,
            keep_alive_interval: Duration::from_millis(20_000),
            connection_approval_interval: Duration::from_millis(10_000),
            data_length: 1024,
            data_block_size: 1024,
            data_buff_limit: 4096,
            default_keep_alive_interval: Duration::from_millis(20_000),
        }
    }

    fn new_initiator_for_test() -> (Rc<RefCell<Connection>>, SendQueue) {
        let send_queue: SendQueue = Rc::new(ConcurrentQueue::unbounded());
        let spawn_queue: SpawnQueue = Rc::new(ConcurrentQueue::unbounded());
        let close_queue: CloseQueue = Rc::new(ConcurrentQueue::unbounded());
        let peer = SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 1026);
        let close_user = SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 4000);
        let remote_user = SocketAddr::new(Ipv4Addr::new(192, 168, 1, 1).into(), 80);
        let sq = send_queue.clone();
        let conn = Rc::new_cyclic(|weak| {
            RefCell::new(Connection::new_initiator(
                weak,
                peer,
                0,
                close_user,
                remote_user,
                tunables(),
                sq,
                spawn_queue,
                close_queue,
            ))
        });
        (conn, send_queue)
    }

    #[test]
    fn connect_to_remote_enters_waiting_for_init_ack() {
        let (conn, queue) = new_initiator_for_test();
        conn.borrow_mut().connect_to_remote();
        assert_eq!(conn.borrow().state(), ConnState::WaitingForInitAck);
        assert_eq!(queue.len(), 1);
        let entry = queue.pop().unwrap();
        assert_eq!(entry.flag, Flag::Init);
        assert_eq!(entry.sqn, 0);
    }

    #[test]
    fn ack_for_init_transitions_to_waiting_remote_approval_and_bumps_sequence() {
        let (conn, _queue) = new_initiator_for_test();
        conn.borrow_mut().connect_to_remote();
        conn.borrow_mut().receive_ack(0);
        assert_eq!(conn.borrow().state(), ConnState::WaitingRemoteConnectionApproval);
        assert_eq!(conn.borrow().sequence_num(), 1);
    }

    #[test]
    fn mismatched_ack_is_ignored() {
        let (conn, _queue) = new_initiator_for_test();
        conn.borrow_mut().connect_to_remote();
        conn.borrow_mut().receive_ack(99);
        assert_eq!(conn.borrow().state(), ConnState::WaitingForInitAck);
        assert_eq!(conn.borrow().sequence_num(), 0);
    }

    #[test]
    fn empty_init_after_approval_enters_ready_for_send() {
        let (conn, _queue) = new_initiator_for_test();
        conn.borrow_mut().connect_to_remote();
        conn.borrow_mut().receive_ack(0);
        let pkt = crate::rudp::wire::Packet::new(0, Flag::Init, 0, Vec::new());
        conn.borrow_mut().receive_datagram(pkt);
        assert_eq!(conn.borrow().state(), ConnState::ReadyForSend);
    }

    #[test]
    fn duplicate_data_does_not_increase_bytes_received_but_still_acks() {
        let (conn, queue) = new_initiator_for_test();
        {
            let mut c = conn.borrow_mut();
            c.peer_sequence_num = Some(5);
            c.state = ConnState::ReadyForSend;
        }
        while queue.pop().is_ok() {}
        let pkt = crate::rudp::wire::Packet::new(0, Flag::Data, 5, b"dup".to_vec());
        conn.borrow_mut().receive_datagram(pkt);
        assert_eq!(conn.borrow().bytes_received(), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().flag, Flag::Ack);
    }

    #[test]
    fn close_is_never_acked() {
        let (conn, queue) = new_initiator_for_test();
        conn.borrow_mut().state = ConnState::ReadyForSend;
        while queue.pop().is_ok() {}
        let pkt = crate::rudp::wire::Packet::new(0, Flag::Close, 1, Vec::new());
        conn.borrow_mut().receive_datagram(pkt);
        assert!(queue.is_empty());
        assert!(conn.borrow().is_closing());
    }

    #[test]
    fn retry_exhaustion_closes_without_queuing_close() {
        let (conn, queue) = new_initiator_for_test();
        conn.borrow_mut().connect_to_remote();
        while queue.pop().is_ok() {}
        conn.borrow_mut().retries_used = 15;
        conn.borrow_mut().next_retransmit = Some(Instant::now() - Duration::from_millis(1));
        conn.borrow_mut().update();
        assert!(conn.borrow().is_closing());
        assert!(queue.is_empty());
    }

    #[test]
    fn parses_four_and_five_segment_init_payload() {
        let four = b"Source Address:1.2.3.4\nSource Port:10\nDestination Address:5.6.7.8\nDestination Port:20";
        let five = b"Source Address:1.2.3.4\nSource Port:10\nDestination Address:5.6.7.8\nDestination Port:20\n";
        let (src_a, dst_a) = Connection::parse_init_payload(four).unwrap();
        let (src_b, dst_b) = Connection::parse_init_payload(five).unwrap();
        assert_eq!(src_a, src_b);
        assert_eq!(dst_a, dst_b);
        assert_eq!(src_a.port(), 10);
        assert_eq!(dst_a.port(), 20);
    }
}
