//! Real-socket round trip through the full TCP-to-RUDP-to-TCP bridge: a
//! client dials a `DataListener` on one relay, that relay's `Connection`
//! handshakes over loopback UDP with a second relay, which dials a plain
//! TCP "destination" service and bridges bytes back and forth.
//!
//! Grounded on the teacher's own real-socket tests in `src/net/tcp.rs`
//! (`stream_from_connected_pair_round_trips_data`); driven with two
//! independent `Reactor`s stepped by hand via `run_once`, the same
//! deterministic-stepping pattern `reactor::mod`'s own tests use.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;

use rudp_relay::config::Config;
use rudp_relay::data::DataListener;
use rudp_relay::reactor::Reactor;
use rudp_relay::rudp::mux::{DatagramMux, MuxPollable};

fn fast_config() -> Config {
    let mut config = Config::default();
    config.reactor_timeout = Duration::from_millis(20);
    config.retry_interval = Duration::from_millis(100);
    config.keep_alive_interval = Duration::from_secs(30);
    config.connection_approval_interval = Duration::from_secs(5);
    config
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
}

#[test]
fn bridges_tcp_bytes_through_two_relays_over_loopback() {
    // Destination service the answerer relay dials into.
    let dest_listener = StdTcpListener::bind(loopback(0)).unwrap();
    let dest_addr = dest_listener.local_addr().unwrap();
    let (dest_tx, dest_rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut stream, _) = dest_listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        dest_tx.send(buf[..n].to_vec()).unwrap();
        stream.write_all(b"pong").unwrap();
    });

    // Initiator-side relay: owns the DataListener the client dials.
    let config_a = fast_config();
    let mut reactor_a = Reactor::new(&config_a);
    let spawn_queue_a = reactor_a.spawn_queue();
    let send_queue_a = Rc::new(ConcurrentQueue::unbounded());
    let mux_a = Rc::new(RefCell::new(
        DatagramMux::bind(loopback(0), &config_a, send_queue_a, spawn_queue_a.clone()).unwrap(),
    ));
    reactor_a.register(Box::new(MuxPollable::new(mux_a.clone()))).unwrap();

    // Answerer-side relay: dials `dest_addr` once handshaked.
    let config_b = fast_config();
    let mut reactor_b = Reactor::new(&config_b);
    let spawn_queue_b = reactor_b.spawn_queue();
    let send_queue_b = Rc::new(ConcurrentQueue::unbounded());
    let mux_b = Rc::new(RefCell::new(
        DatagramMux::bind(loopback(0), &config_b, send_queue_b, spawn_queue_b.clone()).unwrap(),
    ));
    reactor_b.register(Box::new(MuxPollable::new(mux_b.clone()))).unwrap();
    let mux_b_addr = mux_b.borrow().local_addr().unwrap();

    let data_listener = DataListener::bind(
        loopback(0),
        mux_b_addr,
        dest_addr,
        None,
        mux_a.clone(),
        spawn_queue_a.clone(),
        config_a.data_block_size,
        config_a.data_buff_limit,
    )
    .unwrap();
    let data_listener_addr = data_listener.local_addr().unwrap();
    reactor_a.register(Box::new(data_listener)).unwrap();

    // Simulated client, dialing the relay's public-facing port.
    let (client_tx, client_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut stream = StdTcpStream::connect(data_listener_addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        client_tx.send(buf[..n].to_vec()).unwrap();
    });

    // Step both reactors until the round trip finishes or we give up.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut dest_bytes: Option<Vec<u8>> = None;
    let mut client_bytes: Option<Vec<u8>> = None;
    while Instant::now() < deadline && (dest_bytes.is_none() || client_bytes.is_none()) {
        reactor_a.run_once().unwrap();
        reactor_b.run_once().unwrap();
        if dest_bytes.is_none() {
            if let Ok(bytes) = dest_rx.try_recv() {
                dest_bytes = Some(bytes);
            }
        }
        if client_bytes.is_none() {
            if let Ok(bytes) = client_rx.try_recv() {
                client_bytes = Some(bytes);
            }
        }
    }

    assert_eq!(dest_bytes.as_deref(), Some(&b"ping"[..]), "destination service never saw the client's bytes");
    assert_eq!(client_bytes.as_deref(), Some(&b"pong"[..]), "client never saw the destination's reply");
}
