//! Line-oriented TCP control protocol: `op=connect` opens a data listener
//! for a new bridged flow, `op=statistics` reads back connection counters.
//!
//! Grounded on `Server/controlserver.py`, `connectrequest.py`, and
//! `statisticsrequest.py`. A request is a run of `key=value\n` lines ended
//! by a blank line; the response mirrors the same shape, led by `code=`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};

use crate::config::Config;
use crate::data::DataListener;
use crate::error::{RudpError, Result};
use crate::reactor::{Pollable, SpawnQueue};
use crate::ready::Ready;
use crate::rudp::DatagramMux;
use crate::tcp::{TcpListener, TcpStream};

fn parse_headers(block: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in block.lines() {
        if let Some((key, value)) = line.split_once('=') {
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    headers
}

/// Accepts control connections and hands each off to a [`ControlSocket`].
pub struct ControlListener {
    listener: TcpListener,
    mux: Rc<RefCell<DatagramMux>>,
    spawn_queue: SpawnQueue,
    block_size: usize,
    buff_limit: usize,
    data_block_size: usize,
    data_buff_limit: usize,
    closing: bool,
    terminated: bool,
}

impl ControlListener {
    pub fn bind(
        bind_addr: SocketAddr,
        mux: Rc<RefCell<DatagramMux>>,
        spawn_queue: SpawnQueue,
        config: &Config,
    ) -> Result<ControlListener> {
        let listener = TcpListener::bind(bind_addr)?;
        Ok(ControlListener {
            listener,
            mux,
            spawn_queue,
            block_size: config.control_block_size,
            buff_limit: config.control_buff_limit,
            data_block_size: config.data_block_size,
            data_buff_limit: config.data_buff_limit,
            closing: false,
            terminated: false,
        })
    }
}

impl fmt::Display for ControlListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Control Listener Socket ({})", self.listener.as_raw_fd())
    }
}

impl Pollable for ControlListener {
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
        Duration::from_millis(u64::MAX)
    }

    fn read(&mut self) {
        match self.listener.accept() {
            Ok(Some((stream, addr))) => {
                info!("{}: control connection accepted from {}", self, addr);
                match TcpStream::from_connected(stream, self.block_size, self.buff_limit) {
                    Ok(tcp) => {
                        let socket = ControlSocket::new(
                            tcp,
                            self.mux.clone(),
                            self.spawn_queue.clone(),
                            self.data_block_size,
                            self.data_buff_limit,
                        );
                        let _ = self.spawn_queue.push(Box::new(socket));
                    }
                    Err(err) => warn!("{}: failed to wrap accepted socket: {}", self, err),
                }
            }
            Ok(None) => {}
            Err(err) => warn!("{}: accept failed: {}", self, err),
        }
    }

    fn write(&mut self) {}

    fn update(&mut self) {
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

/// Parses and answers `op=connect`/`op=statistics` requests, pipelined one
/// after another for as long as the client keeps the connection open.
pub struct ControlSocket {
    tcp: TcpStream,
    mux: Rc<RefCell<DatagramMux>>,
    spawn_queue: SpawnQueue,
    data_block_size: usize,
    data_buff_limit: usize,
    recv_buf: Vec<u8>,
}

impl ControlSocket {
    fn new(
        tcp: TcpStream,
        mux: Rc<RefCell<DatagramMux>>,
        spawn_queue: SpawnQueue,
        data_block_size: usize,
        data_buff_limit: usize,
    ) -> ControlSocket {
        ControlSocket {
            tcp,
            mux,
            spawn_queue,
            data_block_size,
            data_buff_limit,
            recv_buf: Vec::new(),
        }
    }

    fn handle_available(&mut self) {
        loop {
            let text = match std::str::from_utf8(&self.recv_buf) {
                Ok(t) => t,
                Err(_) => {
                    self.send_error(RudpError::invalid_request("non-UTF8 request"));
                    self.recv_buf.clear();
                    return;
                }
            };
            let blank = match text.find("\n\n") {
                Some(i) => i,
                None => return,
            };
            let header_block = text[..blank].to_string();
            let consumed = blank + 2;
            self.recv_buf.drain(..consumed);
            self.process(&header_block);
        }
    }

    fn process(&mut self, header_block: &str) {
        let headers = parse_headers(header_block);
        let op = match headers.get("op").cloned() {
            Some(op) => op,
            None => {
                self.send_error(RudpError::invalid_request("missing op"));
                return;
            }
        };
        let result = match op.as_str() {
            "connect" => self.handle_connect(&headers),
            "statistics" => self.handle_statistics(&headers),
            other => Err(RudpError::invalid_request(format!("unknown op {}", other))),
        };
        match result {
            Ok(fields) => self.send_response(&op, &fields),
            Err(err) => self.send_error(err),
        }
    }

    fn handle_connect(&mut self, headers: &HashMap<String, String>) -> Result<Vec<(String, String)>> {
        let exit_address = headers.get("exit_address").ok_or_else(|| RudpError::invalid_request("missing exit_address"))?;
        let exit_port: u16 = headers
            .get("exit_port")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RudpError::invalid_request("invalid exit_port"))?;
        let dest_address = headers.get("dest_address").ok_or_else(|| RudpError::invalid_request("missing dest_address"))?;
        let dest_port: u16 = headers
            .get("dest_port")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RudpError::invalid_request("invalid dest_port"))?;
        let ttl_secs: f64 = headers
            .get("ttl")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RudpError::invalid_request("invalid ttl"))?;
        let exit_ip: IpAddr = exit_address.parse().map_err(|_| RudpError::invalid_request("invalid exit_address"))?;
        let dest_ip: IpAddr = dest_address.parse().map_err(|_| RudpError::invalid_request("invalid dest_address"))?;
        let exit_peer = SocketAddr::new(exit_ip, exit_port);
        let dest = SocketAddr::new(dest_ip, dest_port);
        let ttl = if ttl_secs > 0.0 { Some(Duration::from_secs_f64(ttl_secs)) } else { None };
        let bind_addr: SocketAddr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        let listener = DataListener::bind(
            bind_addr,
            exit_peer,
            dest,
            ttl,
            self.mux.clone(),
            self.spawn_queue.clone(),
            self.data_block_size,
            self.data_buff_limit,
        )?;
        let port = listener.local_addr()?.port();
        let _ = self.spawn_queue.push(Box::new(listener));
        Ok(vec![("port".to_string(), port.to_string())])
    }

    fn handle_statistics(&mut self, headers: &HashMap<String, String>) -> Result<Vec<(String, String)>> {
        let info = headers.get("info").ok_or_else(|| RudpError::invalid_request("missing info"))?;
        let mux = self.mux.borrow();
        match info.as_str() {
            "number_of_connections" => Ok(vec![(
                "number_of_connections".to_string(),
                mux.total_stats().number_of_connections.to_string(),
            )]),
            "bytes_sent" | "bytes_received" | "remote_user" | "connected_user" | "sequence_number" | "peer_sequence_number" => {
                let addr = headers.get("rudp_address").ok_or_else(|| RudpError::invalid_request("missing rudp_address"))?;
                let port: u16 = headers
                    .get("rudp_port")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| RudpError::invalid_request("invalid rudp_port"))?;
                let cid: u32 = headers
                    .get("cid")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| RudpError::invalid_request("invalid cid"))?;
                let ip: IpAddr = addr.parse().map_err(|_| RudpError::invalid_request("invalid rudp_address"))?;
                let peer = SocketAddr::new(ip, port);
                let stats = mux
                    .connection_stats(peer, cid)
                    .ok_or_else(|| RudpError::connection_not_exist("connection does not exist"))?;
                let value = match info.as_str() {
                    "bytes_sent" => stats.bytes_sent.to_string(),
                    "bytes_received" => stats.bytes_received.to_string(),
                    "sequence_number" => stats.sequence_number.to_string(),
                    "peer_sequence_number" => stats.peer_sequence_number.map(|n| n.to_string()).unwrap_or_default(),
                    "remote_user" => stats.remote_user.map(|a| a.to_string()).unwrap_or_default(),
                    "connected_user" => stats.close_user.map(|a| a.to_string()).unwrap_or_default(),
                    _ => unreachable!(),
                };
                Ok(vec![(info.clone(), value)])
            }
            other => Err(RudpError::invalid_request(format!("unknown info type {}", other))),
        }
    }

    fn send_response(&mut self, op: &str, fields: &[(String, String)]) {
        let mut out = format!("op={}\ncode=0\n", op);
        for (k, v) in fields {
            out.push_str(&format!("{}={}\n", k, v));
        }
        out.push('\n');
        self.tcp.queue_send(out.as_bytes());
    }

    fn send_error(&mut self, err: RudpError) {
        let out = format!("code={}\n\n", err.control_code());
        self.tcp.queue_send(out.as_bytes());
    }
}

impl fmt::Display for ControlSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Control Socket ({})", self.tcp.as_raw_fd())
    }
}

impl Pollable for ControlSocket {
    fn fd(&self) -> RawFd {
        self.tcp.as_raw_fd()
    }

    fn io_mask(&self) -> Ready {
        self.tcp.io_mask()
    }

    fn sleep_time(&self) -> Duration {
        Duration::from_millis(0)
    }

    fn read(&mut self) {
        self.tcp.read();
        let received = self.tcp.take_received();
        if received.is_empty() {
            return;
        }
        self.recv_buf.extend_from_slice(&received);
        self.handle_available();
    }

    fn write(&mut self) {
        self.tcp.write();
    }

    fn update(&mut self) {
        self.tcp.update();
    }

    fn init_close(&mut self) {
        self.tcp.core.init_close();
    }

    fn is_terminated(&self) -> bool {
        self.tcp.core.is_terminated()
    }

    fn terminate(&mut self) {
        self.tcp.core.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let headers = parse_headers("op=connect\nexit_address=1.2.3.4\nexit_port=1026\n");
        assert_eq!(headers.get("op").map(String::as_str), Some("connect"));
        assert_eq!(headers.get("exit_port").map(String::as_str), Some("1026"));
    }

    #[test]
    fn ignores_malformed_lines() {
        let headers = parse_headers("op=connect\nmalformed-line-no-equals\n");
        assert_eq!(headers.len(), 1);
    }
}
