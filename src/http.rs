//! Minimal GET-only HTTP surface: a connections table and a form that opens
//! a new bridged port, the human-facing counterpart to [`crate::control`].
//!
//! Grounded on `Server/httpserver.py`, `homeservice.py`,
//! `connectionsservice.py`, and `dataportservice.py`. Static file serving
//! and the multi-state `HTTPService` pipeline those originals build around
//! collapse here into two routes answered synchronously in one `read()`,
//! since every response this relay serves is generated in memory.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};

use crate::config::Config;
use crate::data::DataListener;
use crate::reactor::{Pollable, SpawnQueue};
use crate::ready::Ready;
use crate::rudp::DatagramMux;
use crate::tcp::{TcpListener, TcpStream};

const HTTP_SIGNATURE: &str = "HTTP/1.1";

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn home_page(mux: &DatagramMux) -> String {
    let mut rows = String::new();
    for (peer, cid, stats) in mux.connections_overview() {
        rows.push_str(&format!(
            "<tr><td>{}, {}</td><td>{}</td></tr>\n",
            peer, cid, stats.bytes_sent
        ));
    }
    format!(
        "<html><head><meta http-equiv=\"refresh\" content=10></head><body>\n\
         <h1>Reliable UDP Server</h1>\n\
         <h2>Connection Data</h2>\n\
         <table style=\"width:50%\"><tr><th>Address, CID</th><th>Bytes Sent</th></tr>\n\
         {rows}\
         </table>\n\
         <form action=\"/open_port\"><input type=\"submit\" value=\"Add A Connection\"/></form>\n\
         </body></html>\n"
    )
}

fn connections_page(mux: &DatagramMux) -> String {
    let mut rows = String::new();
    for (peer, cid, stats) in mux.connections_overview() {
        rows.push_str(&format!(
            "<tr><td>{}, {}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            peer,
            cid,
            stats.close_user.map(|a| a.to_string()).unwrap_or_default(),
            stats.remote_user.map(|a| a.to_string()).unwrap_or_default(),
            stats.bytes_sent,
            stats.bytes_received,
            stats.sequence_number,
            stats.peer_sequence_number.map(|n| n.to_string()).unwrap_or_default(),
        ));
    }
    format!(
        "<html><body>\n\
         <h1>Connections</h1>\n\
         <table><tr><th>Peer, CID</th><th>Connected User</th><th>Remote User</th>\
         <th>Bytes Sent</th><th>Bytes Received</th><th>Sequence #</th><th>Peer Sequence #</th></tr>\n\
         {rows}\
         </table>\n\
         </body></html>\n"
    )
}

fn form_page(port: Option<u16>) -> String {
    let port_info = match port {
        Some(port) => format!("<p class=\"port-info\">Your port is: {}.</p>", port),
        None => String::new(),
    };
    format!(
        "<html><body>\n\
         <h1>Open A Connection</h1>\n\
         {port_info}\
         <form action=\"/open_port\">\n\
         Exit Address: <input type=\"text\" name=\"exit_address\"/><br/>\n\
         Exit Port: <input type=\"text\" name=\"exit_port\"/><br/>\n\
         Destination Address: <input type=\"text\" name=\"dest_address\"/><br/>\n\
         Destination Port: <input type=\"text\" name=\"dest_port\"/><br/>\n\
         TTL (seconds, 0 for unlimited): <input type=\"text\" name=\"ttl\" value=\"0\"/><br/>\n\
         <input type=\"submit\" value=\"Open\"/>\n\
         </form>\n\
         </body></html>\n"
    )
}

struct Response {
    code: u16,
    message: &'static str,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn ok_html(body: String) -> Response {
        Response { code: 200, message: "OK", content_type: "text/html", body }
    }

    fn not_found() -> Response {
        Response {
            code: 404,
            message: "File Not Found",
            content_type: "text/plain",
            body: "Not Found".to_string(),
        }
    }

    fn bad_request(message: &str) -> Response {
        Response {
            code: 400,
            message: "Invalid Request",
            content_type: "text/plain",
            body: message.to_string(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!(
            "{} {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
            HTTP_SIGNATURE,
            self.code,
            self.message,
            self.content_type,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

/// Accepts HTTP connections and hands each off to an [`HttpSocket`].
pub struct HttpListener {
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

impl HttpListener {
    pub fn bind(
        bind_addr: SocketAddr,
        mux: Rc<RefCell<DatagramMux>>,
        spawn_queue: SpawnQueue,
        config: &Config,
    ) -> crate::error::Result<HttpListener> {
        let listener = TcpListener::bind(bind_addr)?;
        Ok(HttpListener {
            listener,
            mux,
            spawn_queue,
            block_size: config.http_block_size,
            buff_limit: config.http_buff_limit,
            data_block_size: config.data_block_size,
            data_buff_limit: config.data_buff_limit,
            closing: false,
            terminated: false,
        })
    }
}

impl fmt::Display for HttpListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP Listener Socket ({})", self.listener.as_raw_fd())
    }
}

impl Pollable for HttpListener {
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
                info!("{}: http connection accepted from {}", self, addr);
                match TcpStream::from_connected(stream, self.block_size, self.buff_limit) {
                    Ok(tcp) => {
                        let socket = HttpSocket::new(
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

/// Parses a single request line, serves one response, then closes — matches
/// `HTTPSocket.parse_buffer`'s `init_close()` right after a service
/// finishes, since every route here is a one-shot GET.
pub struct HttpSocket {
    tcp: TcpStream,
    mux: Rc<RefCell<DatagramMux>>,
    spawn_queue: SpawnQueue,
    data_block_size: usize,
    data_buff_limit: usize,
    recv_buf: Vec<u8>,
    responded: bool,
}

impl HttpSocket {
    fn new(
        tcp: TcpStream,
        mux: Rc<RefCell<DatagramMux>>,
        spawn_queue: SpawnQueue,
        data_block_size: usize,
        data_buff_limit: usize,
    ) -> HttpSocket {
        HttpSocket {
            tcp,
            mux,
            spawn_queue,
            data_block_size,
            data_buff_limit,
            recv_buf: Vec::new(),
            responded: false,
        }
    }

    fn handle_available(&mut self) {
        if self.responded {
            return;
        }
        let text = match std::str::from_utf8(&self.recv_buf) {
            Ok(t) => t,
            Err(_) => {
                self.respond(Response::bad_request("non-UTF8 request"));
                return;
            }
        };
        if text.find("\r\n\r\n").is_none() {
            return;
        }
        let status_line = text.lines().next().unwrap_or("");
        let response = self.route(status_line);
        self.respond(response);
    }

    fn route(&mut self, status_line: &str) -> Response {
        let mut parts = status_line.split(' ');
        let method = parts.next().unwrap_or("");
        let uri = parts.next().unwrap_or("");
        if method != "GET" {
            return Response::bad_request("unsupported method");
        }
        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
        match path {
            "/" | "/home" => {
                let mux = self.mux.borrow();
                Response::ok_html(home_page(&mux))
            }
            "/connections" => {
                let mux = self.mux.borrow();
                Response::ok_html(connections_page(&mux))
            }
            "/open_port" if query.is_empty() => Response::ok_html(form_page(None)),
            "/open_port" => self.open_port(query),
            _ => Response::not_found(),
        }
    }

    fn open_port(&mut self, query: &str) -> Response {
        let params = parse_query(query);
        let result: crate::error::Result<u16> = (|| {
            let exit_address = params.get("exit_address").ok_or_else(|| crate::error::RudpError::invalid_request("missing exit_address"))?;
            let exit_port: u16 = params
                .get("exit_port")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| crate::error::RudpError::invalid_request("invalid exit_port"))?;
            let dest_address = params.get("dest_address").ok_or_else(|| crate::error::RudpError::invalid_request("missing dest_address"))?;
            let dest_port: u16 = params
                .get("dest_port")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| crate::error::RudpError::invalid_request("invalid dest_port"))?;
            let ttl_secs: f64 = params
                .get("ttl")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let exit_ip: IpAddr = exit_address.parse().map_err(|_| crate::error::RudpError::invalid_request("invalid exit_address"))?;
            let dest_ip: IpAddr = dest_address.parse().map_err(|_| crate::error::RudpError::invalid_request("invalid dest_address"))?;
            let exit_peer = SocketAddr::new(exit_ip, exit_port);
            let dest = SocketAddr::new(dest_ip, dest_port);
            let ttl = if ttl_secs > 0.0 { Some(Duration::from_secs_f64(ttl_secs)) } else { None };
            let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
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
            Ok(port)
        })();
        match result {
            Ok(port) => Response::ok_html(form_page(Some(port))),
            Err(err) => Response::bad_request(&err.to_string()),
        }
    }

    fn respond(&mut self, response: Response) {
        self.tcp.queue_send(&response.to_bytes());
        self.responded = true;
        self.tcp.core.init_close();
    }
}

impl fmt::Display for HttpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP Socket ({})", self.tcp.as_raw_fd())
    }
}

impl Pollable for HttpSocket {
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
    fn parses_query_string() {
        let q = parse_query("exit_address=1.2.3.4&exit_port=1026&ttl=0");
        assert_eq!(q.get("exit_address").map(String::as_str), Some("1.2.3.4"));
        assert_eq!(q.get("ttl").map(String::as_str), Some("0"));
    }

    #[test]
    fn response_serializes_status_line_and_body() {
        let resp = Response::ok_html("<html></html>".to_string());
        let bytes = resp.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("<html></html>"));
    }
}
