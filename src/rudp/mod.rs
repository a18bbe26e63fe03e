//! The reliability layer: wire framing, the per-flow protocol state machine,
//! and the datagram multiplexer that owns every connection for one UDP
//! socket.

pub mod connection;
pub mod mux;
pub mod wire;

pub use connection::{Connection, ConnectionTunables, ConnState, OutboundDatagram, SendQueue};
pub use mux::DatagramMux;
pub use wire::{Flag, Packet};
