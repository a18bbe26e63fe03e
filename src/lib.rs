//! Single-threaded reliable-datagram relay.
//!
//! Bridges TCP traffic between two peer relays over a single UDP flow per
//! relay process, terminating a local-user TCP endpoint on one side and a
//! remote-user TCP endpoint on the other. See `rudp` for the reliability
//! layer and per-connection state machine, `reactor` for the event loop and
//! pollable abstraction that drive everything, and `data`/`control`/`http`
//! for the TCP-facing surfaces built on top.

pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod http;
pub mod reactor;
pub mod ready;
pub mod rudp;
pub mod stats;
pub mod tcp;

pub use config::Config;
pub use error::{RudpError, Result};
