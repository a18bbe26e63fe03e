//! Read-only statistics snapshots, queried by both `control`'s
//! `op=statistics` and `http`'s connections table.
//!
//! Grounded on `Server/statisticsrequest.py`, which exposes exactly these
//! fields per connection plus the aggregate connection count.

use std::net::SocketAddr;

/// Snapshot of one live connection's counters.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sequence_number: u32,
    pub peer_sequence_number: Option<u32>,
    /// The Python's "connected_user": the local TCP endpoint this
    /// connection's Connection was opened on behalf of.
    pub close_user: Option<SocketAddr>,
    pub remote_user: Option<SocketAddr>,
}

/// Aggregate, relay-wide counters.
#[derive(Debug, Clone, Copy)]
pub struct TotalStats {
    pub number_of_connections: usize,
}
