//! # wasl-transport
//!
//! Server↔server WebSocket transport.
//!
//! Connections are JSON text frames over WebSocket. The dialing side
//! opens with a signed `handshake`; the accepting side verifies and
//! replies with a signed `handshake_ack`. After that both directions
//! carry `gossip` frames.
//!
//! The [`peer::PeerManager`] is socket-agnostic: each connection (dialed
//! here via tokio-tungstenite, or accepted by the daemon's HTTP listener)
//! registers an outbound queue with the manager and pumps it to its own
//! socket. Bounded queues give backpressure; a peer that cannot drain its
//! queue is disconnected rather than allowed to stall the cluster.
//!
//! ## Duplicate connections
//!
//! When both servers dial each other, the server with the
//! lexicographically *smaller* id keeps its outgoing side and the other
//! connection closes with reason `duplicate`. Both ends compute the same
//! answer from the same two ids, so exactly one connection survives.
//!
//! ## Reconnection
//!
//! Outgoing connections retry with exponential backoff (`base·2^attempt`,
//! capped, ±1 s jitter) for as long as the peer remains wanted. Incoming
//! connections are never re-dialed from this side.

pub mod connector;
pub mod peer;

use std::time::Duration;

pub use connector::connect_peer;
pub use peer::{ConnectionKind, PeerManager, RegisterOutcome};

/// Close reason sent when the duplicate tie-break loses a connection.
pub const CLOSE_REASON_DUPLICATE: &str = "duplicate";

/// Tunables for peer connections.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Time allowed for the handshake/ack exchange.
    pub handshake_timeout: Duration,
    /// WebSocket keepalive ping period.
    pub ping_interval: Duration,
    /// First reconnect delay.
    pub reconnect_base: Duration,
    /// Reconnect delay cap.
    pub reconnect_max_interval: Duration,
    /// Bounded outbound queue length per peer.
    pub outbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(8),
            ping_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_max_interval: Duration::from_secs(60),
            outbound_queue: 64,
        }
    }
}

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// WebSocket connect or I/O failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Handshake failed verification or timed out.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The remote identified as someone other than expected.
    #[error("peer identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// Frame encode/decode failure.
    #[error("protocol error: {0}")]
    Proto(#[from] wasl_proto::ProtoError),

    /// The peer's outbound queue overflowed; the connection is dropped.
    #[error("outbound queue full for {0}")]
    QueueFull(String),

    /// The peer is not connected.
    #[error("not connected: {0}")]
    NotConnected(String),
}

/// Convenience result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Exponential backoff with ±1 s jitter, capped.
pub(crate) fn backoff_delay(config: &TransportConfig, attempt: u32) -> Duration {
    let exp = config
        .reconnect_base
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(config.reconnect_max_interval);
    let jitter_ms = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=2000u64);
    // Center the jitter: capped - 1s + [0, 2s]
    capped
        .saturating_sub(Duration::from_secs(1))
        .saturating_add(Duration::from_millis(jitter_ms))
}
