//! # wasl-types
//!
//! Shared domain types for the wasl federated signaling cluster.
//!
//! Every entity that crosses a crate boundary lives here: server and node
//! identifiers, the cluster membership entry, vector clocks, the replicated
//! rendezvous records (daily points, hourly tokens, relay descriptors) and
//! the pairing-code alphabet. Wire-message envelopes live in `wasl-proto`.

pub mod clock;
pub mod id;
pub mod membership;
pub mod pairing;
pub mod rendezvous;

pub use clock::{ClockOrdering, VectorClock};
pub use id::{ConnId, NodeId, PeerId, ServerId};
pub use membership::{MembershipEntry, PeerStatus};
pub use rendezvous::{DailyPointEntry, DeadDropHit, HourlyTokenEntry, LiveMatch, RelayEntry};

/// Lifetime of a daily point record (48 hours).
pub const DAILY_POINT_TTL_MS: u64 = 48 * 60 * 60 * 1000;

/// Lifetime of an hourly token record (3 hours).
pub const HOURLY_TOKEN_TTL_MS: u64 = 3 * 60 * 60 * 1000;

/// Time a pair request waits for approval before expiring.
pub const PAIR_REQUEST_TIMEOUT_MS: u64 = 120_000;

/// Warning lead time before a pair request expires.
pub const PAIR_WARNING_MS: u64 = 30_000;

/// Upper bound on concurrent pending pair requests aimed at one target.
pub const MAX_PENDING_REQUESTS_PER_TARGET: usize = 10;

/// Number of ring owners each rendezvous record is replicated to.
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Acks required before a publish reports full success.
pub const DEFAULT_WRITE_QUORUM: usize = 2;

/// Remote owners consulted per query key.
pub const DEFAULT_READ_QUORUM: usize = 1;

/// Virtual positions each node occupies on the hash ring.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Error types for domain-type parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// A server id string is not `ed25519:<base64 public key>`.
    #[error("invalid server id: {0}")]
    InvalidServerId(String),

    /// A node id string is not 40 hex characters.
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    /// A pairing code fails the alphabet or length check.
    #[error("invalid pairing code: {0}")]
    InvalidPairingCode(String),
}

/// Convenience result type for domain-type operations.
pub type Result<T> = std::result::Result<T, TypeError>;
