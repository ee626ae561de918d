//! # wasl-rendezvous
//!
//! The replicated rendezvous engine: daily points, hourly tokens and the
//! relay registry, spread across ring owners with quorum writes and
//! redirect-based reads.
//!
//! The engine talks to the rest of the cluster through a command channel
//! ([`ClusterRequest`]): it never holds a socket, and the cluster router
//! that executes the requests never reaches into the engine. Replies come
//! back on per-request oneshot channels with a hard RPC timeout, so a
//! dead peer costs one timeout, not a stalled client.
//!
//! Consistency model: availability first. `W + r > R` is *not* required;
//! replicas converge because every record merge is a vector-clock
//! semilattice (see `wasl_types::rendezvous`). A write that reaches fewer
//! than `W` owners reports partial success and anti-entropy finishes the
//! job.

pub mod engine;

use std::time::Duration;

use tokio::sync::oneshot;

use wasl_types::{DailyPointEntry, HourlyTokenEntry, RelayEntry, ServerId};

pub use engine::{Engine, EngineStats, PublishOutcome, QueryOutcome};

/// A cluster-side effect the engine asks the router to perform.
#[derive(Debug)]
pub enum ClusterRequest {
    /// Push records to a ring owner; reply `true` on ack.
    Replicate {
        to: ServerId,
        daily_points: Vec<DailyPointEntry>,
        hourly_tokens: Vec<HourlyTokenEntry>,
        relays: Vec<RelayEntry>,
        reply: oneshot::Sender<bool>,
    },
    /// Ask a ring owner for records; reply `None` on failure/timeout.
    QueryForward {
        to: ServerId,
        daily_points: Vec<String>,
        hourly_tokens: Vec<String>,
        reply: oneshot::Sender<Option<(Vec<DailyPointEntry>, Vec<HourlyTokenEntry>)>>,
    },
}

/// Replication and quorum tunables.
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// Ring owners per key.
    pub replication_factor: usize,
    /// Acks (local write included) for a full-success publish.
    pub write_quorum: usize,
    /// Remote owners consulted per non-owned query key.
    pub read_quorum: usize,
    /// Per-request cross-server RPC timeout.
    pub rpc_timeout: Duration,
    /// Relays silent longer than this are not offered to clients.
    pub relay_freshness: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: wasl_types::DEFAULT_REPLICATION_FACTOR,
            write_quorum: wasl_types::DEFAULT_WRITE_QUORUM,
            read_quorum: wasl_types::DEFAULT_READ_QUORUM,
            rpc_timeout: Duration::from_secs(5),
            relay_freshness: Duration::from_secs(10 * 60),
        }
    }
}

/// Error types for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    /// Local persistence failed (writes surface this; reads fail open).
    #[error("store error: {0}")]
    Store(#[from] wasl_store::StoreError),

    /// The cluster router is gone; the server is shutting down.
    #[error("cluster channel closed")]
    ClusterClosed,
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, RendezvousError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_replication_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.write_quorum, 2);
        assert_eq!(config.read_quorum, 1);
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
    }
}
