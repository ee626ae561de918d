//! # wasl-gossip
//!
//! SWIM-style membership and failure detection for the wasl cluster.
//!
//! The protocol core ([`membership::Membership`]) is a synchronous state
//! machine: callers feed it time and inbound events, and it returns
//! [`membership::SwimOutput`] values describing what to send and which
//! membership transitions occurred. No I/O, no clocks, no tasks — every
//! path is unit-testable with fabricated timestamps.
//!
//! The async side ([`runner::GossipRunner`]) drives the core on a fixed
//! tick, signs outbound envelopes, verifies inbound ones (silently
//! dropping failures, with counters) and piggy-backs membership deltas on
//! every frame.
//!
//! ## Protocol summary
//!
//! - Each tick, probe one random alive peer with `ping`; on direct
//!   timeout ask `indirect_ping_count` helpers to probe for us.
//! - No ack within `suspicion_timeout` marks the peer `suspect`;
//!   `failure_timeout` later it becomes `failed` and leaves the routing
//!   set (but not the table, until the GC horizon).
//! - A server that hears itself called `suspect`/`failed` raises its own
//!   incarnation and broadcasts `alive`; stale incarnations are ignored.
//! - Every `state_exchange_interval` the full table goes to one random
//!   peer for anti-entropy reconciliation.
//!
//! Probe and indirect-probe timeouts are state transitions, never errors.

pub mod membership;
pub mod runner;

pub use membership::{DropReason, Membership, SwimOutput};
pub use runner::{GossipRunner, MembershipEvent};

use std::time::Duration;

/// Tunables for the failure detector.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Probe scheduling tick.
    pub tick_interval: Duration,
    /// Direct-probe wait before indirect probing starts.
    pub probe_timeout: Duration,
    /// Total wait (from probe start) before marking `suspect`.
    pub suspicion_timeout: Duration,
    /// Time a peer stays `suspect` before becoming `failed`.
    pub failure_timeout: Duration,
    /// Helpers asked to probe on our behalf.
    pub indirect_ping_count: usize,
    /// Full-table anti-entropy period.
    pub state_exchange_interval: Duration,
    /// How long `failed` entries stay in the table before GC.
    pub failed_gc_horizon: Duration,
    /// Max membership entries piggy-backed per envelope.
    pub max_piggyback: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(1500),
            suspicion_timeout: Duration::from_secs(5),
            failure_timeout: Duration::from_secs(10),
            indirect_ping_count: 2,
            state_exchange_interval: Duration::from_secs(30),
            failed_gc_horizon: Duration::from_secs(100),
            max_piggyback: 8,
        }
    }
}

/// Error types for gossip operations.
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    /// Envelope construction or signing failed.
    #[error("protocol error: {0}")]
    Proto(#[from] wasl_proto::ProtoError),

    /// The outbound channel to the transport is gone.
    #[error("transport channel closed")]
    TransportClosed,
}

/// Convenience result type for gossip operations.
pub type Result<T> = std::result::Result<T, GossipError>;
