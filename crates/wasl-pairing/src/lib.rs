//! # wasl-pairing
//!
//! Pairing-code registration, pair-request mediation and the signaling
//! relay.
//!
//! A client registers a short code it picked itself; another client asks
//! to pair with that code; the target explicitly approves or rejects
//! within a timeout. Once matched, the two sides exchange WebRTC
//! offer/answer/ICE through the [`relay::SignalingRelay`], which never
//! inspects payloads.
//!
//! ## Seams
//!
//! The registry and the relay are wired through two small capability
//! traits instead of back-pointers:
//!
//! - [`ClientSink`] — "deliver this message to that connection", which
//!   the daemon's connection registry implements over bounded queues.
//! - [`PairView`] — the read-side of pair state (`is_paired`,
//!   `paired_peer`, `conn_for_code`) that the relay consumes.
//!
//! Cluster effects (code claims on ring owners, cross-server request
//! forwarding) leave through the [`PairingNet`] channel; the cluster
//! router executes them and feeds remote events back in.

pub mod registry;
pub mod relay;

use std::time::Duration;

use tokio::sync::oneshot;

use wasl_proto::ServerMessage;
use wasl_types::ConnId;

pub use registry::PairingRegistry;
pub use relay::{SignalKind, SignalingRelay};

/// Deliver messages to locally connected clients.
///
/// Returns false when the connection is gone or its queue is full; the
/// caller treats that as "peer unavailable", and connection-close
/// cleanup handles the rest.
pub trait ClientSink: Send + Sync + 'static {
    fn send(&self, conn_id: ConnId, message: ServerMessage) -> bool;
}

/// Read-side of pair state, consumed by the signaling relay.
pub trait PairView: Send + Sync {
    /// Whether `a` and `b` completed a pair within the pair TTL.
    fn is_paired(&self, a: &str, b: &str) -> bool;
    /// The peer a code is paired with, if any.
    fn paired_peer(&self, code: &str) -> Option<String>;
    /// The local connection currently holding a code.
    fn conn_for_code(&self, code: &str) -> Option<ConnId>;
}

/// Cluster-side effects the registry asks the router to perform.
#[derive(Debug)]
pub enum PairingNet {
    /// Claim `code` on its ring owners; reply false if any owner reports
    /// it taken. Unreachable owners do not block the claim.
    ClaimCode {
        code: String,
        reply: oneshot::Sender<bool>,
    },
    /// Release a previously claimed code.
    ReleaseCode { code: String },
    /// Forward a pair request to the server holding `target_code`;
    /// reply false if no holder could be found or reached.
    ForwardRequest {
        requester_code: String,
        target_code: String,
        reply: oneshot::Sender<bool>,
    },
    /// Route a response back to the requester's server.
    ForwardResponse {
        origin: wasl_types::ServerId,
        requester_code: String,
        target_code: String,
        accepted: bool,
    },
    /// Route a cancel to the target's server.
    ForwardCancel {
        requester_code: String,
        target_code: String,
    },
}

/// Pairing tunables.
#[derive(Clone, Debug)]
pub struct PairingConfig {
    /// Approval window for a pair request.
    pub request_timeout: Duration,
    /// Warning lead time before expiry.
    pub warning_time: Duration,
    /// In-flight pending requests allowed per target code.
    pub max_pending_per_target: usize,
    /// How long a completed pair authorizes signaling relay.
    pub pair_ttl: Duration,
    /// Cluster claim/lookup RPC budget.
    pub claim_timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(wasl_types::PAIR_REQUEST_TIMEOUT_MS),
            warning_time: Duration::from_millis(wasl_types::PAIR_WARNING_MS),
            max_pending_per_target: wasl_types::MAX_PENDING_REQUESTS_PER_TARGET,
            pair_ttl: Duration::from_secs(24 * 60 * 60),
            claim_timeout: Duration::from_secs(5),
        }
    }
}

/// Error types for pairing operations.
#[derive(Debug, thiserror::Error)]
pub enum PairError {
    /// Code fails the alphabet/length check.
    #[error("invalid code")]
    InvalidCode,

    /// Code is live somewhere in the cluster; the client picks another.
    #[error("code taken")]
    CodeTaken,

    /// The connection has not registered a code yet.
    #[error("not registered")]
    NotRegistered,

    /// No live registration for the target code.
    #[error("unknown target")]
    UnknownTarget,

    /// The target already has the maximum pending requests.
    #[error("too many pending requests")]
    TooManyPending,

    /// No pending request matches this response/cancel.
    #[error("no pending request")]
    NoPendingRequest,

    /// The registry is shutting down.
    #[error("cluster channel closed")]
    ClusterClosed,
}

impl PairError {
    /// Machine-readable code carried in `pair_error` frames.
    pub fn wire_code(&self) -> &'static str {
        match self {
            PairError::InvalidCode => "invalid_code",
            PairError::CodeTaken => "code_taken",
            PairError::NotRegistered => "not_registered",
            PairError::UnknownTarget => "unknown_target",
            PairError::TooManyPending => "too_many_pending",
            PairError::NoPendingRequest => "no_pending_request",
            PairError::ClusterClosed => "unavailable",
        }
    }
}

/// Convenience result type for pairing operations.
pub type Result<T> = std::result::Result<T, PairError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PairingConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.warning_time, Duration::from_secs(30));
        assert_eq!(config.max_pending_per_target, 10);
    }

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(PairError::CodeTaken.wire_code(), "code_taken");
        assert_eq!(PairError::UnknownTarget.wire_code(), "unknown_target");
    }
}
