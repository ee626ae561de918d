//! Cluster membership entries.
//!
//! One [`MembershipEntry`] exists per known server. Entries are created by
//! transport handshakes or gossip dissemination, mutated by the failure
//! detector, and deleted only on an explicit `left`. The incarnation
//! number is the per-server global order: higher incarnation always wins,
//! and at equal incarnation the higher [`PeerStatus`] severity wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{NodeId, ServerId};

/// Liveness state of a cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Responding to probes; participates in routing.
    Alive,
    /// Failed a direct and indirect probe round; still routed around.
    Suspect,
    /// Suspicion timed out; excluded from routing, retained for gossip.
    Failed,
    /// Departed cleanly; entry is removed.
    Left,
}

impl PeerStatus {
    /// Severity used for same-incarnation reconciliation.
    ///
    /// A claim with higher severity overrides one with lower severity at
    /// the same incarnation; `alive` can only reassert itself by raising
    /// the incarnation.
    pub fn priority(self) -> u8 {
        match self {
            PeerStatus::Alive => 0,
            PeerStatus::Suspect => 1,
            PeerStatus::Failed => 2,
            PeerStatus::Left => 3,
        }
    }

    /// Whether this status participates in ring routing.
    pub fn is_routable(self) -> bool {
        self == PeerStatus::Alive
    }
}

/// Everything the cluster knows about one server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEntry {
    /// Self-certifying server id.
    pub server_id: ServerId,
    /// Ring placement id derived from the public key.
    pub node_id: NodeId,
    /// Advertised WebSocket endpoint, e.g. `wss://host:port`.
    pub endpoint: String,
    /// Base64 Ed25519 public key (redundant with `server_id`, kept for
    /// wire compatibility with clients that pin keys directly).
    pub public_key: String,
    /// Current liveness state.
    pub status: PeerStatus,
    /// Monotonically increasing per-server counter.
    pub incarnation: u64,
    /// Unix ms of the last message or probe response seen from this peer.
    pub last_seen_ms: u64,
    /// Free-form metadata (region, version, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MembershipEntry {
    /// Whether a remote claim `(incarnation, status)` supersedes this entry.
    ///
    /// Higher incarnation always wins. At equal incarnation the claim wins
    /// only with strictly higher status severity. Lower incarnation never
    /// wins.
    pub fn superseded_by(&self, incarnation: u64, status: PeerStatus) -> bool {
        match incarnation.cmp(&self.incarnation) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => status.priority() > self.status.priority(),
            std::cmp::Ordering::Less => false,
        }
    }
}
