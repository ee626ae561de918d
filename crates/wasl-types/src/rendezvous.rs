//! Replicated rendezvous records.
//!
//! Three record families are replicated across ring owners:
//!
//! - **Daily points** — routing hashes derived (client-side) from a
//!   peer-pair shared secret plus the day. They may carry an encrypted
//!   dead drop, which this server treats strictly as opaque bytes.
//! - **Hourly tokens** — shorter-lived routing hashes whose presence
//!   signals a live peer and optionally the relay it is reachable through.
//! - **Relay entries** — clients currently willing to act as WebRTC
//!   rendezvous relays, with load figures for capacity-aware selection.
//!
//! All merges go through vector clocks; see [`DailyPointEntry::merge`].

use serde::{Deserialize, Serialize};

use crate::{PeerId, VectorClock};

/// A daily rendezvous point, keyed by `(point_hash, peer_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPointEntry {
    /// Client-derived routing hash (hex).
    pub point_hash: String,
    /// Publishing peer.
    pub peer_id: PeerId,
    /// Opaque encrypted dead drop. Never inspected, decoded or logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_drop: Option<String>,
    /// Relay the publisher is reachable through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<PeerId>,
    /// Unix ms expiry; bounded by the daily-point TTL at publish time.
    pub expires_at_ms: u64,
    /// Unix ms of first write.
    pub created_at_ms: u64,
    /// Unix ms of last accepted write.
    pub updated_at_ms: u64,
    /// Per-writer causal clock.
    #[serde(default)]
    pub vector_clock: VectorClock,
}

impl DailyPointEntry {
    /// Merge an incoming replica of the same `(point_hash, peer_id)` key.
    ///
    /// Returns the surviving entry. Clock-dominant writes win outright;
    /// concurrent writes keep the payload with the later `expires_at_ms`
    /// under the merged clock, so the result is identical regardless of
    /// arrival order.
    pub fn merge(self, incoming: DailyPointEntry) -> DailyPointEntry {
        let merged_clock = self.vector_clock.merged(&incoming.vector_clock);

        if incoming.vector_clock.descends(&self.vector_clock) {
            DailyPointEntry {
                vector_clock: merged_clock,
                created_at_ms: self.created_at_ms.min(incoming.created_at_ms),
                ..incoming
            }
        } else if self.vector_clock.descends(&incoming.vector_clock) {
            DailyPointEntry {
                vector_clock: merged_clock,
                created_at_ms: self.created_at_ms.min(incoming.created_at_ms),
                ..self
            }
        } else {
            // Concurrent: deterministic payload pick, later expiry wins;
            // ties broken toward the incoming side only if it expires later.
            let (winner, loser) = if incoming.expires_at_ms > self.expires_at_ms {
                (incoming, self)
            } else {
                (self, incoming)
            };
            DailyPointEntry {
                vector_clock: merged_clock,
                created_at_ms: winner.created_at_ms.min(loser.created_at_ms),
                updated_at_ms: winner.updated_at_ms.max(loser.updated_at_ms),
                ..winner
            }
        }
    }

    /// Whether the entry is expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// An hourly presence token, keyed by `(token_hash, peer_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyTokenEntry {
    /// Client-derived routing hash (hex).
    pub token_hash: String,
    /// Publishing peer.
    pub peer_id: PeerId,
    /// Relay the publisher is reachable through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<PeerId>,
    /// Unix ms expiry; bounded by the hourly-token TTL at publish time.
    pub expires_at_ms: u64,
    /// Unix ms of first write.
    pub created_at_ms: u64,
    /// Per-writer causal clock.
    #[serde(default)]
    pub vector_clock: VectorClock,
}

impl HourlyTokenEntry {
    /// Merge an incoming replica of the same `(token_hash, peer_id)` key.
    ///
    /// Same policy as [`DailyPointEntry::merge`].
    pub fn merge(self, incoming: HourlyTokenEntry) -> HourlyTokenEntry {
        let merged_clock = self.vector_clock.merged(&incoming.vector_clock);

        if incoming.vector_clock.descends(&self.vector_clock) {
            HourlyTokenEntry {
                vector_clock: merged_clock,
                created_at_ms: self.created_at_ms.min(incoming.created_at_ms),
                ..incoming
            }
        } else if self.vector_clock.descends(&incoming.vector_clock) {
            HourlyTokenEntry {
                vector_clock: merged_clock,
                created_at_ms: self.created_at_ms.min(incoming.created_at_ms),
                ..self
            }
        } else {
            let (winner, loser) = if incoming.expires_at_ms > self.expires_at_ms {
                (incoming, self)
            } else {
                (self, incoming)
            };
            HourlyTokenEntry {
                vector_clock: merged_clock,
                created_at_ms: winner.created_at_ms.min(loser.created_at_ms),
                ..winner
            }
        }
    }

    /// Whether the token is expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// A client willing to act as a WebRTC rendezvous relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEntry {
    /// The relaying peer.
    pub peer_id: PeerId,
    /// Connection slots the relay offers.
    pub max_connections: u32,
    /// Slots currently in use.
    pub connected_count: u32,
    /// Optional pinned public key for the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Unix ms of registration.
    pub registered_at_ms: u64,
    /// Unix ms of the last load update.
    pub last_update_ms: u64,
}

impl RelayEntry {
    /// Load ratio in `[0, 1]`; a relay with zero capacity is fully loaded.
    pub fn load_ratio(&self) -> f64 {
        if self.max_connections == 0 {
            return 1.0;
        }
        f64::from(self.connected_count) / f64::from(self.max_connections)
    }

    /// Whether the relay can accept another connection under `max_cap_ratio`.
    pub fn has_capacity(&self, max_cap_ratio: f64) -> bool {
        self.load_ratio() < max_cap_ratio
    }
}

/// A live-presence hit returned from hourly-token lookup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMatch {
    /// The queried token hash this hit answers.
    pub token_hash: String,
    /// The live peer.
    pub peer_id: PeerId,
    /// Relay the peer is reachable through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<PeerId>,
}

impl From<&HourlyTokenEntry> for LiveMatch {
    fn from(entry: &HourlyTokenEntry) -> Self {
        Self {
            token_hash: entry.token_hash.clone(),
            peer_id: entry.peer_id.clone(),
            relay_id: entry.relay_id.clone(),
        }
    }
}

/// A dead-drop hit returned from daily-point lookup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadDropHit {
    /// The queried point hash this hit answers.
    pub point_hash: String,
    /// The publishing peer.
    pub peer_id: PeerId,
    /// Opaque ciphertext, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_drop: Option<String>,
    /// Relay hint, if published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<PeerId>,
}

impl From<&DailyPointEntry> for DeadDropHit {
    fn from(entry: &DailyPointEntry) -> Self {
        Self {
            point_hash: entry.point_hash.clone(),
            peer_id: entry.peer_id.clone(),
            dead_drop: entry.dead_drop.clone(),
            relay_id: entry.relay_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_point(writer: &str, counter: u64, expires: u64, drop: &str) -> DailyPointEntry {
        DailyPointEntry {
            point_hash: "aabb".to_string(),
            peer_id: "peer-1".to_string(),
            dead_drop: Some(drop.to_string()),
            relay_id: None,
            expires_at_ms: expires,
            created_at_ms: 100,
            updated_at_ms: 100,
            vector_clock: VectorClock::single(writer, counter),
        }
    }

    #[test]
    fn test_merge_dominant_clock_wins() {
        let old = make_point("s1", 1, 5000, "old");
        let mut newer = make_point("s1", 2, 4000, "new");
        newer.vector_clock = {
            let mut vc = old.vector_clock.clone();
            vc.increment("s1");
            vc
        };

        let merged = old.clone().merge(newer.clone());
        assert_eq!(merged.dead_drop.as_deref(), Some("new"));
        assert_eq!(merged.vector_clock.get("s1"), 2);

        // Reversed argument order gives the same payload
        let merged_rev = newer.merge(old);
        assert_eq!(merged_rev.dead_drop.as_deref(), Some("new"));
    }

    #[test]
    fn test_merge_concurrent_keeps_later_expiry() {
        let a = make_point("s1", 1, 5000, "from-s1");
        let b = make_point("s2", 1, 9000, "from-s2");

        let ab = a.clone().merge(b.clone());
        let ba = b.merge(a);
        assert_eq!(ab, ba);
        assert_eq!(ab.dead_drop.as_deref(), Some("from-s2"));
        assert_eq!(ab.vector_clock.get("s1"), 1);
        assert_eq!(ab.vector_clock.get("s2"), 1);
    }

    #[test]
    fn test_merge_idempotent() {
        let a = make_point("s1", 1, 5000, "x");
        let merged = a.clone().merge(a.clone());
        assert_eq!(merged, a);
    }

    #[test]
    fn test_expiry_check() {
        let point = make_point("s1", 1, 5000, "x");
        assert!(!point.is_expired(4999));
        assert!(point.is_expired(5000));
        assert!(point.is_expired(5001));
    }

    #[test]
    fn test_hourly_merge_concurrent_deterministic() {
        let a = HourlyTokenEntry {
            token_hash: "cc".to_string(),
            peer_id: "p".to_string(),
            relay_id: Some("relay-a".to_string()),
            expires_at_ms: 1000,
            created_at_ms: 10,
            vector_clock: VectorClock::single("s1", 1),
        };
        let b = HourlyTokenEntry {
            relay_id: Some("relay-b".to_string()),
            expires_at_ms: 2000,
            vector_clock: VectorClock::single("s2", 1),
            ..a.clone()
        };
        let ab = a.clone().merge(b.clone());
        let ba = b.merge(a);
        assert_eq!(ab, ba);
        assert_eq!(ab.relay_id.as_deref(), Some("relay-b"));
    }

    #[test]
    fn test_relay_load_ratio() {
        let relay = RelayEntry {
            peer_id: "r".to_string(),
            max_connections: 4,
            connected_count: 3,
            public_key: None,
            registered_at_ms: 0,
            last_update_ms: 0,
        };
        assert!((relay.load_ratio() - 0.75).abs() < f64::EPSILON);
        assert!(relay.has_capacity(0.8));
        assert!(!relay.has_capacity(0.75));
    }

    #[test]
    fn test_relay_zero_capacity_is_full() {
        let relay = RelayEntry {
            peer_id: "r".to_string(),
            max_connections: 0,
            connected_count: 0,
            public_key: None,
            registered_at_ms: 0,
            last_update_ms: 0,
        };
        assert!(!relay.has_capacity(0.99));
    }

    #[test]
    fn test_live_match_from_token() {
        let token = HourlyTokenEntry {
            token_hash: "dd".to_string(),
            peer_id: "p2".to_string(),
            relay_id: Some("r1".to_string()),
            expires_at_ms: 99,
            created_at_ms: 1,
            vector_clock: VectorClock::new(),
        };
        let hit = LiveMatch::from(&token);
        assert_eq!(hit.token_hash, "dd");
        assert_eq!(hit.peer_id, "p2");
        assert_eq!(hit.relay_id.as_deref(), Some("r1"));
    }
}
