//! The hash ring itself.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use wasl_types::{NodeId, PeerStatus, ServerId};

use crate::{Result, RingError};

/// A 160-bit ring position, compared as a big-endian unsigned integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingPosition(pub [u8; 20]);

impl RingPosition {
    /// Map arbitrary bytes onto the ring: `SHA-256(input)[..20]`.
    pub fn of(input: &[u8]) -> Self {
        let digest = Sha256::digest(input);
        let mut pos = [0u8; 20];
        pos.copy_from_slice(&digest[..20]);
        Self(pos)
    }

    /// Hex encoding, mostly for logs and tests.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// A server as seen by the ring.
#[derive(Clone, Debug, PartialEq)]
pub struct RingNode {
    /// Durable server id; also the tie-break key.
    pub server_id: ServerId,
    /// Hash-derived ring id the virtual positions are seeded from.
    pub node_id: NodeId,
    /// Advertised WebSocket endpoint, forwarded in redirects.
    pub endpoint: String,
    /// Liveness; only `alive` nodes are eligible owners.
    pub status: PeerStatus,
}

impl RingNode {
    /// Compute this node's virtual positions.
    ///
    /// Position `i` is `SHA-256("<nodeIdHex>:<i>")[..20]`; index 0 is the
    /// primary position. The derivation uses only wire-visible data, so
    /// every server computes the same layout.
    pub fn virtual_positions(&self, count: usize) -> Vec<RingPosition> {
        let id_hex = self.node_id.to_hex();
        (0..count)
            .map(|index| RingPosition::of(format!("{id_hex}:{index}").as_bytes()))
            .collect()
    }
}

/// Consistent-hash ring over the cluster membership.
pub struct HashRing {
    /// Virtual positions per node.
    virtual_nodes: usize,
    /// Known nodes by server id.
    nodes: HashMap<ServerId, RingNode>,
    /// All virtual positions, sorted by `(position, server_id)`.
    ///
    /// Rebuilt on every membership change; lookups are binary searches.
    positions: Vec<(RingPosition, ServerId)>,
}

impl HashRing {
    /// Create an empty ring with `virtual_nodes` positions per node.
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            nodes: HashMap::new(),
            positions: Vec::new(),
        }
    }

    /// Add a node to the ring.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::DuplicateNode`] if the server is already present.
    pub fn add_node(&mut self, node: RingNode) -> Result<()> {
        if self.nodes.contains_key(&node.server_id) {
            return Err(RingError::DuplicateNode(node.server_id.to_string()));
        }
        tracing::debug!(server_id = %node.server_id, status = ?node.status, "ring add");
        self.nodes.insert(node.server_id.clone(), node);
        self.rebuild();
        Ok(())
    }

    /// Remove a node entirely.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::UnknownNode`] if the server is not present.
    pub fn remove_node(&mut self, server_id: &ServerId) -> Result<RingNode> {
        let node = self
            .nodes
            .remove(server_id)
            .ok_or_else(|| RingError::UnknownNode(server_id.to_string()))?;
        tracing::debug!(server_id = %server_id, "ring remove");
        self.rebuild();
        Ok(node)
    }

    /// Update a node's liveness status.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::UnknownNode`] if the server is not present.
    pub fn update_status(&mut self, server_id: &ServerId, status: PeerStatus) -> Result<()> {
        let node = self
            .nodes
            .get_mut(server_id)
            .ok_or_else(|| RingError::UnknownNode(server_id.to_string()))?;
        node.status = status;
        Ok(())
    }

    /// Look up a node.
    pub fn node(&self, server_id: &ServerId) -> Option<&RingNode> {
        self.nodes.get(server_id)
    }

    /// All nodes, any status.
    pub fn nodes(&self) -> impl Iterator<Item = &RingNode> {
        self.nodes.values()
    }

    /// Number of nodes, any status.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of alive nodes.
    pub fn alive_count(&self) -> usize {
        self.nodes.values().filter(|n| n.status.is_routable()).count()
    }

    /// The first `k` distinct alive nodes clockwise from `key`'s position.
    ///
    /// Returns fewer than `k` nodes if fewer are alive; an empty vec on an
    /// empty or fully-down ring.
    pub fn responsible_nodes(&self, key: &str, k: usize) -> Vec<RingNode> {
        if k == 0 || self.positions.is_empty() {
            return Vec::new();
        }

        let target = RingPosition::of(key.as_bytes());
        let start = self
            .positions
            .partition_point(|(pos, _)| *pos < target);

        let mut owners: Vec<RingNode> = Vec::with_capacity(k);
        for offset in 0..self.positions.len() {
            let (_, server_id) = &self.positions[(start + offset) % self.positions.len()];
            if owners.iter().any(|n| &n.server_id == server_id) {
                continue;
            }
            if let Some(node) = self.nodes.get(server_id) {
                if node.status.is_routable() {
                    owners.push(node.clone());
                    if owners.len() == k {
                        break;
                    }
                }
            }
        }
        owners
    }

    /// The single node owning `key`, if any node is alive.
    pub fn primary_owner(&self, key: &str) -> Option<RingNode> {
        self.responsible_nodes(key, 1).into_iter().next()
    }

    /// Whether `server_id` is among the first `replication_factor` owners
    /// of `key`.
    pub fn is_responsible(&self, key: &str, server_id: &ServerId, replication_factor: usize) -> bool {
        self.responsible_nodes(key, replication_factor)
            .iter()
            .any(|n| &n.server_id == server_id)
    }

    /// Rebuild the sorted virtual-position list.
    ///
    /// Positions sort by `(position, server_id)`; the secondary key makes
    /// the (astronomically unlikely) position collision deterministic
    /// across servers.
    fn rebuild(&mut self) {
        self.positions.clear();
        for node in self.nodes.values() {
            for pos in node.virtual_positions(self.virtual_nodes) {
                self.positions.push((pos, node.server_id.clone()));
            }
        }
        self.positions.sort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(byte: u8, status: PeerStatus) -> RingNode {
        // Mirror the real derivation: node_id = sha256(public_key)[..20]
        let public_key = [byte; 32];
        let digest = Sha256::digest(public_key);
        let mut node_id = [0u8; 20];
        node_id.copy_from_slice(&digest[..20]);
        RingNode {
            server_id: ServerId::from_public_key(&public_key),
            node_id: NodeId(node_id),
            endpoint: format!("ws://10.0.0.{byte}:9000"),
            status,
        }
    }

    fn make_ring(count: u8) -> HashRing {
        let mut ring = HashRing::new(32);
        for byte in 1..=count {
            ring.add_node(make_node(byte, PeerStatus::Alive)).expect("add");
        }
        ring
    }

    #[test]
    fn test_positions_are_deterministic() {
        let node = make_node(1, PeerStatus::Alive);
        let a = node.virtual_positions(150);
        let b = node.virtual_positions(150);
        assert_eq!(a, b);
        assert_eq!(a.len(), 150);
        // All positions distinct for one node
        let mut dedup = a.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), a.len());
    }

    #[test]
    fn test_same_membership_same_owners() {
        // Build two rings with different insertion orders
        let mut forward = HashRing::new(64);
        let mut reverse = HashRing::new(64);
        for byte in 1..=5 {
            forward.add_node(make_node(byte, PeerStatus::Alive)).expect("add");
        }
        for byte in (1..=5).rev() {
            reverse.add_node(make_node(byte, PeerStatus::Alive)).expect("add");
        }

        for key in ["k1", "k2", "deadbeef", "7fa3", ""] {
            let a: Vec<_> = forward
                .responsible_nodes(key, 3)
                .into_iter()
                .map(|n| n.server_id)
                .collect();
            let b: Vec<_> = reverse
                .responsible_nodes(key, 3)
                .into_iter()
                .map(|n| n.server_id)
                .collect();
            assert_eq!(a, b, "owner divergence for key {key}");
        }
    }

    #[test]
    fn test_owners_are_distinct() {
        let ring = make_ring(4);
        let owners = ring.responsible_nodes("some-key", 3);
        assert_eq!(owners.len(), 3);
        let mut ids: Vec<_> = owners.iter().map(|n| n.server_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_k_larger_than_cluster() {
        let ring = make_ring(2);
        let owners = ring.responsible_nodes("key", 5);
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(150);
        assert!(ring.responsible_nodes("key", 3).is_empty());
        assert!(ring.primary_owner("key").is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_non_alive_nodes_excluded() {
        let mut ring = make_ring(3);
        let suspect = make_node(2, PeerStatus::Alive).server_id;
        ring.update_status(&suspect, PeerStatus::Failed).expect("update");

        assert_eq!(ring.alive_count(), 2);
        let owners = ring.responsible_nodes("any-key", 3);
        assert_eq!(owners.len(), 2);
        assert!(owners.iter().all(|n| n.server_id != suspect));
    }

    #[test]
    fn test_status_flap_restores_ownership() {
        let mut ring = make_ring(3);
        let id = make_node(1, PeerStatus::Alive).server_id;

        let before: Vec<_> = ring
            .responsible_nodes("stable-key", 3)
            .into_iter()
            .map(|n| n.server_id)
            .collect();

        ring.update_status(&id, PeerStatus::Suspect).expect("suspect");
        ring.update_status(&id, PeerStatus::Alive).expect("alive");

        let after: Vec<_> = ring
            .responsible_nodes("stable-key", 3)
            .into_iter()
            .map(|n| n.server_id)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_primary_is_first_owner() {
        let ring = make_ring(5);
        let owners = ring.responsible_nodes("k", 3);
        let primary = ring.primary_owner("k").expect("primary");
        assert_eq!(primary.server_id, owners[0].server_id);
    }

    #[test]
    fn test_is_responsible() {
        let ring = make_ring(5);
        let owners = ring.responsible_nodes("k", 2);
        assert!(ring.is_responsible("k", &owners[0].server_id, 2));
        assert!(ring.is_responsible("k", &owners[1].server_id, 2));
        // The primary of some other key need not own this one with r=1
        let all = ring.responsible_nodes("k", 5);
        assert!(!ring.is_responsible("k", &all[4].server_id, 2));
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut ring = make_ring(1);
        let err = ring
            .add_node(make_node(1, PeerStatus::Alive))
            .expect_err("must reject");
        assert!(matches!(err, RingError::DuplicateNode(_)));
    }

    #[test]
    fn test_remove_unknown_rejected() {
        let mut ring = make_ring(1);
        let ghost = make_node(9, PeerStatus::Alive).server_id;
        assert!(matches!(
            ring.remove_node(&ghost),
            Err(RingError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_remove_reassigns_keys() {
        let mut ring = make_ring(3);
        let victim = ring.primary_owner("moving-key").expect("primary").server_id;
        ring.remove_node(&victim).expect("remove");
        let new_primary = ring.primary_owner("moving-key").expect("primary");
        assert_ne!(new_primary.server_id, victim);
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let ring = make_ring(4);
        let mut counts: HashMap<ServerId, usize> = HashMap::new();
        for i in 0..1000 {
            let owner = ring.primary_owner(&format!("key-{i}")).expect("owner");
            *counts.entry(owner.server_id).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 4);
        // With 32 virtual nodes each, no node should own an extreme share.
        for (_, count) in counts {
            assert!(count > 100, "distribution too skewed: {count}/1000");
            assert!(count < 500, "distribution too skewed: {count}/1000");
        }
    }

    #[test]
    fn test_wrap_around() {
        // A key whose position lands after the last virtual position must
        // wrap to the first. Exercise many keys so the wrap branch runs.
        let ring = make_ring(2);
        for i in 0..64 {
            let owners = ring.responsible_nodes(&format!("wrap-{i}"), 2);
            assert_eq!(owners.len(), 2);
        }
    }
}
