//! # wasl-ring
//!
//! Consistent-hash ring with virtual nodes for routing rendezvous keys to
//! their owner servers.
//!
//! Every node occupies `V` virtual positions (default 150) on a 160-bit
//! ring. Positions are `SHA-256(nodeIdHex ":" index)` truncated to 20
//! bytes; keys map to `SHA-256(key)` truncated the same way. The owners
//! of a key are the first `k` *distinct* nodes whose status is `alive`,
//! walking clockwise (with wrap-around) from the key position.
//!
//! ## Determinism
//!
//! Two servers with the same membership view must compute identical
//! owner lists, or replication and redirects would desync. Positions
//! compare as 160-bit big-endian unsigned integers; equal positions
//! break ties by lexicographic `server_id`. Nothing here depends on
//! insertion order or process-local state.

pub mod ring;

pub use ring::{HashRing, RingNode, RingPosition};

/// Default virtual positions per node.
pub const DEFAULT_VIRTUAL_NODES: usize = wasl_types::DEFAULT_VIRTUAL_NODES;

/// Error types for ring operations.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// The referenced server is not on the ring.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A node with this server id is already on the ring.
    #[error("duplicate node: {0}")]
    DuplicateNode(String),
}

/// Convenience result type for ring operations.
pub type Result<T> = std::result::Result<T, RingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RingError::UnknownNode("ed25519:abc".to_string());
        assert!(err.to_string().contains("ed25519:abc"));
    }
}
