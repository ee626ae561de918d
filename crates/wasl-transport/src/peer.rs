//! Connected-peer registry.
//!
//! One [`PeerHandle`] per live peer connection, regardless of which side
//! dialed. The handle is an outbound mpsc queue; the task that owns the
//! socket pumps the queue into its sink. Dropping the handle's receiver
//! (by replacing or unregistering it) ends that pump and closes the
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use wasl_proto::PeerMessage;
use wasl_types::ServerId;

use crate::{Result, TransportError};

/// Which side opened the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    /// We dialed the peer.
    Outgoing,
    /// The peer dialed us.
    Incoming,
}

/// What `register` decided about a new connection.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// The connection is registered; pump its receiver.
    Registered(mpsc::Receiver<PeerMessage>),
    /// A surviving duplicate exists; close the new connection with
    /// reason `duplicate`.
    RejectDuplicate,
}

struct PeerHandle {
    sender: mpsc::Sender<PeerMessage>,
    kind: ConnectionKind,
}

/// Registry of live peer connections with bounded outbound queues.
pub struct PeerManager {
    local_id: ServerId,
    queue_len: usize,
    peers: Mutex<HashMap<ServerId, PeerHandle>>,
}

impl PeerManager {
    /// Create a manager for this server.
    pub fn new(local_id: ServerId, queue_len: usize) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            queue_len: queue_len.max(1),
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// The local server id (the tie-break operand).
    pub fn local_id(&self) -> &ServerId {
        &self.local_id
    }

    /// Register a connection to `peer_id`.
    ///
    /// Applies the duplicate tie-break: the side with the smaller server
    /// id keeps its *outgoing* connection. A rejected registration means
    /// the caller must close its socket with reason `duplicate`; a
    /// replaced handle closes the old socket by dropping its queue.
    pub async fn register(
        &self,
        peer_id: ServerId,
        kind: ConnectionKind,
    ) -> RegisterOutcome {
        let mut peers = self.peers.lock().await;

        if let Some(existing) = peers.get(&peer_id) {
            let keep_outgoing = self.local_id < peer_id;
            let preferred = if keep_outgoing {
                ConnectionKind::Outgoing
            } else {
                ConnectionKind::Incoming
            };

            if existing.kind == preferred || kind != preferred {
                tracing::debug!(peer = %peer_id, ?kind, "rejecting duplicate connection");
                return RegisterOutcome::RejectDuplicate;
            }
            tracing::debug!(peer = %peer_id, ?kind, "replacing non-preferred duplicate");
        }

        let (tx, rx) = mpsc::channel(self.queue_len);
        peers.insert(peer_id, PeerHandle { sender: tx, kind });
        RegisterOutcome::Registered(rx)
    }

    /// Drop a peer's connection if the sender matches the registered one.
    ///
    /// Called by a connection task when its socket dies, so a replaced
    /// connection does not tear down its successor.
    pub async fn unregister(&self, peer_id: &ServerId) {
        let mut peers = self.peers.lock().await;
        if peers.remove(peer_id).is_some() {
            tracing::debug!(peer = %peer_id, "peer unregistered");
        }
    }

    /// Queue a frame for a peer.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] if no connection exists;
    /// [`TransportError::QueueFull`] if the bounded queue overflowed, in
    /// which case the connection has been dropped (slow peer).
    pub async fn send(&self, peer_id: &ServerId, message: PeerMessage) -> Result<()> {
        let sender = {
            let peers = self.peers.lock().await;
            peers
                .get(peer_id)
                .map(|handle| handle.sender.clone())
                .ok_or_else(|| TransportError::NotConnected(peer_id.to_string()))?
        };

        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer = %peer_id, "outbound queue overflow, dropping peer");
                self.unregister(peer_id).await;
                Err(TransportError::QueueFull(peer_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(peer_id).await;
                Err(TransportError::NotConnected(peer_id.to_string()))
            }
        }
    }

    /// Whether a connection to `peer_id` exists.
    pub async fn is_connected(&self, peer_id: &ServerId) -> bool {
        self.peers.lock().await.contains_key(peer_id)
    }

    /// Ids of all connected peers.
    pub async fn connected(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.peers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_id(byte: u8) -> ServerId {
        ServerId::from_public_key(&[byte; 32])
    }

    fn manager_for(local_byte: u8) -> Arc<PeerManager> {
        PeerManager::new(make_id(local_byte), 4)
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let manager = manager_for(1);
        let peer = make_id(2);

        let RegisterOutcome::Registered(mut rx) =
            manager.register(peer.clone(), ConnectionKind::Outgoing).await
        else {
            panic!("must register");
        };

        let frame = PeerMessage::Gossip(make_envelope());
        manager.send(&peer, frame.clone()).await.expect("send");
        assert_eq!(rx.recv().await.expect("frame"), frame);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let manager = manager_for(1);
        let err = manager
            .send(&make_id(9), PeerMessage::Gossip(make_envelope()))
            .await
            .expect_err("must fail");
        assert!(matches!(err, TransportError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_smaller_id_keeps_outgoing() {
        // local(1) < peer(2): outgoing preferred
        let manager = manager_for(1);
        let peer = make_id(2);

        let RegisterOutcome::Registered(_rx) =
            manager.register(peer.clone(), ConnectionKind::Outgoing).await
        else {
            panic!("must register");
        };

        // Incoming duplicate loses
        let outcome = manager.register(peer.clone(), ConnectionKind::Incoming).await;
        assert!(matches!(outcome, RegisterOutcome::RejectDuplicate));
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_larger_id_keeps_incoming() {
        // local(5) > peer(2): the peer keeps ITS outgoing, which is our
        // incoming side.
        let manager = manager_for(5);
        let peer = make_id(2);

        let RegisterOutcome::Registered(_rx) =
            manager.register(peer.clone(), ConnectionKind::Incoming).await
        else {
            panic!("must register");
        };

        let outcome = manager.register(peer.clone(), ConnectionKind::Outgoing).await;
        assert!(matches!(outcome, RegisterOutcome::RejectDuplicate));
    }

    #[tokio::test]
    async fn test_preferred_replaces_non_preferred() {
        // local(1) < peer(2): an incoming connection that arrived first
        // yields to the outgoing one.
        let manager = manager_for(1);
        let peer = make_id(2);

        let RegisterOutcome::Registered(mut old_rx) =
            manager.register(peer.clone(), ConnectionKind::Incoming).await
        else {
            panic!("must register");
        };

        let RegisterOutcome::Registered(_new_rx) =
            manager.register(peer.clone(), ConnectionKind::Outgoing).await
        else {
            panic!("preferred side must replace");
        };

        // Old queue is closed, so its pump task ends
        assert!(old_rx.recv().await.is_none());
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_peer() {
        let manager = manager_for(1);
        let peer = make_id(2);

        let RegisterOutcome::Registered(_rx) =
            manager.register(peer.clone(), ConnectionKind::Outgoing).await
        else {
            panic!("must register");
        };

        // Queue length is 4; the 5th unconsumed frame overflows
        for _ in 0..4 {
            manager
                .send(&peer, PeerMessage::Gossip(make_envelope()))
                .await
                .expect("queued");
        }
        let err = manager
            .send(&peer, PeerMessage::Gossip(make_envelope()))
            .await
            .expect_err("must overflow");
        assert!(matches!(err, TransportError::QueueFull(_)));
        assert!(!manager.is_connected(&peer).await);
    }

    #[tokio::test]
    async fn test_unregister_idempotent() {
        let manager = manager_for(1);
        let peer = make_id(2);
        manager.unregister(&peer).await;

        let RegisterOutcome::Registered(_rx) =
            manager.register(peer.clone(), ConnectionKind::Outgoing).await
        else {
            panic!("must register");
        };
        manager.unregister(&peer).await;
        manager.unregister(&peer).await;
        assert_eq!(manager.connection_count().await, 0);
    }

    fn make_envelope() -> wasl_proto::GossipEnvelope {
        let keypair = wasl_identity::Keypair::from_secret_bytes(&[9u8; 32]);
        wasl_proto::GossipEnvelope::build(
            &keypair,
            wasl_proto::GossipPayload::Ping { seq: 1 },
            vec![],
            1_000,
        )
        .expect("build envelope")
    }
}
