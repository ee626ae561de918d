//! Authenticated relay of WebRTC signaling between paired clients.
//!
//! Accepts `offer`, `answer` and `ice_candidate` frames, verifies the
//! sender and target completed a pair within the pair TTL, rewrites
//! `target` into `from`, and forwards the payload verbatim. Payloads are
//! opaque: never parsed, never logged.

use std::sync::Arc;

use wasl_proto::ServerMessage;

use crate::{ClientSink, PairView};

/// Which signaling frame is being relayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Why a relay attempt was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    /// Sender and target have no live pair.
    #[error("not paired")]
    NotPaired,

    /// The target code has no local connection right now.
    #[error("peer unavailable")]
    PeerUnavailable,
}

/// The signaling relay.
pub struct SignalingRelay {
    view: Arc<dyn PairView>,
    sink: Arc<dyn ClientSink>,
}

impl SignalingRelay {
    /// Create a relay over the given pair state and delivery sink.
    pub fn new(view: Arc<dyn PairView>, sink: Arc<dyn ClientSink>) -> Self {
        Self { view, sink }
    }

    /// Relay one signaling frame from `from_code` to `target_code`.
    ///
    /// # Errors
    ///
    /// [`RelayError::NotPaired`] for unpaired traffic,
    /// [`RelayError::PeerUnavailable`] when the paired peer has no local
    /// connection (or its queue rejected the frame).
    pub fn relay(
        &self,
        from_code: &str,
        target_code: &str,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        if !self.view.is_paired(from_code, target_code) {
            return Err(RelayError::NotPaired);
        }

        let conn_id = self
            .view
            .conn_for_code(target_code)
            .ok_or(RelayError::PeerUnavailable)?;

        let message = match kind {
            SignalKind::Offer => ServerMessage::Offer {
                from: from_code.to_string(),
                payload,
            },
            SignalKind::Answer => ServerMessage::Answer {
                from: from_code.to_string(),
                payload,
            },
            SignalKind::IceCandidate => ServerMessage::IceCandidate {
                from: from_code.to_string(),
                payload,
            },
        };

        if self.sink.send(conn_id, message) {
            Ok(())
        } else {
            Err(RelayError::PeerUnavailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use wasl_types::ConnId;

    #[derive(Default)]
    struct FakePairs {
        pairs: HashMap<String, String>,
        conns: HashMap<String, ConnId>,
    }

    impl PairView for FakePairs {
        fn is_paired(&self, a: &str, b: &str) -> bool {
            self.pairs.get(a).map(String::as_str) == Some(b)
        }
        fn paired_peer(&self, code: &str) -> Option<String> {
            self.pairs.get(code).cloned()
        }
        fn conn_for_code(&self, code: &str) -> Option<ConnId> {
            self.conns.get(code).copied()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(ConnId, ServerMessage)>>,
        reject: bool,
    }

    impl ClientSink for RecordingSink {
        fn send(&self, conn_id: ConnId, message: ServerMessage) -> bool {
            if self.reject {
                return false;
            }
            self.sent
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((conn_id, message));
            true
        }
    }

    fn paired_view() -> FakePairs {
        let mut view = FakePairs::default();
        view.pairs
            .insert("ABC234".to_string(), "XYZ567".to_string());
        view.pairs
            .insert("XYZ567".to_string(), "ABC234".to_string());
        view.conns.insert("ABC234".to_string(), 1);
        view.conns.insert("XYZ567".to_string(), 2);
        view
    }

    #[test]
    fn test_offer_rewrites_target_to_from() {
        let sink = Arc::new(RecordingSink::default());
        let relay = SignalingRelay::new(
            Arc::new(paired_view()),
            Arc::clone(&sink) as Arc<dyn ClientSink>,
        );

        let payload = serde_json::json!({"sdp": "v=0..A"});
        relay
            .relay("ABC234", "XYZ567", SignalKind::Offer, payload.clone())
            .expect("relay");

        let sent = sink
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 2);
        assert_eq!(
            sent[0].1,
            ServerMessage::Offer {
                from: "ABC234".to_string(),
                payload,
            }
        );
    }

    #[test]
    fn test_all_kinds_map_to_their_frame() {
        let sink = Arc::new(RecordingSink::default());
        let relay = SignalingRelay::new(
            Arc::new(paired_view()),
            Arc::clone(&sink) as Arc<dyn ClientSink>,
        );

        for kind in [SignalKind::Offer, SignalKind::Answer, SignalKind::IceCandidate] {
            relay
                .relay("XYZ567", "ABC234", kind, serde_json::json!({}))
                .expect("relay");
        }

        let sent = sink
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(matches!(sent[0].1, ServerMessage::Offer { .. }));
        assert!(matches!(sent[1].1, ServerMessage::Answer { .. }));
        assert!(matches!(sent[2].1, ServerMessage::IceCandidate { .. }));
    }

    #[test]
    fn test_unpaired_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let relay = SignalingRelay::new(
            Arc::new(FakePairs::default()),
            Arc::clone(&sink) as Arc<dyn ClientSink>,
        );

        let err = relay
            .relay("ABC234", "XYZ567", SignalKind::Offer, serde_json::json!({}))
            .expect_err("must reject");
        assert_eq!(err, RelayError::NotPaired);
        assert!(sink
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_empty());
    }

    #[test]
    fn test_paired_but_disconnected_peer() {
        let mut view = paired_view();
        view.conns.remove("XYZ567");
        let relay = SignalingRelay::new(
            Arc::new(view),
            Arc::new(RecordingSink::default()) as Arc<dyn ClientSink>,
        );

        let err = relay
            .relay("ABC234", "XYZ567", SignalKind::Answer, serde_json::json!({}))
            .expect_err("must reject");
        assert_eq!(err, RelayError::PeerUnavailable);
    }

    #[test]
    fn test_full_queue_is_peer_unavailable() {
        let sink = Arc::new(RecordingSink {
            reject: true,
            ..RecordingSink::default()
        });
        let relay = SignalingRelay::new(
            Arc::new(paired_view()),
            Arc::clone(&sink) as Arc<dyn ClientSink>,
        );

        let err = relay
            .relay("ABC234", "XYZ567", SignalKind::Offer, serde_json::json!({}))
            .expect_err("must reject");
        assert_eq!(err, RelayError::PeerUnavailable);
    }
}
