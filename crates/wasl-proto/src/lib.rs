//! # wasl-proto
//!
//! Wire protocol for the wasl signaling cluster. Two surfaces, both
//! single-line JSON text frames with a `type` tag:
//!
//! - **Client protocol** ([`client`]) — messages between end-user clients
//!   and the server: registration, pair mediation, SDP/ICE relay,
//!   rendezvous publish/query.
//! - **Cluster protocol** ([`cluster`]) — server↔server messages: the
//!   signed handshake and the signed gossip envelope carrying SWIM
//!   probes, state exchange, rendezvous replication and pair forwarding.
//!
//! Parsing is strict at the boundary: a frame either decodes into one of
//! the closed enums here or it is a protocol violation. Unknown `type`
//! tags surface as [`ProtoError::UnknownType`] so the caller can answer
//! `error{code:"unknown_type"}` instead of silently dropping.

pub mod client;
pub mod cluster;

pub use client::{ClientMessage, Redirect, ServerMessage};
pub use cluster::{GossipEnvelope, GossipPayload, Handshake, PairForwardOp, PeerMessage};

/// Maximum accepted WebSocket frame size (64 KiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Error types for protocol encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The frame is not valid JSON or does not match any message schema.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame decodes but its `type` tag is not recognized.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The frame exceeds [`MAX_FRAME_BYTES`].
    #[error("frame too large: {size} bytes, max {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Serializing an outbound message failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Signing or verifying a cluster message failed.
    #[error("identity error: {0}")]
    Identity(#[from] wasl_identity::IdentityError),
}

/// Convenience result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Decode a JSON frame into `T`, distinguishing unknown `type` tags from
/// outright garbage.
pub(crate) fn decode_frame<T: serde::de::DeserializeOwned>(frame: &str) -> Result<T> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(ProtoError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    match serde_json::from_str::<T>(frame) {
        Ok(msg) => Ok(msg),
        Err(err) => {
            // An unrecognized tag gets reported as such so the caller can
            // answer `unknown_type`; a known tag with bad fields stays a
            // plain protocol violation.
            let detail = err.to_string();
            if detail.starts_with("unknown variant") {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(frame) {
                    if let Some(tag) = value.get("type").and_then(|t| t.as_str()) {
                        return Err(ProtoError::UnknownType(tag.to_string()));
                    }
                }
            }
            Err(ProtoError::Malformed(detail))
        }
    }
}
