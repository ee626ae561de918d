//! Client-facing WebSocket messages.
//!
//! Every frame is a single-line JSON object tagged by `type`. Field names
//! are camelCase on the wire. Signaling payloads (`offer`, `answer`,
//! `ice_candidate`) and dead drops are carried as opaque JSON values and
//! are never inspected.

use serde::{Deserialize, Serialize};

use wasl_types::{DeadDropHit, LiveMatch, ServerId};

use crate::Result;

/// Messages a client sends to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Claim a pairing code for this connection.
    #[serde(rename_all = "camelCase")]
    Register {
        pairing_code: String,
        public_key: String,
    },
    /// Ask to pair with the holder of `target_code`.
    #[serde(rename_all = "camelCase")]
    PairRequest { target_code: String },
    /// Accept or reject an incoming pair request.
    #[serde(rename_all = "camelCase")]
    PairResponse { target_code: String, accepted: bool },
    /// Withdraw an outgoing pair request.
    #[serde(rename_all = "camelCase")]
    PairCancel { target_code: String },
    /// WebRTC offer for a paired peer. Payload is opaque.
    Offer {
        target: String,
        payload: serde_json::Value,
    },
    /// WebRTC answer for a paired peer. Payload is opaque.
    Answer {
        target: String,
        payload: serde_json::Value,
    },
    /// ICE candidate for a paired peer. Payload is opaque.
    IceCandidate {
        target: String,
        payload: serde_json::Value,
    },
    /// Publish a daily rendezvous point, optionally with a dead drop.
    #[serde(rename_all = "camelCase")]
    RvPublishDaily {
        point_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dead_drop: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    /// Publish an hourly presence token.
    #[serde(rename_all = "camelCase")]
    RvPublishHourly {
        token_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    /// Query daily points and hourly tokens in one round trip.
    #[serde(rename_all = "camelCase")]
    RvQuery {
        #[serde(default)]
        daily_points: Vec<String>,
        #[serde(default)]
        hourly_tokens: Vec<String>,
    },
    /// Announce willingness to act as a WebRTC relay.
    #[serde(rename_all = "camelCase")]
    RelayAnnounce {
        max_connections: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// Update this relay's load figure.
    #[serde(rename_all = "camelCase")]
    RelayUpdate { connected_count: u32 },
    /// Liveness probe; answered with `pong`.
    Ping,
}

impl ClientMessage {
    /// Decode a client frame.
    ///
    /// # Errors
    ///
    /// [`crate::ProtoError::UnknownType`] for unrecognized `type` tags,
    /// [`crate::ProtoError::Malformed`] for anything else invalid.
    pub fn from_json(frame: &str) -> Result<Self> {
        crate::decode_frame(frame)
    }
}

/// A redirect hint pointing the client at the servers that own keys this
/// server could not answer for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirect {
    /// Owner server id.
    pub server_id: ServerId,
    /// Owner's advertised WebSocket endpoint.
    pub endpoint: String,
    /// Daily-point hashes to re-query there.
    #[serde(default)]
    pub daily_points: Vec<String>,
    /// Hourly-token hashes to re-query there.
    #[serde(default)]
    pub hourly_tokens: Vec<String>,
}

/// Messages the server sends to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting: proves the server holds the key behind its id.
    #[serde(rename_all = "camelCase")]
    ServerInfo {
        server_id: ServerId,
        public_key: String,
        nonce: String,
        signature: String,
    },
    /// Pairing-code registration succeeded.
    #[serde(rename_all = "camelCase")]
    Registered { server_id: ServerId },
    /// Someone asked to pair with this client.
    #[serde(rename_all = "camelCase")]
    PairIncoming { from_code: String },
    /// Pairing established; `is_initiator` differs on the two sides.
    #[serde(rename_all = "camelCase")]
    PairMatched { peer_code: String, is_initiator: bool },
    /// The pending request is close to expiry.
    #[serde(rename_all = "camelCase")]
    PairWarning { seconds_remaining: u64 },
    /// The pending request timed out.
    PairExpired,
    /// The other side declined or cancelled.
    PairRejected,
    /// A pairing operation failed; `code` is machine-readable.
    PairError { code: String },
    /// Relayed WebRTC offer. Payload forwarded verbatim.
    Offer {
        from: String,
        payload: serde_json::Value,
    },
    /// Relayed WebRTC answer. Payload forwarded verbatim.
    Answer {
        from: String,
        payload: serde_json::Value,
    },
    /// Relayed ICE candidate. Payload forwarded verbatim.
    IceCandidate {
        from: String,
        payload: serde_json::Value,
    },
    /// Complete rendezvous answer: every queried key was resolved.
    #[serde(rename_all = "camelCase")]
    RendezvousResult {
        live_matches: Vec<LiveMatch>,
        dead_drops: Vec<DeadDropHit>,
    },
    /// Partial rendezvous answer plus redirects for the remainder.
    #[serde(rename_all = "camelCase")]
    RendezvousPartial {
        live_matches: Vec<LiveMatch>,
        dead_drops: Vec<DeadDropHit>,
        redirects: Vec<Redirect>,
    },
    /// Liveness reply.
    Pong,
    /// Typed error; the connection stays open unless noted otherwise.
    Error {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// [`crate::ProtoError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| crate::ProtoError::Serialization(e.to_string()))
    }

    /// Shorthand for a typed error frame.
    pub fn error(code: &str) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: None,
        }
    }
}
