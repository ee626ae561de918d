//! Server↔server cluster messages.
//!
//! Peers exchange three frame types: `handshake`, `handshake_ack` and
//! `gossip`. The handshake authenticates the connection; every gossip
//! envelope is individually signed so membership claims and replicated
//! records cannot be forged by a compromised link.
//!
//! Signatures cover the canonical JSON form of the message with the
//! `signature` field removed (see `wasl_identity::canonical`). The signer
//! is always the `server_id`/`from` field, whose base64 body *is* the
//! verification key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use wasl_identity::Keypair;
use wasl_types::{
    DailyPointEntry, HourlyTokenEntry, MembershipEntry, NodeId, RelayEntry, ServerId,
};

use crate::{ProtoError, Result};

/// The signed connection handshake (and its ack, which reuses the shape).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Sender's durable id.
    pub server_id: ServerId,
    /// Sender's ring id.
    pub node_id: NodeId,
    /// Sender's advertised WebSocket endpoint.
    pub endpoint: String,
    /// Base64 public key (must match the id).
    pub public_key: String,
    /// Free-form metadata (region, version).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Unix ms at signing time; stale handshakes are rejected.
    pub timestamp_ms: u64,
    /// Detached signature over the canonical form.
    pub signature: String,
}

impl Handshake {
    /// Build and sign a handshake for this server.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Serialization`] if canonicalization fails.
    pub fn build(
        keypair: &Keypair,
        endpoint: &str,
        metadata: BTreeMap<String, String>,
        timestamp_ms: u64,
    ) -> Result<Self> {
        let mut handshake = Self {
            server_id: keypair.server_id(),
            node_id: keypair.node_id(),
            endpoint: endpoint.to_string(),
            public_key: keypair.public_key_base64(),
            metadata,
            timestamp_ms,
            signature: String::new(),
        };
        handshake.signature = keypair.sign_value(&to_value(&handshake)?)?;
        Ok(handshake)
    }

    /// Verify the signature and internal consistency of a handshake.
    ///
    /// Checks that the signature verifies against `server_id`, and that
    /// `public_key` and `node_id` are actually derived from that key.
    ///
    /// # Errors
    ///
    /// Returns an identity error on any mismatch; callers treat all of
    /// them as a silent drop.
    pub fn verify(&self) -> Result<()> {
        let key = self
            .server_id
            .decode_public_key()
            .map_err(|_| wasl_identity::IdentityError::InvalidServerId(self.server_id.to_string()))?;

        if wasl_identity::keypair::derive_node_id(&key) != self.node_id {
            return Err(wasl_identity::IdentityError::Verification.into());
        }
        let claimed = ServerId::from_public_key(&key);
        if claimed.as_str() != format!("ed25519:{}", self.public_key) {
            return Err(wasl_identity::IdentityError::Verification.into());
        }

        wasl_identity::keypair::verify_value(&self.server_id, &to_value(self)?, &self.signature)?;
        Ok(())
    }
}

/// Cross-server pairing operations, carried inside gossip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PairForwardOp {
    /// Claim a pairing code on its ring owners for `holder`.
    #[serde(rename_all = "camelCase")]
    Claim {
        req_id: u64,
        code: String,
        holder: ServerId,
    },
    /// Answer to a claim: granted, or denied with the existing holder.
    #[serde(rename_all = "camelCase")]
    ClaimResult {
        req_id: u64,
        granted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<ServerId>,
    },
    /// Release a code claim (holder disconnected or unregistered).
    #[serde(rename_all = "camelCase")]
    Release { code: String, holder: ServerId },
    /// Ask the owners which server holds a code.
    #[serde(rename_all = "camelCase")]
    Lookup { req_id: u64, code: String },
    /// Answer to a lookup.
    #[serde(rename_all = "camelCase")]
    LookupResult {
        req_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<ServerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    /// Deliver a pair request to the server holding `target_code`.
    #[serde(rename_all = "camelCase")]
    Request {
        requester_code: String,
        target_code: String,
        origin: ServerId,
    },
    /// Route a pair response back toward the requester's server.
    #[serde(rename_all = "camelCase")]
    Response {
        requester_code: String,
        target_code: String,
        accepted: bool,
    },
    /// Withdraw a forwarded pair request.
    #[serde(rename_all = "camelCase")]
    Cancel {
        requester_code: String,
        target_code: String,
    },
}

/// Gossip envelope payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum GossipPayload {
    /// SWIM direct probe.
    Ping { seq: u64 },
    /// Probe acknowledgement (direct or relayed).
    Ack { seq: u64 },
    /// Ask the receiver to probe `target` on the sender's behalf.
    IndirectPing { target: ServerId, seq: u64 },
    /// Full membership table for anti-entropy reconciliation.
    StateExchange { members: Vec<MembershipEntry> },
    /// Replicate rendezvous records to a ring owner.
    #[serde(rename_all = "camelCase")]
    RvReplicate {
        req_id: u64,
        #[serde(default)]
        daily_points: Vec<DailyPointEntry>,
        #[serde(default)]
        hourly_tokens: Vec<HourlyTokenEntry>,
        #[serde(default)]
        relays: Vec<RelayEntry>,
    },
    /// Acknowledge (or refuse) a replication batch.
    #[serde(rename_all = "camelCase")]
    RvReplicateAck { req_id: u64, accepted: bool },
    /// Forward a client query to a ring owner.
    #[serde(rename_all = "camelCase")]
    RvQueryForward {
        req_id: u64,
        #[serde(default)]
        daily_points: Vec<String>,
        #[serde(default)]
        hourly_tokens: Vec<String>,
    },
    /// Results for a forwarded query, in entry form so clocks merge.
    #[serde(rename_all = "camelCase")]
    RvQueryResult {
        req_id: u64,
        #[serde(default)]
        daily_entries: Vec<DailyPointEntry>,
        #[serde(default)]
        hourly_entries: Vec<HourlyTokenEntry>,
    },
    /// Cross-server pairing traffic.
    PairForward { op: PairForwardOp },
}

/// The signed gossip envelope.
///
/// Membership deltas piggy-back on every envelope so dissemination does
/// not depend on the state-exchange schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipEnvelope {
    /// Signing sender.
    pub from: ServerId,
    /// Unix ms at signing time.
    pub timestamp_ms: u64,
    /// The payload.
    #[serde(flatten)]
    pub payload: GossipPayload,
    /// Piggy-backed membership updates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub membership_delta: Vec<MembershipEntry>,
    /// Detached signature over the canonical form.
    pub signature: String,
}

impl GossipEnvelope {
    /// Build and sign an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Serialization`] if canonicalization fails.
    pub fn build(
        keypair: &Keypair,
        payload: GossipPayload,
        membership_delta: Vec<MembershipEntry>,
        timestamp_ms: u64,
    ) -> Result<Self> {
        let mut envelope = Self {
            from: keypair.server_id(),
            timestamp_ms,
            payload,
            membership_delta,
            signature: String::new(),
        };
        envelope.signature = keypair.sign_value(&to_value(&envelope)?)?;
        Ok(envelope)
    }

    /// Verify the envelope signature against its `from` id.
    ///
    /// # Errors
    ///
    /// Identity errors on any failure; callers drop silently and count.
    pub fn verify(&self) -> Result<()> {
        wasl_identity::keypair::verify_value(&self.from, &to_value(self)?, &self.signature)?;
        Ok(())
    }
}

/// Top-level peer frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Connection opener, sent by the dialing side.
    Handshake(Handshake),
    /// Accepting side's reply.
    HandshakeAck(Handshake),
    /// Steady-state traffic.
    Gossip(GossipEnvelope),
}

impl PeerMessage {
    /// Decode a peer frame.
    ///
    /// # Errors
    ///
    /// [`ProtoError::UnknownType`] / [`ProtoError::Malformed`] per frame.
    pub fn from_json(frame: &str) -> Result<Self> {
        crate::decode_frame(frame)
    }

    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// [`ProtoError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtoError::Serialization(e.to_string()))
    }
}

fn to_value<T: Serialize>(msg: &T) -> Result<serde_json::Value> {
    serde_json::to_value(msg).map_err(|e| ProtoError::Serialization(e.to_string()))
}
