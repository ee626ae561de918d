//! Server, node and peer identifiers.
//!
//! A server's durable identity is its Ed25519 public key. Two derived forms
//! circulate in the protocol:
//!
//! - [`ServerId`] — `"ed25519:" + base64(publicKey)`. Human-pasteable,
//!   self-certifying: the id *is* the key, so any signed message can be
//!   verified against the claimed sender without a lookup.
//! - [`NodeId`] — the first 20 bytes of `SHA-256(publicKey)`, hex-encoded.
//!   Used for hash-ring placement where a fixed-width value is needed.
//!
//! Both derivations must be bit-reproducible across implementations; the
//! actual hashing lives in `wasl-identity` so this crate stays free of
//! crypto dependencies beyond encoding.

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{Result, TypeError};

/// Prefix distinguishing Ed25519-derived server ids.
pub const SERVER_ID_PREFIX: &str = "ed25519:";

/// A server's public identity: `ed25519:<base64 public key>`.
///
/// Ordered lexicographically; that order is load-bearing for ring
/// tie-breaks and the duplicate-connection tie-break, so it must agree on
/// every node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Build a server id from a raw Ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(public_key);
        Self(format!("{SERVER_ID_PREFIX}{encoded}"))
    }

    /// Parse and validate a server id string.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidServerId`] if the prefix is missing or
    /// the base64 body does not decode to exactly 32 bytes.
    pub fn parse(s: &str) -> Result<Self> {
        let id = Self(s.to_string());
        id.decode_public_key()?;
        Ok(id)
    }

    /// Recover the raw public key encoded in this id.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidServerId`] if the id is malformed.
    pub fn decode_public_key(&self) -> Result<[u8; 32]> {
        let body = self
            .0
            .strip_prefix(SERVER_ID_PREFIX)
            .ok_or_else(|| TypeError::InvalidServerId(self.0.clone()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|_| TypeError::InvalidServerId(self.0.clone()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TypeError::InvalidServerId(self.0.clone()))?;
        Ok(key)
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ServerId> for String {
    fn from(id: ServerId) -> Self {
        id.0
    }
}

/// A 160-bit ring identifier: first 20 bytes of `SHA-256(publicKey)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Parse a 40-character hex string.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidNodeId`] on bad length or non-hex input.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| TypeError::InvalidNodeId(s.to_string()))?;
        let id: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TypeError::InvalidNodeId(s.to_string()))?;
        Ok(Self(id))
    }

    /// The raw 20 bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Hex encoding (40 lowercase characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A client peer identifier (opaque string chosen by the client).
pub type PeerId = String;

/// A per-process client connection identifier.
pub type ConnId = u64;
