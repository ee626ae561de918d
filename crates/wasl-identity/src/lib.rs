//! # wasl-identity
//!
//! Server identity for the wasl cluster: an Ed25519 keypair generated at
//! first boot and persisted, plus the derived identifiers and the
//! canonical-JSON signing scheme every signed cluster message uses.
//!
//! - `server_id = "ed25519:" + base64(publicKey)` — self-certifying.
//! - `node_id = hex(SHA-256(publicKey)[..20])` — ring placement.
//! - Signatures cover the canonical form of a JSON object: keys
//!   recursively sorted, no insignificant whitespace, `signature` field
//!   excluded. The canonical form is bit-reproducible across
//!   implementations, so any two servers agree on what was signed.

pub mod canonical;
pub mod keypair;

pub use canonical::{canonical_string, signable_value};
pub use keypair::Keypair;

/// Error types for identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The key file exists but cannot be read or has the wrong length.
    ///
    /// Fatal at startup: a server must never boot with an identity it
    /// cannot prove, or the ring would desync.
    #[error("key file unreadable: {0}")]
    KeyFile(String),

    /// Signature verification failed.
    #[error("signature verification failed")]
    Verification,

    /// The claimed server id does not decode to a valid public key.
    #[error("invalid server id: {0}")]
    InvalidServerId(String),

    /// A signature string is not valid base64 of 64 bytes.
    #[error("malformed signature")]
    MalformedSignature,

    /// JSON (de)serialization failed while canonicalizing.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;
