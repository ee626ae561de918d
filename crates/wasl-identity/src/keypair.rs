//! Ed25519 keypair management and identifier derivation.
//!
//! Wraps `ed25519-dalek` with wasl-specific derivations. The signing key
//! zeroizes its bytes on drop. The keypair is created once at first boot
//! and persisted as a raw 32-byte secret file; every later boot loads the
//! same key, so `server_id` survives restarts while `ephemeral_id`
//! rotates per process.

use std::path::Path;

use base64::Engine;
use ed25519_dalek::{Signer, Verifier};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use wasl_types::{NodeId, ServerId};

use crate::{IdentityError, Result};

/// A server's Ed25519 keypair.
pub struct Keypair {
    signing: ed25519_dalek::SigningKey,
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&self.signing.to_bytes()),
        }
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        let mut bytes = self.signing.to_bytes();
        bytes.zeroize();
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("server_id", &self.server_id())
            .finish()
    }
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Restore a keypair from a 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(secret),
        }
    }

    /// Load the keypair from `path`, generating and persisting a new one
    /// if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyFile`] if the file exists but cannot be
    /// read, has the wrong length, or a fresh key cannot be written.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let bytes =
                std::fs::read(path).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            let mut secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| IdentityError::KeyFile(format!("{}: bad length", path.display())))?;
            let keypair = Self::from_secret_bytes(&secret);
            secret.zeroize();
            tracing::info!(server_id = %keypair.server_id(), "identity loaded");
            Ok(keypair)
        } else {
            let keypair = Self::generate();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            }
            std::fs::write(path, keypair.signing.to_bytes())
                .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            tracing::info!(server_id = %keypair.server_id(), "identity generated");
            Ok(keypair)
        }
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Base64 public key (the body of the server id).
    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.public_key())
    }

    /// The durable server id: `ed25519:<base64 public key>`.
    pub fn server_id(&self) -> ServerId {
        ServerId::from_public_key(&self.public_key())
    }

    /// The ring placement id derived from the public key.
    pub fn node_id(&self) -> NodeId {
        derive_node_id(&self.public_key())
    }

    /// A per-boot ephemeral id: `<prefix><16 hex chars>`.
    pub fn ephemeral_id(prefix: &str) -> String {
        let mut bytes = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        format!("{prefix}{}", hex::encode(bytes))
    }

    /// Sign raw bytes, returning the base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        let sig = self.signing.sign(message);
        base64::engine::general_purpose::STANDARD.encode(sig.to_bytes())
    }

    /// Sign the canonical form of a JSON value (with any `signature`
    /// field stripped first), returning the base64 signature.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Serialization`] if the value cannot be
    /// canonicalized.
    pub fn sign_value(&self, value: &serde_json::Value) -> Result<String> {
        let canonical = crate::canonical::canonical_string(&crate::canonical::signable_value(
            value.clone(),
        ))?;
        Ok(self.sign(canonical.as_bytes()))
    }
}

/// Derive the ring node id from a raw public key:
/// `hex(SHA-256(publicKey)[..20])`.
pub fn derive_node_id(public_key: &[u8; 32]) -> NodeId {
    let digest = Sha256::digest(public_key);
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest[..20]);
    NodeId(id)
}

/// Verify a base64 signature over raw bytes against the key encoded in
/// `server_id`.
///
/// # Errors
///
/// Returns [`IdentityError::InvalidServerId`] if the id does not decode,
/// [`IdentityError::MalformedSignature`] on bad base64, and
/// [`IdentityError::Verification`] if the signature does not check out.
pub fn verify(server_id: &ServerId, message: &[u8], signature_b64: &str) -> Result<()> {
    let key_bytes = server_id
        .decode_public_key()
        .map_err(|_| IdentityError::InvalidServerId(server_id.to_string()))?;
    let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| IdentityError::InvalidServerId(server_id.to_string()))?;

    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|_| IdentityError::MalformedSignature)?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| IdentityError::MalformedSignature)?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig_array);

    key.verify(message, &sig)
        .map_err(|_| IdentityError::Verification)
}

/// Verify a base64 signature over the canonical form of a JSON value
/// (with any `signature` field stripped) against `server_id`.
///
/// # Errors
///
/// Same failure modes as [`verify`], plus
/// [`IdentityError::Serialization`] if canonicalization fails.
pub fn verify_value(
    server_id: &ServerId,
    value: &serde_json::Value,
    signature_b64: &str,
) -> Result<()> {
    let canonical =
        crate::canonical::canonical_string(&crate::canonical::signable_value(value.clone()))?;
    verify(server_id, canonical.as_bytes(), signature_b64)
}
