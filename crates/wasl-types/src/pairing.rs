//! Pairing-code alphabet and validation.
//!
//! Pairing codes are short human-enterable handles used only to initiate
//! pairing: 6 characters over `A-Z` and `2-9` with the ambiguous glyphs
//! `I O 0 1` removed (32 symbols). Clients generate their own codes; the
//! server validates and, on collision anywhere in the cluster, rejects so
//! the client picks again.

use crate::{Result, TypeError};

/// Allowed code symbols: `A-Z` + `2-9` minus `I`, `O`, `0`, `1`.
pub const CODE_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Fixed code length.
pub const CODE_LEN: usize = 6;

/// Whether `code` is a well-formed pairing code.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LEN && code.chars().all(|c| CODE_ALPHABET.contains(c))
}

/// Validate a pairing code, normalizing nothing.
///
/// # Errors
///
/// Returns [`TypeError::InvalidPairingCode`] on bad length or alphabet.
pub fn validate_code(code: &str) -> Result<()> {
    if is_valid_code(code) {
        Ok(())
    } else {
        Err(TypeError::InvalidPairingCode(code.to_string()))
    }
}
