//! Canonical JSON serialization for signing.
//!
//! The canonical form of a JSON value is its serialization with object
//! keys recursively sorted (byte order) and no insignificant whitespace.
//! Arrays keep their order. Numbers and strings serialize exactly as
//! `serde_json` renders them. Signing always operates on the canonical
//! form with the top-level `signature` field removed, so the signature
//! can travel inside the object it covers.

use serde_json::Value;

use crate::{IdentityError, Result};

/// Name of the detached-signature field stripped before signing.
pub const SIGNATURE_FIELD: &str = "signature";

/// Render a JSON value in canonical form.
///
/// # Errors
///
/// Returns [`IdentityError::Serialization`] if a string fails to encode
/// (practically unreachable for valid `Value`s).
pub fn canonical_string(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// A copy of `value` with the top-level `signature` field removed.
///
/// Non-object values pass through unchanged.
pub fn signable_value(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.remove(SIGNATURE_FIELD);
    }
    value
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&encode_string(key)?);
                out.push(':');
                // Key came from the map, so the value is present.
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::String(s) => out.push_str(&encode_string(s)?),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
    Ok(())
}

fn encode_string(s: &str) -> Result<String> {
    serde_json::to_string(s).map_err(|e| IdentityError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let value = json!({
            "zeta": {"b": 2, "a": 1},
            "alpha": [{"y": 0, "x": 0}],
        });
        let canonical = canonical_string(&value).expect("canonical");
        assert_eq!(
            canonical,
            r#"{"alpha":[{"x":0,"y":0}],"zeta":{"a":1,"b":2}}"#
        );
    }

    #[test]
    fn test_arrays_keep_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonical_string(&value).expect("canonical"), "[3,1,2]");
    }

    #[test]
    fn test_no_whitespace() {
        let value = json!({"a": [1, 2], "b": "c d"});
        assert_eq!(
            canonical_string(&value).expect("canonical"),
            r#"{"a":[1,2],"b":"c d"}"#
        );
    }

    #[test]
    fn test_string_escaping() {
        let value = json!({"msg": "line\n\"quoted\""});
        let canonical = canonical_string(&value).expect("canonical");
        assert_eq!(canonical, r#"{"msg":"line\n\"quoted\""}"#);
    }

    #[test]
    fn test_signable_strips_signature() {
        let value = json!({"type": "handshake", "signature": "abc", "n": 1});
        let stripped = signable_value(value);
        assert_eq!(
            canonical_string(&stripped).expect("canonical"),
            r#"{"n":1,"type":"handshake"}"#
        );
    }

    #[test]
    fn test_signable_on_non_object_is_identity() {
        let value = json!([1, 2, 3]);
        assert_eq!(signable_value(value.clone()), value);
    }

    #[test]
    fn test_canonical_is_deterministic_across_insertion_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(
            canonical_string(&a).expect("a"),
            canonical_string(&b).expect("b")
        );
    }

    #[test]
    fn test_sign_value_matches_manual_canonical() {
        let kp = crate::Keypair::generate();
        let value = json!({"b": 2, "a": 1, "signature": "ignored"});
        let sig = kp.sign_value(&value).expect("sign");

        let manual = canonical_string(&signable_value(value.clone())).expect("canonical");
        assert!(crate::keypair::verify(&kp.server_id(), manual.as_bytes(), &sig).is_ok());
        assert!(crate::keypair::verify_value(&kp.server_id(), &value, &sig).is_ok());
    }
}
