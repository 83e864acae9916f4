//! Masking of secret values before they reach the store.
//!
//! Values are replaced by their SHA-256 fingerprint. Equal secrets therefore
//! still redact to equal strings, which keeps the delta output free of
//! spurious changes but reveals when two values are identical. The values
//! themselves never reach the disk.

use sha2::{Digest, Sha256};

use crate::types::Document;

pub const REDACTED_PREFIX: &str = "redacted-to-sha256:";

const SECRET_FIELDS: [&str; 2] = ["data", "stringData"];

/// Return a copy of `entity` with sensitive values masked. Only core
/// `Secret` objects are touched.
pub fn redact(entity: &Document, group: &str, kind: &str) -> Document {
    let mut out = entity.clone();
    if !(group.is_empty() && kind == "Secret") {
        return out;
    }
    for field in SECRET_FIELDS {
        let Some(map) = out.get_mut(field).and_then(|v| v.as_object_mut()) else {
            continue;
        };
        for value in map.values_mut() {
            if let Some(s) = value.as_str()
                && let Some(masked) = fingerprint(s)
            {
                *value = Document::String(masked);
            }
        }
    }
    out
}

/// Empty and already masked values are left alone.
fn fingerprint(value: &str) -> Option<String> {
    if value.is_empty() || is_fingerprint(value) {
        return None;
    }
    Some(format!(
        "{}{}",
        REDACTED_PREFIX,
        hex::encode(Sha256::digest(value.as_bytes()))
    ))
}

fn is_fingerprint(value: &str) -> bool {
    value.strip_prefix(REDACTED_PREFIX).is_some_and(|digest| {
        digest.len() == 64 && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    })
}
