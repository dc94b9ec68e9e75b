//! Shared encoding & naming helpers.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The JetStream API error message raised by a failed compare-and-swap
/// (error code 10071).
const WRONG_LAST_SEQUENCE: &str = "wrong last sequence";

/// Encode the given value as a JSON payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let buf = serde_json::to_vec(value).context("error serializing payload")?;
    Ok(Bytes::from(buf))
}

/// Decode a JSON payload into the given type.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).context("error deserializing payload")
}

/// Decode a JSON payload into the given type, treating an empty payload
/// as absent.
pub fn decode_opt<T: DeserializeOwned>(payload: &[u8]) -> Result<Option<T>> {
    if payload.is_empty() {
        return Ok(None);
    }
    decode(payload).map(Some)
}

/// Render the given value as canonical JSON.
///
/// Object keys serialize in sorted order regardless of how the value was
/// built, so deep-equal values canonicalize identically; array order is
/// significant.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).context("error canonicalizing value")?;
    serde_json::to_string(&value).context("error rendering canonical JSON")
}

/// The MD5 hex digest of the canonical JSON of the given value.
///
/// This is the identity of subscription parameters across peers, and the
/// change-detection mechanism of the spawner registry. Values must be
/// JSON-representable and identity-carrying.
pub fn value_hash<T: Serialize>(value: &T) -> Result<String> {
    Ok(format!("{:x}", md5::compute(canonicalize(value)?)))
}

/// Generate `n` distinct equal-length names in ascending order.
///
/// Names are base-26 numerals over `a..z`, left-padded with `a` to the
/// width of the largest, so `sequence(12)` yields `a..l` while
/// `sequence(27)` yields `aa, ab, .., az, ba`. Used for the default shard
/// name set.
pub fn sequence(n: usize) -> Vec<String> {
    let width = match n {
        0 => return vec![],
        _ => digits_base26(n - 1),
    };
    (0..n)
        .map(|index| {
            let mut name = vec![b'a'; width];
            let mut rem = index;
            for slot in name.iter_mut().rev() {
                *slot = b'a' + (rem % 26) as u8;
                rem /= 26;
            }
            String::from_utf8(name).expect("sequence names are always ascii")
        })
        .collect()
}

fn digits_base26(mut value: usize) -> usize {
    let mut digits = 1;
    while value >= 26 {
        value /= 26;
        digits += 1;
    }
    digits
}

/// Replace the dots of a dotted component name so it is legal as a
/// JetStream stream, consumer or bucket name.
pub fn sanitize_name(name: &str) -> String {
    name.replace('.', "_")
}

/// A bool indicating if the given error chain contains a failed
/// compare-and-swap, the canonical retryable KV error.
pub fn is_cas_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let msg = cause.to_string();
        msg.contains(WRONG_LAST_SEQUENCE) || msg.contains("already exists")
    })
}

/// Convert a plain string map into NATS headers.
pub fn to_headers(map: &BTreeMap<String, String>) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    for (name, value) in map {
        headers.insert(name.as_str(), value.as_str());
    }
    headers
}

/// Convert NATS headers into a plain string map, collapsing multi-valued
/// entries to their first value.
pub fn from_headers(headers: &async_nats::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, values)| {
            let value = values.first().map(ToString::to_string).unwrap_or_default();
            (name.to_string(), value)
        })
        .collect()
}
