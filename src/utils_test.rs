use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::json;

use crate::utils;

#[test]
fn sequence_empty() {
    assert!(utils::sequence(0).is_empty(), "expected sequence(0) to be empty");
}

#[test]
fn sequence_single_width() {
    let names = utils::sequence(12);
    let expected: Vec<String> = "abcdefghijkl".chars().map(String::from).collect();
    assert_eq!(names, expected, "expected the first 12 single-letter names, got {:?}", names);
}

#[test]
fn sequence_rolls_over_to_double_width() {
    let names = utils::sequence(27);
    assert_eq!(names.len(), 27);
    assert_eq!(names[0], "aa", "expected zero-padded first name, got {}", names[0]);
    assert_eq!(names[25], "az");
    assert_eq!(names[26], "ba", "expected base-26 rollover, got {}", names[26]);
}

#[test]
fn sequence_names_are_distinct_ordered_and_uniform() {
    let names = utils::sequence(100);
    let width = names[0].len();
    for pair in names.windows(2) {
        assert_eq!(pair[0].len(), width, "expected uniform name width");
        assert!(pair[0] < pair[1], "expected ascending order, got {} before {}", pair[0], pair[1]);
    }
}

#[test]
fn canonicalize_is_key_order_insensitive() -> Result<()> {
    let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#)?;
    let b: serde_json::Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#)?;
    assert_eq!(utils::canonicalize(&a)?, utils::canonicalize(&b)?);
    assert_eq!(utils::value_hash(&a)?, utils::value_hash(&b)?);
    Ok(())
}

#[test]
fn canonicalize_is_array_order_sensitive() -> Result<()> {
    let a = json!({ "items": [1, 2] });
    let b = json!({ "items": [2, 1] });
    assert_ne!(utils::value_hash(&a)?, utils::value_hash(&b)?);
    Ok(())
}

#[test]
fn value_hash_is_md5_hex() -> Result<()> {
    let hash = utils::value_hash(&json!({ "topic": "t" }))?;
    assert_eq!(hash.len(), 32, "expected a 32-char hex digest, got {}", hash);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    // Stable across processes: the identity of a subscription.
    assert_eq!(hash, utils::value_hash(&json!({ "topic": "t" }))?);
    Ok(())
}

#[test]
fn sanitize_name_replaces_dots() {
    assert_eq!(utils::sanitize_name("producer.p1.abc"), "producer_p1_abc");
    assert_eq!(utils::sanitize_name("plain"), "plain");
}

#[test]
fn decode_empty_payload_is_absent() -> Result<()> {
    let decoded: Option<serde_json::Value> = utils::decode_opt(b"")?;
    assert!(decoded.is_none(), "expected empty payload to decode as absent");
    let decoded: Option<u64> = utils::decode_opt(b"42")?;
    assert_eq!(decoded, Some(42));
    Ok(())
}

#[test]
fn encode_decode_round_trip() -> Result<()> {
    let value = json!({ "a": [1, 2, 3], "b": "text" });
    let decoded: serde_json::Value = utils::decode(&utils::encode(&value)?)?;
    assert_eq!(decoded, value);
    Ok(())
}

#[test]
fn headers_round_trip() {
    let mut map = BTreeMap::new();
    map.insert("x-request-id".to_string(), "abc123".to_string());
    map.insert("x-origin".to_string(), "peer-1".to_string());
    let round_tripped = utils::from_headers(&utils::to_headers(&map));
    assert_eq!(round_tripped, map);
}

#[test]
fn cas_conflict_detection() {
    let conflict = anyhow::anyhow!("nats: API error: code=10071 err_code=10071 description=wrong last sequence: 7");
    assert!(utils::is_cas_conflict(&conflict));
    let wrapped = conflict.context("error updating KV key distribution");
    assert!(utils::is_cas_conflict(&wrapped), "expected detection through a context chain");
    let other = anyhow::anyhow!("connection reset");
    assert!(!utils::is_cas_conflict(&other));
}
