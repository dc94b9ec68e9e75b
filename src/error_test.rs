use serde_json::json;

use crate::error::{deserialize_error, serialize_error, AppError, Canceled, Envelope, CODE_CLIENT, CODE_INTERNAL};
use crate::faults::FaultSink;
use crate::utils;

#[test]
fn client_error_round_trip_preserves_everything() {
    let err = AppError::client("no such topic").with_detail("topic", json!("t9"));
    let wire = serialize_error(&anyhow::Error::from(err.clone()));
    assert_eq!(wire.code, CODE_CLIENT);
    assert_eq!(wire.message, "no such topic");
    assert_eq!(deserialize_error(wire), err);
}

#[test]
fn explicit_internal_error_keeps_its_message() {
    let err = AppError::internal("replication degraded").with_detail("shard", json!("c"));
    let wire = serialize_error(&anyhow::Error::from(err.clone()));
    assert_eq!(wire.code, CODE_INTERNAL);
    assert_eq!(wire.message, "replication degraded");
    assert_eq!(deserialize_error(wire), err);
}

#[test]
fn opaque_error_is_genericized() {
    let wire = serialize_error(&anyhow::anyhow!("sled: page fault at 0x1f"));
    assert_eq!(wire.code, CODE_INTERNAL);
    assert_eq!(wire.message, "internal error", "expected opaque origins to be hidden from the wire");
    assert!(wire.details.is_empty());
}

#[test]
fn unknown_code_deserializes_as_internal() {
    let wire = crate::error::WireError {
        code: "ESOMETHING".into(),
        message: "who knows".into(),
        details: Default::default(),
    };
    match deserialize_error(wire) {
        AppError::Internal { message, .. } => assert_eq!(message, "who knows"),
        other => panic!("expected an internal error, got {:?}", other),
    }
}

#[test]
fn envelope_decodes_result_and_error() {
    let ok: Envelope<u64> = utils::decode(br#"{"result":7}"#).expect("result envelope should decode");
    assert!(matches!(ok, Envelope::Result { result: 7 }));

    let err: Envelope<u64> = utils::decode(br#"{"error":{"code":"EFAIL","message":"nope"}}"#).expect("error envelope should decode");
    match err {
        Envelope::Error { error } => {
            assert_eq!(error.code, CODE_CLIENT);
            assert_eq!(error.message, "nope");
        }
        Envelope::Result { .. } => panic!("expected the error variant"),
    }
}

#[test]
fn envelope_rejects_neither_shape() {
    let res = utils::decode::<Envelope<u64>>(br#"{"neither":true}"#);
    assert!(res.is_err(), "expected a protocol error for a payload with neither result nor error");
}

#[test]
fn sink_suppresses_cancellation() {
    let reports = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counted = reports.clone();
    let sink = FaultSink::with_hook(std::sync::Arc::new(move |_component, _err| {
        counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }));

    sink.report("test", anyhow::anyhow!("a genuine failure"));
    assert_eq!(reports.load(std::sync::atomic::Ordering::SeqCst), 1);

    sink.report("test", anyhow::Error::from(Canceled).context("retry interrupted"));
    assert_eq!(
        reports.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "expected shutdown errors to be swallowed"
    );
}
