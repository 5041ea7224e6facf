/// Contract tests for the v1 wire schema: each JSON literal below is a
/// frozen example of a frame as it appears on the wire (inside the length
/// prefix). Deserialize, re-serialize, and verify fidelity, plus the
/// forward/backward-compatibility rules the schema relies on.
use herd_protocol::{Message, SyncStatus, UpdateKind, effective_protocol_version};

/// Helper: parse a frozen example, round-trip it, and return the value.
fn round_trip(json_text: &str) -> Message {
    let value: Message =
        serde_json::from_str(json_text).unwrap_or_else(|e| panic!("failed to deserialize: {e}\n{json_text}"));

    let serialized = serde_json::to_string(&value).expect("failed to serialize");
    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let reserialized: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, reserialized, "round-trip mismatch for {json_text}");
    value
}

#[test]
fn client_hello_round_trip() {
    let msg = round_trip(
        r#"{"kind":"client_hello","hostname":"node-7","info":"agent 3.1 linux/amd64","version":"3.1.0","protocol_version":1}"#,
    );
    match msg {
        Message::ClientHello(inner) => {
            assert_eq!(inner.hostname, "node-7");
            assert_eq!(effective_protocol_version(inner.protocol_version), 1);
        }
        other => panic!("expected ClientHello, got {other:?}"),
    }
}

#[test]
fn client_hello_without_protocol_version_reads_as_oldest() {
    // A peer built before the field existed omits it entirely.
    let msg: Message = serde_json::from_str(
        r#"{"kind":"client_hello","hostname":"node-7","info":"agent 2.0","version":"2.0.4"}"#,
    )
    .expect("absent protocol_version must decode");
    match msg {
        Message::ClientHello(inner) => {
            assert_eq!(inner.protocol_version, 0);
            assert_eq!(effective_protocol_version(inner.protocol_version), 1);
        }
        other => panic!("expected ClientHello, got {other:?}"),
    }
}

#[test]
fn server_hello_round_trip() {
    let msg = round_trip(r#"{"kind":"server_hello","version":"0.1.0","protocol_version":1}"#);
    match msg {
        Message::ServerHello(inner) => assert_eq!(inner.protocol_version, 1),
        other => panic!("expected ServerHello, got {other:?}"),
    }
}

#[test]
fn kvs_round_trip() {
    let msg = round_trip(
        r#"{"kind":"kvs","updates":[{"key":"/policy/default/allow-dns","value":[123,125],"revision":"rev-41","ttl_secs":0,"kind":"updated"},{"key":"/endpoint/node-1/eth0","value":[],"revision":"rev-42","ttl_secs":0,"kind":"deleted"}]}"#,
    );
    match msg {
        Message::Kvs(inner) => {
            assert_eq!(inner.updates.len(), 2);
            assert_eq!(inner.updates[0].value, b"{}");
            assert_eq!(inner.updates[1].kind, UpdateKind::Deleted);
            assert!(inner.updates[1].value.is_empty(), "deletions carry no value");
        }
        other => panic!("expected Kvs, got {other:?}"),
    }
}

#[test]
fn sync_status_round_trip() {
    for (text, status) in [
        (r#"{"kind":"sync_status","status":"wait_for_datastore"}"#, SyncStatus::WaitForDatastore),
        (r#"{"kind":"sync_status","status":"resync_in_progress"}"#, SyncStatus::ResyncInProgress),
        (r#"{"kind":"sync_status","status":"in_sync"}"#, SyncStatus::InSync),
    ] {
        match round_trip(text) {
            Message::SyncStatus(inner) => assert_eq!(inner.status, status),
            other => panic!("expected SyncStatus, got {other:?}"),
        }
    }
}

#[test]
fn ping_pong_round_trip() {
    let ping = round_trip(r#"{"kind":"ping","timestamp_ms":1722470400123}"#);
    match ping {
        Message::Ping(inner) => assert_eq!(inner.timestamp_ms, 1_722_470_400_123),
        other => panic!("expected Ping, got {other:?}"),
    }

    let pong = round_trip(
        r#"{"kind":"pong","ping_timestamp_ms":1722470400123,"pong_timestamp_ms":1722470400150}"#,
    );
    match pong {
        Message::Pong(inner) => {
            assert_eq!(inner.ping_timestamp_ms, 1_722_470_400_123);
            assert_eq!(inner.pong_timestamp_ms, 1_722_470_400_150);
        }
        other => panic!("expected Pong, got {other:?}"),
    }
}

#[test]
fn unknown_kind_fails_to_decode() {
    let result: Result<Message, _> =
        serde_json::from_str(r#"{"kind":"compressed_kvs","updates":[]}"#);
    assert!(result.is_err(), "unknown kinds must fail, not be skipped");
}

/// Serialization stability: materializing an update the hub produced and
/// re-serializing it must reproduce the wire form byte for byte. The cache
/// is the only producer of value bytes, so this pins the encoder.
#[test]
fn serialize_materialize_round_trip_is_byte_stable() {
    use herd_protocol::{RawUpdate, SerializedUpdate};
    use std::time::Duration;

    let raw = RawUpdate {
        key: herd_protocol::KeyPath::from_segments(["profile", "kns.kube-system"]),
        value: Some(serde_json::json!({
            "labels": {"tier": "system"},
            "order": 10,
        })),
        revision: "rev-1009".to_owned(),
        ttl: Duration::from_secs(90),
        kind: UpdateKind::New,
    };
    let wire = SerializedUpdate::from_raw(&raw).expect("serialize");

    let materialized = RawUpdate {
        key: wire.parse_key().expect("key parses"),
        value: wire.parse_value().expect("value parses"),
        revision: wire.revision.clone(),
        ttl: wire.ttl(),
        kind: wire.kind,
    };
    let rewire = SerializedUpdate::from_raw(&materialized).expect("re-serialize");
    assert_eq!(rewire, wire, "serialize ∘ materialize must be the identity");
    assert_eq!(rewire.value, wire.value, "value bytes must match exactly");
}
