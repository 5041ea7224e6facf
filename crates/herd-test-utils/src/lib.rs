// herd-test-utils: Shared test helpers for the hub suite.
//
// Provides a peer wrapper with timeouts, a frame-level raw client for
// protocol-error injection, and update builders.

pub mod raw_client;
pub mod test_peer;

pub use raw_client::RawClient;
pub use test_peer::TestPeer;

use herd_protocol::{KeyPath, RawUpdate, UpdateKind};
use std::time::Duration;

/// Build an upstream-shaped update for feeding a hub under test.
pub fn raw_update(
    key: &str,
    value: serde_json::Value,
    revision: &str,
    kind: UpdateKind,
) -> RawUpdate {
    RawUpdate {
        key: KeyPath::parse(key).expect("test key must be canonical"),
        value: Some(value),
        revision: revision.to_owned(),
        ttl: Duration::ZERO,
        kind,
    }
}

/// Build an upstream-shaped deletion.
pub fn raw_delete(key: &str, revision: &str) -> RawUpdate {
    RawUpdate {
        key: KeyPath::parse(key).expect("test key must be canonical"),
        value: None,
        revision: revision.to_owned(),
        ttl: Duration::ZERO,
        kind: UpdateKind::Deleted,
    }
}
