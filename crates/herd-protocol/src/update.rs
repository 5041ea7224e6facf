//! Serialized updates: the canonical wire form of one key/value mutation,
//! and the revision-agnostic equality used to coalesce them.
//!
//! Values are serialized once, at the cache boundary, with the datastore's
//! own encoder (`serde_json`) and treated as opaque bytes everywhere else.
//! That lets the hub serialize once and fan out to N peers, and keeps the
//! wire protocol decoupled from the object schema.

use crate::key::{KeyParseError, KeyPath};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Mutation kind carried by a serialized update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    New,
    Updated,
    Deleted,
}

impl UpdateKind {
    /// Dedup normalization: a create followed by an identical update must
    /// not re-transmit, so `New` compares equal to `Updated`.
    pub fn normalized(self) -> UpdateKind {
        match self {
            UpdateKind::New => UpdateKind::Updated,
            other => other,
        }
    }
}

/// A parsed update, as the upstream adapter produces it and as peers
/// reconstruct it from the wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawUpdate {
    pub key: KeyPath,
    /// `None` encodes a deletion (or, on the peer side, a value payload
    /// that could not be decoded).
    pub value: Option<serde_json::Value>,
    pub revision: String,
    /// Zero means no expiry.
    pub ttl: Duration,
    pub kind: UpdateKind,
}

#[derive(Debug, Error)]
pub enum SerializeError {
    /// The key cannot be canonicalized. This indicates a bug in the
    /// upstream adapter, not bad data from the wire.
    #[error("key cannot be canonicalized: {0}")]
    Key(#[from] KeyParseError),
    /// The value cannot be serialized. Callers downgrade this to a
    /// synthetic delete: a value that cannot be serialized cannot be sent
    /// to any peer, and a deletion is the safest loss of information.
    #[error("value cannot be serialized: {0}")]
    Value(#[from] serde_json::Error),
}

/// Canonical wire form of one mutation.
///
/// Invariant: `kind == Deleted` implies `value` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedUpdate {
    /// Canonical key path, e.g. `/policy/default/allow-dns`.
    pub key: String,
    /// Opaque value bytes; empty for deletions.
    #[serde(default)]
    pub value: Vec<u8>,
    /// Opaque revision token. Excluded from dedup equality.
    pub revision: String,
    /// Zero means no expiry.
    #[serde(default)]
    pub ttl_secs: u64,
    pub kind: UpdateKind,
}

impl SerializedUpdate {
    /// Project a parsed upstream update to wire form.
    pub fn from_raw(raw: &RawUpdate) -> Result<Self, SerializeError> {
        let key = raw.key.canonical()?;
        let value = match (raw.kind, &raw.value) {
            (UpdateKind::Deleted, _) | (_, None) => Vec::new(),
            (_, Some(value)) => serde_json::to_vec(value)?,
        };
        Ok(SerializedUpdate {
            key,
            value,
            revision: raw.revision.clone(),
            ttl_secs: raw.ttl.as_secs(),
            kind: raw.kind,
        })
    }

    /// A deletion frame for `key`, used both for real deletes and for the
    /// synthetic delete that stands in for an unserializable value.
    pub fn deleted(key: String, revision: String) -> Self {
        SerializedUpdate {
            key,
            value: Vec::new(),
            revision,
            ttl_secs: 0,
            kind: UpdateKind::Deleted,
        }
    }

    /// Materialize the key. Failure means this one update is undeliverable
    /// (`bad-key`); the session carrying it continues.
    pub fn parse_key(&self) -> Result<KeyPath, KeyParseError> {
        KeyPath::parse(&self.key)
    }

    /// Materialize the value payload. `Ok(None)` for the empty payload of
    /// a deletion. Failure is non-fatal (`bad-value`): the peer delivers
    /// the update with no value and a diagnostic.
    pub fn parse_value(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        if self.value.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.value).map(Some)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// True iff transmitting `new` after `prev` would tell peers nothing.
///
/// Equality is over `(key, value bytes, ttl, normalized kind)`; the
/// revision token is deliberately erased so that a rewrite of the same
/// content under a fresh revision coalesces away.
pub fn would_be_noop(new: &SerializedUpdate, prev: &SerializedUpdate) -> bool {
    new.key == prev.key
        && new.value == prev.value
        && new.ttl_secs == prev.ttl_secs
        && new.kind.normalized() == prev.kind.normalized()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(key: &[&str], value: serde_json::Value, revision: &str, kind: UpdateKind) -> RawUpdate {
        RawUpdate {
            key: KeyPath::from_segments(key.iter().copied()),
            value: Some(value),
            revision: revision.to_owned(),
            ttl: Duration::ZERO,
            kind,
        }
    }

    #[test]
    fn from_raw_projects_key_and_value() {
        let update = SerializedUpdate::from_raw(&raw(
            &["policy", "default", "allow-dns"],
            json!({"order": 100, "selector": "all()"}),
            "rev-7",
            UpdateKind::New,
        ))
        .unwrap();
        assert_eq!(update.key, "/policy/default/allow-dns");
        assert_eq!(update.revision, "rev-7");
        assert_eq!(update.kind, UpdateKind::New);
        assert_eq!(
            update.parse_value().unwrap(),
            Some(json!({"order": 100, "selector": "all()"}))
        );
    }

    #[test]
    fn from_raw_deletion_has_empty_value() {
        let mut deletion = raw(&["policy", "p"], json!("ignored"), "rev-9", UpdateKind::Deleted);
        deletion.value = None;
        let update = SerializedUpdate::from_raw(&deletion).unwrap();
        assert!(update.value.is_empty());
        assert_eq!(update.parse_value().unwrap(), None);
    }

    #[test]
    fn from_raw_surfaces_bad_keys() {
        let bad = raw(&["a/b"], json!(1), "rev-1", UpdateKind::New);
        assert!(matches!(
            SerializedUpdate::from_raw(&bad),
            Err(SerializeError::Key(_))
        ));
    }

    #[test]
    fn noop_is_reflexive_and_revision_blind() {
        let a = SerializedUpdate::from_raw(&raw(&["k"], json!(1), "rev-1", UpdateKind::Updated))
            .unwrap();
        let mut b = a.clone();
        b.revision = "rev-2".to_owned();
        assert!(would_be_noop(&a, &a));
        assert!(would_be_noop(&b, &a));
    }

    #[test]
    fn noop_normalizes_new_to_updated() {
        let created = SerializedUpdate::from_raw(&raw(&["k"], json!(1), "rev-1", UpdateKind::New))
            .unwrap();
        let updated =
            SerializedUpdate::from_raw(&raw(&["k"], json!(1), "rev-2", UpdateKind::Updated))
                .unwrap();
        assert!(would_be_noop(&updated, &created));
        assert!(would_be_noop(&created, &updated));
    }

    #[test]
    fn noop_is_false_on_any_content_difference() {
        let base = SerializedUpdate::from_raw(&raw(&["k"], json!(1), "rev-1", UpdateKind::Updated))
            .unwrap();
        let other_value =
            SerializedUpdate::from_raw(&raw(&["k"], json!(2), "rev-2", UpdateKind::Updated))
                .unwrap();
        assert!(!would_be_noop(&other_value, &base));

        let mut other_ttl = base.clone();
        other_ttl.ttl_secs = 30;
        assert!(!would_be_noop(&other_ttl, &base));

        let deletion = SerializedUpdate::deleted(base.key.clone(), "rev-3".to_owned());
        assert!(!would_be_noop(&deletion, &base));
    }
}
