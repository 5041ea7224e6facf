//! Key canonicalization.
//!
//! Keys travel on the wire in the upstream datastore's default path
//! encoding: `/segment/segment/...`. The hub routes on the string form
//! without interpreting it; `canonical` and `parse` are mutual inverses
//! for every key the upstream can produce.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("key is empty")]
    Empty,
    #[error("key does not start with '/': {0:?}")]
    MissingLeadingSlash(String),
    #[error("key has an empty segment: {0:?}")]
    EmptySegment(String),
    #[error("key segment contains '/': {0:?}")]
    SlashInSegment(String),
    #[error("key contains a non-printable character: {0:?}")]
    NonPrintable(String),
}

/// A parsed key: a non-empty sequence of path segments.
///
/// Construction does not validate; [`KeyPath::canonical`] does, so that an
/// upstream adapter handing the cache a malformed key surfaces an error at
/// serialization time instead of panicking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Render the canonical path string, validating every segment.
    pub fn canonical(&self) -> Result<String, KeyParseError> {
        if self.0.is_empty() {
            return Err(KeyParseError::Empty);
        }
        let mut out = String::new();
        for segment in &self.0 {
            if segment.is_empty() {
                return Err(KeyParseError::EmptySegment(self.0.join("/")));
            }
            if segment.contains('/') {
                return Err(KeyParseError::SlashInSegment(segment.clone()));
            }
            if segment.chars().any(char::is_control) {
                return Err(KeyParseError::NonPrintable(segment.clone()));
            }
            out.push('/');
            out.push_str(segment);
        }
        Ok(out)
    }

    /// Parse a canonical path string back into segments.
    pub fn parse(key: &str) -> Result<Self, KeyParseError> {
        if key.is_empty() {
            return Err(KeyParseError::Empty);
        }
        let Some(rest) = key.strip_prefix('/') else {
            return Err(KeyParseError::MissingLeadingSlash(key.to_owned()));
        };
        if rest.is_empty() {
            return Err(KeyParseError::EmptySegment(key.to_owned()));
        }
        let mut segments = Vec::new();
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(KeyParseError::EmptySegment(key.to_owned()));
            }
            if segment.chars().any(char::is_control) {
                return Err(KeyParseError::NonPrintable(segment.to_owned()));
            }
            segments.push(segment.to_owned());
        }
        Ok(KeyPath(segments))
    }
}
