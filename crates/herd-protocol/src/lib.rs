// herd-protocol: Hub <-> peer wire protocol types and framing.
//
// Every frame carries a top-level `kind` field for discriminated
// deserialization. The enum variants map 1:1 to the v1 frame kinds.

pub mod codec;
mod key;
mod update;

pub use codec::{CodecError, MAX_FRAME_BYTES, read_frame, write_frame};
pub use key::{KeyParseError, KeyPath};
pub use update::{RawUpdate, SerializeError, SerializedUpdate, UpdateKind, would_be_noop};

use serde::{Deserialize, Serialize};

/// Wire protocol revision spoken by this build.
///
/// Carried in both hello messages. New frame kinds must not be added
/// without bumping this, so that each side can restrict itself to the
/// intersection of supported kinds.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default hub listen port.
pub const DEFAULT_PORT: u16 = 5473;

/// Normalize a hello's `protocol_version` field.
///
/// A peer built before the field existed sends nothing; serde decodes the
/// absence to 0, which is read as the oldest supported revision.
pub fn effective_protocol_version(field: u32) -> u32 {
    if field == 0 { 1 } else { field }
}

/// Current unix-epoch milliseconds, the token format of [`Ping`] frames.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Upstream sync punctuation, relayed to every peer.
///
/// The hub republishes exactly what the upstream reported; an `InSync` may
/// be followed by `ResyncInProgress` if the upstream falls behind again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    WaitForDatastore,
    ResyncInProgress,
    InSync,
}

// ---------------------------------------------------------------------------
// Peer -> hub frames
// ---------------------------------------------------------------------------

/// First frame from a peer after connecting.
///
/// `hostname` and `info` are advisory identity for hub-side logs; the hub
/// never routes on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub hostname: String,
    /// Free-form build/platform string, e.g. "agent 3.1 linux/amd64".
    pub info: String,
    /// Peer build version.
    pub version: String,
    /// Wire protocol revision; absent (0) means oldest supported.
    #[serde(default)]
    pub protocol_version: u32,
}

/// Peer reply to a [`Ping`]; echoes the originating ping token so the hub
/// can correlate even with multiple pings in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub ping_timestamp_ms: u64,
    pub pong_timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Hub -> peer frames
// ---------------------------------------------------------------------------

/// Hub reply to [`ClientHello`], sent before the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Hub build version.
    pub version: String,
    /// Wire protocol revision; absent (0) means oldest supported.
    #[serde(default)]
    pub protocol_version: u32,
}

/// A batch of serialized updates: snapshot entries at handshake time and
/// live deltas afterwards. The two are not distinguishable on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kvs {
    pub updates: Vec<SerializedUpdate>,
}

/// Sync punctuation frame, emitted at the end of the initial snapshot and
/// whenever the upstream status changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusMessage {
    pub status: SyncStatus,
}

/// Hub-initiated liveness probe. `timestamp_ms` (unix-epoch milliseconds)
/// is an opaque correlation token; peers echo it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// All frame kinds in the v1 protocol.
///
/// Serializes/deserializes using the `kind` field as a tag:
///
/// ```json
/// { "kind": "client_hello", ... }
/// ```
///
/// An unknown `kind` fails decoding; the codec surfaces that as a protocol
/// error rather than skipping the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum Message {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    Kvs(Kvs),
    SyncStatus(SyncStatusMessage),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    /// The wire tag of this frame, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientHello(_) => "client_hello",
            Message::ServerHello(_) => "server_hello",
            Message::Kvs(_) => "kvs",
            Message::SyncStatus(_) => "sync_status",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
        }
    }
}
