//! herd-client: peer-side session library.
//!
//! Connects to a hub, performs the hello handshake, and yields the stream
//! of materialized updates and sync-status changes. Pings are answered
//! internally; callers only see data events.
//!
//! # Protocol
//! 1. Connect over TCP
//! 2. Send `client_hello` with hostname/info/version
//! 3. Receive `server_hello`
//! 4. Receive `kvs` frames (snapshot first, then deltas) and `sync_status`
//!    punctuation; answer every `ping` with a `pong`

use herd_protocol::{
    ClientHello, CodecError, Message, PROTOCOL_VERSION, Ping, Pong, RawUpdate, SerializedUpdate,
    ServerHello, SyncStatus, effective_protocol_version, read_frame, unix_millis, write_frame,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Advisory identity sent in the hello. The hub logs it; it never routes
/// on it.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub hostname: String,
    pub info: String,
    pub version: String,
}

/// One event delivered by the hub.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A batch of materialized updates. An update whose value payload did
    /// not decode is delivered with `value: None` and its kind intact.
    Updates(Vec<RawUpdate>),
    /// Upstream sync punctuation.
    Status(SyncStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect: {0}")]
    Connect(std::io::Error),
    #[error("codec: {0}")]
    Codec(CodecError),
    #[error("expected server_hello, got {0}")]
    UnexpectedHandshakeReply(&'static str),
    #[error("unexpected {0} frame after handshake")]
    UnexpectedMessage(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
}

// ---------------------------------------------------------------------------
// PeerSession
// ---------------------------------------------------------------------------

/// An established session with a hub.
///
/// Created by [`PeerSession::connect`]; the hello handshake has completed
/// by the time it is returned.
pub struct PeerSession {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    server_hello: ServerHello,
}

impl PeerSession {
    /// Connect to a hub and perform the hello handshake.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        identity: PeerIdentity,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        Self::handshake(stream, identity).await
    }

    /// Perform the hello handshake on an already-connected stream.
    pub async fn handshake(
        stream: TcpStream,
        identity: PeerIdentity,
    ) -> Result<Self, ClientError> {
        let (mut reader, mut writer) = stream.into_split();

        let hello = Message::ClientHello(ClientHello {
            hostname: identity.hostname,
            info: identity.info,
            version: identity.version,
            protocol_version: PROTOCOL_VERSION,
        });
        write_frame(&mut writer, &hello)
            .await
            .map_err(ClientError::Codec)?;

        match read_frame(&mut reader).await {
            Ok(Message::ServerHello(server_hello)) => {
                info!(
                    hub_version = %server_hello.version,
                    protocol_version = effective_protocol_version(server_hello.protocol_version),
                    "session established"
                );
                Ok(PeerSession { reader, writer, server_hello })
            }
            Ok(other) => Err(ClientError::UnexpectedHandshakeReply(other.kind())),
            Err(CodecError::Eof) => Err(ClientError::ConnectionClosed),
            Err(e) => Err(ClientError::Codec(e)),
        }
    }

    /// Hub build version from the handshake.
    pub fn hub_version(&self) -> &str {
        &self.server_hello.version
    }

    /// Negotiated wire protocol revision.
    pub fn protocol_version(&self) -> u32 {
        effective_protocol_version(self.server_hello.protocol_version)
    }

    /// The next data event. Pings are answered inline and never surfaced.
    ///
    /// Returns [`ClientError::ConnectionClosed`] when the hub closes the
    /// socket; peers are expected to reconnect and resync from scratch.
    pub async fn next_event(&mut self) -> Result<PeerEvent, ClientError> {
        loop {
            match read_frame(&mut self.reader).await {
                Ok(Message::Kvs(kvs)) => {
                    return Ok(PeerEvent::Updates(materialize_batch(&kvs.updates)));
                }
                Ok(Message::SyncStatus(status)) => return Ok(PeerEvent::Status(status.status)),
                Ok(Message::Ping(ping)) => self.answer_ping(ping).await?,
                Ok(other) => return Err(ClientError::UnexpectedMessage(other.kind())),
                Err(CodecError::Eof) => return Err(ClientError::ConnectionClosed),
                Err(e) => return Err(ClientError::Codec(e)),
            }
        }
    }

    async fn answer_ping(&mut self, ping: Ping) -> Result<(), ClientError> {
        let pong = Message::Pong(Pong {
            ping_timestamp_ms: ping.timestamp_ms,
            pong_timestamp_ms: unix_millis(),
        });
        write_frame(&mut self.writer, &pong)
            .await
            .map_err(ClientError::Codec)
    }
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

/// Materialize a kvs batch.
///
/// An unparseable key is fatal for that one update: it is dropped with a
/// diagnostic and the session continues. An unparseable value is not: the
/// update is delivered with `value: None` and a diagnostic.
fn materialize_batch(updates: &[SerializedUpdate]) -> Vec<RawUpdate> {
    let mut out = Vec::with_capacity(updates.len());
    for wire in updates {
        let key = match wire.parse_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(key = %wire.key, error = %e, "dropping update with unparseable key");
                continue;
            }
        };
        let value = match wire.parse_value() {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %wire.key, error = %e, "value payload did not decode; delivering with no value");
                None
            }
        };
        out.push(RawUpdate {
            key,
            value,
            revision: wire.revision.clone(),
            ttl: wire.ttl(),
            kind: wire.kind,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_protocol::UpdateKind;

    fn wire(key: &str, value: &[u8], kind: UpdateKind) -> SerializedUpdate {
        SerializedUpdate {
            key: key.to_owned(),
            value: value.to_vec(),
            revision: "rev-1".to_owned(),
            ttl_secs: 0,
            kind,
        }
    }

    #[test]
    fn bad_key_drops_only_the_offending_update() {
        let batch = [
            wire("not-a-path", b"{}", UpdateKind::Updated),
            wire("/policy/ok", b"{}", UpdateKind::Updated),
        ];
        let out = materialize_batch(&batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.canonical().unwrap(), "/policy/ok");
    }

    #[test]
    fn bad_value_is_delivered_with_no_value() {
        let batch = [wire("/policy/broken", b"{not json", UpdateKind::Updated)];
        let out = materialize_batch(&batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, None);
        assert_eq!(out[0].kind, UpdateKind::Updated, "kind survives a bad value");
    }

    #[test]
    fn deletion_materializes_with_no_value() {
        let batch = [wire("/policy/gone", b"", UpdateKind::Deleted)];
        let out = materialize_batch(&batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, None);
        assert_eq!(out[0].kind, UpdateKind::Deleted);
    }
}
