//! Upstream client adapter: the contract between the datastore watch and
//! the cache, plus the drain loop that turns watch traffic into
//! breadcrumbs.
//!
//! The datastore's own algorithm stays a collaborator behind
//! [`UpstreamSource`]; the hub only fixes the shape of the stream it
//! consumes.

use crate::cache::CacheWriter;
use herd_protocol::{KeyPath, RawUpdate, SyncStatus, UpdateKind};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Idle commit cadence, so status-only transitions are not starved.
const COMMIT_TICK: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// One message from the upstream watch.
#[derive(Debug)]
pub enum UpstreamMessage {
    /// One batch of updates. The cache commits a breadcrumb per batch.
    Updates(Vec<RawUpdate>),
    /// Upstream sync punctuation.
    Status(SyncStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect: {0}")]
    Connect(std::io::Error),
}

/// A source of upstream watch sessions.
///
/// `open` is called once per (re)connection attempt; the returned
/// receiver ends when that watch session dies.
pub trait UpstreamSource: Send + 'static {
    fn open(
        &mut self,
    ) -> impl Future<Output = Result<mpsc::Receiver<UpstreamMessage>, UpstreamError>> + Send;
}

// ---------------------------------------------------------------------------
// Drain loop
// ---------------------------------------------------------------------------

/// Drive the upstream watch into the cache until shutdown.
///
/// Publishes `WaitForDatastore` before the first successful open; when a
/// watch session terminates, publishes `ResyncInProgress` and reopens
/// with exponential backoff. Peers stay connected throughout; only the
/// status they see changes.
pub async fn run_upstream<U: UpstreamSource>(
    mut source: U,
    mut writer: CacheWriter,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    writer.on_upstream_status(SyncStatus::WaitForDatastore);
    writer.commit().await;

    'reconnect: loop {
        let mut rx = tokio::select! {
            biased;
            _ = shutdown.changed() => break 'reconnect,
            opened = source.open() => match opened {
                Ok(rx) => {
                    info!("upstream watch open");
                    backoff = INITIAL_BACKOFF;
                    rx
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "upstream open failed; retrying");
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break 'reconnect,
                        () = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'reconnect;
                }
            }
        };

        let mut tick = interval(COMMIT_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break 'reconnect,
                message = rx.recv() => match message {
                    Some(UpstreamMessage::Updates(batch)) => {
                        for raw in batch {
                            writer.on_upstream_update(raw).await;
                        }
                        writer.commit().await;
                    }
                    Some(UpstreamMessage::Status(status)) => {
                        writer.on_upstream_status(status);
                    }
                    None => {
                        warn!("upstream watch terminated; resyncing");
                        writer.on_upstream_status(SyncStatus::ResyncInProgress);
                        writer.commit().await;
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break 'reconnect,
                            () = sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue 'reconnect;
                    }
                },
                _ = tick.tick() => writer.commit().await,
            }
        }
    }

    // Final breadcrumb so nothing staged is lost; the server ends the
    // trail afterwards.
    writer.commit().await;
}

// ---------------------------------------------------------------------------
// ChannelUpstream
// ---------------------------------------------------------------------------

/// In-process upstream over a channel pair, for embedders that already
/// have a feed and for the integration tests.
pub struct ChannelUpstream {
    rx: Option<mpsc::Receiver<UpstreamMessage>>,
}

impl ChannelUpstream {
    pub fn new(buffer: usize) -> (mpsc::Sender<UpstreamMessage>, ChannelUpstream) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, ChannelUpstream { rx: Some(rx) })
    }
}

impl UpstreamSource for ChannelUpstream {
    async fn open(&mut self) -> Result<mpsc::Receiver<UpstreamMessage>, UpstreamError> {
        match self.rx.take() {
            Some(rx) => Ok(rx),
            // The one session this source can produce is gone; idle here
            // and let the shutdown signal end the drain loop.
            None => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// JsonLinesUpstream
// ---------------------------------------------------------------------------

/// The production adapter: the datastore's watch endpoint speaks
/// newline-delimited JSON over TCP, one message per line.
pub struct JsonLinesUpstream {
    endpoint: String,
}

impl JsonLinesUpstream {
    pub fn new(endpoint: impl Into<String>) -> Self {
        JsonLinesUpstream { endpoint: endpoint.into() }
    }
}

/// One line of the native watch encoding.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WatchLine {
    Updates { updates: Vec<WatchUpdate> },
    Status { status: SyncStatus },
}

#[derive(Debug, Deserialize)]
struct WatchUpdate {
    key: String,
    value: Option<serde_json::Value>,
    revision: String,
    #[serde(default)]
    ttl_secs: u64,
    kind: UpdateKind,
}

impl UpstreamSource for JsonLinesUpstream {
    async fn open(&mut self) -> Result<mpsc::Receiver<UpstreamMessage>, UpstreamError> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(UpstreamError::Connect)?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_watch_lines(stream, tx));
        Ok(rx)
    }
}

/// Translate the line stream until the socket or the consumer goes away.
async fn read_watch_lines(stream: TcpStream, tx: mpsc::Sender<UpstreamMessage>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            biased;
            () = tx.closed() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "upstream read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<WatchLine>(&line) {
            Ok(WatchLine::Updates { updates }) => {
                UpstreamMessage::Updates(updates.into_iter().filter_map(parse_watch_update).collect())
            }
            Ok(WatchLine::Status { status }) => UpstreamMessage::Status(status),
            Err(e) => {
                warn!(error = %e, "malformed upstream watch line; skipping");
                continue;
            }
        };
        if tx.send(message).await.is_err() {
            return;
        }
    }
}

fn parse_watch_update(wire: WatchUpdate) -> Option<RawUpdate> {
    match KeyPath::parse(&wire.key) {
        Ok(key) => Some(RawUpdate {
            key,
            value: if wire.kind == UpdateKind::Deleted { None } else { wire.value },
            revision: wire.revision,
            ttl: Duration::from_secs(wire.ttl_secs),
            kind: wire.kind,
        }),
        Err(e) => {
            warn!(key = %wire.key, error = %e, "upstream sent an unparseable key; skipping");
            None
        }
    }
}
