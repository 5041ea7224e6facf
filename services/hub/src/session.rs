//! Per-peer session: handshake, snapshot replay, live-delta forwarding,
//! ping/pong liveness, and flow control.
//!
//! The socket itself is the flow-control primitive: the sender blocks on
//! write, and while it is blocked the cache keeps committing. When the
//! sender catches up, the follower hands it the pending range coalesced
//! to one update per key, so a stalled peer never costs more than the
//! live keys to bring current.

use crate::cache::{CacheHandle, Delta, Snapshot};
use crate::config::SyncConfig;
use herd_protocol::{
    CodecError, Kvs, Message, PROTOCOL_VERSION, Ping, SerializedUpdate, ServerHello, SyncStatus,
    SyncStatusMessage, effective_protocol_version, read_frame, unix_millis, write_frame,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Close reasons
// ---------------------------------------------------------------------------

/// Why a session ended; carried on the stop channel and logged once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerDisconnected,
    ProtocolError,
    PongTimeout,
    IoError,
    HubShutdown,
}

// ---------------------------------------------------------------------------
// Liveness state shared between the pinger and the receiver
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PingState {
    /// Token and send time of the oldest ping still awaiting a pong.
    oldest_unanswered: Option<(u64, Instant)>,
}

// ---------------------------------------------------------------------------
// Session entry point
// ---------------------------------------------------------------------------

/// Drive one peer connection from accept to close. The socket is closed
/// on every exit path; the caller only tracks the task.
pub async fn run_session(
    stream: TcpStream,
    cache: CacheHandle,
    sync: SyncConfig,
    hub_shutdown: watch::Receiver<bool>,
) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_owned(), |addr| addr.to_string());
    let session_id = Uuid::new_v4();
    let (mut reader, mut writer) = stream.into_split();

    // awaiting-client-hello: exactly one hello, within the liveness window.
    let hello = match timeout(sync.pong_timeout, read_frame(&mut reader)).await {
        Ok(Ok(Message::ClientHello(hello))) => hello,
        Ok(Ok(other)) => {
            warn!(%session_id, peer = %peer, kind = other.kind(), "protocol error: expected client_hello");
            return;
        }
        Ok(Err(e)) => {
            warn!(%session_id, peer = %peer, error = %e, "handshake read failed");
            return;
        }
        Err(_) => {
            warn!(%session_id, peer = %peer, "no client_hello within the handshake window");
            return;
        }
    };
    info!(
        %session_id,
        peer = %peer,
        hostname = %hello.hostname,
        peer_info = %hello.info,
        peer_version = %hello.version,
        protocol_version = effective_protocol_version(hello.protocol_version),
        "peer connected"
    );

    let server_hello = Message::ServerHello(ServerHello {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        protocol_version: PROTOCOL_VERSION,
    });
    if let Err(e) = write_frame(&mut writer, &server_hello).await {
        warn!(%session_id, peer = %peer, error = %e, "failed to send server_hello");
        return;
    }

    // snapshot-sending: entries as of one index, then that index's status.
    let (snapshot, mut follower) = cache.subscribe().await;
    let mut last_status = snapshot.status;
    if let Err(e) = send_snapshot(&mut writer, &snapshot, sync.max_kvs_bytes).await {
        warn!(%session_id, peer = %peer, error = %e, "failed to send snapshot");
        return;
    }
    debug!(%session_id, entries = snapshot.entries.len(), index = snapshot.index, "snapshot sent");

    // tailing: sender (this task), pinger, receiver.
    let writer = Arc::new(Mutex::new(writer));
    let ping_state = Arc::new(Mutex::new(PingState::default()));
    let (stop_tx, stop_rx) = watch::channel(None::<CloseReason>);

    let receiver = tokio::spawn(receive_loop(
        reader,
        ping_state.clone(),
        stop_tx.clone(),
        stop_rx.clone(),
        session_id,
    ));
    let pinger = tokio::spawn(ping_loop(
        writer.clone(),
        ping_state.clone(),
        sync.clone(),
        stop_tx.clone(),
        stop_rx.clone(),
        session_id,
    ));

    let reason = send_loop(
        &mut follower,
        &writer,
        &mut last_status,
        sync.max_kvs_bytes,
        stop_rx.clone(),
        hub_shutdown,
        session_id,
    )
    .await;
    fire_stop(&stop_tx, reason);

    // Give the helper tasks a moment to observe the stop, then force them.
    let receiver_abort = receiver.abort_handle();
    let pinger_abort = pinger.abort_handle();
    let drain = async {
        let _ = receiver.await;
        let _ = pinger.await;
    };
    if timeout(Duration::from_millis(500), drain).await.is_err() {
        receiver_abort.abort();
        pinger_abort.abort();
    }

    let final_reason = stop_rx.borrow().unwrap_or(reason);
    if let Ok(mut w) = timeout(Duration::from_millis(200), writer.lock()).await {
        let _ = w.shutdown().await;
    }
    info!(%session_id, peer = %peer, reason = ?final_reason, "peer disconnected");
}

/// Record a close reason; first writer wins.
fn fire_stop(stop_tx: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
    stop_tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

async fn send_loop(
    follower: &mut crate::cache::Follower,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    last_status: &mut SyncStatus,
    max_kvs_bytes: usize,
    mut stop_rx: watch::Receiver<Option<CloseReason>>,
    mut hub_shutdown: watch::Receiver<bool>,
    session_id: Uuid,
) -> CloseReason {
    let drive = async {
        loop {
            let Some(delta) = follower.next().await else {
                return CloseReason::HubShutdown;
            };
            let mut w = writer.lock().await;
            if let Err(e) = send_delta(&mut w, &delta, last_status, max_kvs_bytes).await {
                debug!(%session_id, error = %e, "delta write failed");
                return CloseReason::IoError;
            }
        }
    };
    tokio::select! {
        biased;
        _ = stop_rx.changed() => stop_rx.borrow().unwrap_or(CloseReason::PeerDisconnected),
        _ = hub_shutdown.changed() => CloseReason::HubShutdown,
        reason = drive => reason,
    }
}

/// Pack updates greedily up to the soft byte cap; flush on cap or on the
/// batch boundary, whichever comes first. A single update is never split
/// and may alone exceed the cap.
fn pack_frames(updates: &[Arc<SerializedUpdate>], max_bytes: usize) -> Vec<Kvs> {
    let mut frames = Vec::new();
    let mut current: Vec<SerializedUpdate> = Vec::new();
    let mut current_bytes = 0usize;
    for update in updates {
        let size = estimated_wire_size(update);
        if !current.is_empty() && current_bytes + size > max_bytes {
            frames.push(Kvs { updates: std::mem::take(&mut current) });
            current_bytes = 0;
        }
        current_bytes += size;
        current.push((**update).clone());
    }
    if !current.is_empty() {
        frames.push(Kvs { updates: current });
    }
    frames
}

/// Rough JSON footprint of one update: strings land verbatim, value
/// bytes render as a number array.
fn estimated_wire_size(update: &SerializedUpdate) -> usize {
    update.key.len() + update.revision.len() + update.value.len() * 4 + 64
}

async fn send_snapshot(
    writer: &mut OwnedWriteHalf,
    snapshot: &Snapshot,
    max_kvs_bytes: usize,
) -> Result<(), CodecError> {
    for frame in pack_frames(&snapshot.entries, max_kvs_bytes) {
        write_frame(writer, &Message::Kvs(frame)).await?;
    }
    write_frame(writer, &Message::SyncStatus(SyncStatusMessage { status: snapshot.status })).await
}

async fn send_delta(
    writer: &mut OwnedWriteHalf,
    delta: &Delta,
    last_status: &mut SyncStatus,
    max_kvs_bytes: usize,
) -> Result<(), CodecError> {
    for frame in pack_frames(&delta.updates, max_kvs_bytes) {
        write_frame(writer, &Message::Kvs(frame)).await?;
    }
    if delta.status != *last_status {
        write_frame(writer, &Message::SyncStatus(SyncStatusMessage { status: delta.status }))
            .await?;
        *last_status = delta.status;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Pinger
// ---------------------------------------------------------------------------

async fn ping_loop(
    writer: Arc<Mutex<OwnedWriteHalf>>,
    ping_state: Arc<Mutex<PingState>>,
    sync: SyncConfig,
    stop_tx: watch::Sender<Option<CloseReason>>,
    mut stop_rx: watch::Receiver<Option<CloseReason>>,
    session_id: Uuid,
) {
    let mut ticker = interval(sync.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }

        let overdue = {
            let state = ping_state.lock().await;
            matches!(state.oldest_unanswered, Some((_, sent)) if sent.elapsed() >= sync.pong_timeout)
        };
        if overdue {
            warn!(%session_id, timeout = ?sync.pong_timeout, "pong timeout");
            fire_stop(&stop_tx, CloseReason::PongTimeout);
            return;
        }

        // A sender blocked on a stalled peer holds the writer; the ping
        // could not reach the peer anyway, so skip the tick rather than
        // queue behind the blocked write.
        let Ok(mut w) = writer.try_lock() else { continue };
        let token = unix_millis();
        let ping_msg = Message::Ping(Ping { timestamp_ms: token });
        let written = tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            result = write_frame(&mut *w, &ping_msg) => result,
        };
        drop(w);
        match written {
            Ok(()) => {
                let mut state = ping_state.lock().await;
                if state.oldest_unanswered.is_none() {
                    state.oldest_unanswered = Some((token, Instant::now()));
                }
            }
            Err(e) => {
                debug!(%session_id, error = %e, "ping write failed");
                fire_stop(&stop_tx, CloseReason::IoError);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

async fn receive_loop(
    mut reader: OwnedReadHalf,
    ping_state: Arc<Mutex<PingState>>,
    stop_tx: watch::Sender<Option<CloseReason>>,
    mut stop_rx: watch::Receiver<Option<CloseReason>>,
    session_id: Uuid,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Message::Pong(pong)) => {
                let mut state = ping_state.lock().await;
                if let Some((token, _)) = state.oldest_unanswered
                    && pong.ping_timestamp_ms >= token
                {
                    state.oldest_unanswered = None;
                }
                drop(state);
                debug!(
                    %session_id,
                    latency_ms = unix_millis().saturating_sub(pong.ping_timestamp_ms),
                    "pong"
                );
            }
            // Only pong is valid after the handshake.
            Ok(other) => {
                warn!(%session_id, kind = other.kind(), "protocol error: unexpected frame while tailing");
                fire_stop(&stop_tx, CloseReason::ProtocolError);
                return;
            }
            Err(CodecError::Eof) => {
                fire_stop(&stop_tx, CloseReason::PeerDisconnected);
                return;
            }
            Err(CodecError::Protocol(e)) => {
                warn!(%session_id, error = %e, "protocol error from peer");
                fire_stop(&stop_tx, CloseReason::ProtocolError);
                return;
            }
            Err(CodecError::Io(e)) => {
                debug!(%session_id, error = %e, "read failed");
                fire_stop(&stop_tx, CloseReason::IoError);
                return;
            }
        }
    }
}
