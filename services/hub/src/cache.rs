//! In-memory, revision-stamped projection of the upstream stream.
//!
//! One writer (the upstream drain task) and many readers (peer senders).
//! The writer publishes through two structures guarded by one lock: the
//! live-entry map and the breadcrumb trail. A reader takes its snapshot
//! and its trail position atomically, then follows the trail by index;
//! a reader that falls behind gets its whole pending range coalesced to
//! one update per key.
//!
//! Breadcrumbs already consumed by every follower are trimmed from the
//! front of the trail, so a quiet hub holds no history at all.

use herd_protocol::{
    RawUpdate, SerializeError, SerializedUpdate, SyncStatus, UpdateKind, would_be_noop,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One committed batch: the updates staged since the previous breadcrumb
/// plus the upstream status at commit time. Immutable once published;
/// indices are dense and strictly increasing, starting at 1.
#[derive(Debug)]
pub struct Breadcrumb {
    pub index: u64,
    pub updates: Vec<Arc<SerializedUpdate>>,
    pub status: SyncStatus,
}

/// The live entries and trail position handed to a joining peer.
#[derive(Debug)]
pub struct Snapshot {
    /// Latest committed breadcrumb index at snapshot time (0 = none yet).
    pub index: u64,
    /// Status of the latest breadcrumb.
    pub status: SyncStatus,
    /// The live entries as of `index`. Iteration order is unspecified.
    pub entries: Vec<Arc<SerializedUpdate>>,
}

/// One step of the tail: a single breadcrumb's content, or, when the
/// follower had more than one breadcrumb pending, the whole pending
/// range coalesced to the last form per key.
#[derive(Debug)]
pub struct Delta {
    pub updates: Vec<Arc<SerializedUpdate>>,
    pub status: SyncStatus,
    /// Index of the last breadcrumb this delta covers.
    pub last_index: u64,
}

/// Point-in-time counters for the stats log line.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub live_keys: usize,
    pub latest_index: u64,
    pub retained_breadcrumbs: usize,
    /// Commit index of the least-recently-changed live entry.
    pub oldest_live_index: Option<u64>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LiveEntry {
    update: Arc<SerializedUpdate>,
    /// Trail index at which this form was committed.
    trail_index: u64,
}

struct CacheState {
    live: HashMap<String, LiveEntry>,
    trail: VecDeque<Arc<Breadcrumb>>,
    latest_index: u64,
    latest_status: SyncStatus,
}

struct Shared {
    state: RwLock<CacheState>,
    /// Latest committed index, for waking followers. The value readers
    /// act on always comes from `state`, under the lock.
    publish: watch::Sender<u64>,
    /// Follower id → last consumed index. Guards trail trimming.
    followers: std::sync::Mutex<HashMap<u64, u64>>,
    next_follower_id: AtomicU64,
    closed: AtomicBool,
}

// ---------------------------------------------------------------------------
// CacheWriter
// ---------------------------------------------------------------------------

/// The single writer. Owned by the upstream drain task; everything else
/// sees the cache through [`CacheHandle`].
pub struct CacheWriter {
    shared: Arc<Shared>,
    /// Staged updates for the next breadcrumb, in first-staged order.
    /// Slots go `None` when a later update in the same batch cancels an
    /// earlier one.
    staged: Vec<Option<Arc<SerializedUpdate>>>,
    staged_pos: HashMap<String, usize>,
    staged_status: Option<SyncStatus>,
}

/// Build a cache: the writer goes to the upstream drain task, the handle
/// to everyone else.
pub fn new_cache() -> (CacheWriter, CacheHandle) {
    let (publish, _) = watch::channel(0u64);
    let shared = Arc::new(Shared {
        state: RwLock::new(CacheState {
            live: HashMap::new(),
            trail: VecDeque::new(),
            latest_index: 0,
            latest_status: SyncStatus::WaitForDatastore,
        }),
        publish,
        followers: std::sync::Mutex::new(HashMap::new()),
        next_follower_id: AtomicU64::new(1),
        closed: AtomicBool::new(false),
    });
    let writer = CacheWriter {
        shared: shared.clone(),
        staged: Vec::new(),
        staged_pos: HashMap::new(),
        staged_status: None,
    };
    (writer, CacheHandle { shared })
}

impl CacheWriter {
    /// Ingest one upstream update.
    ///
    /// Serializes it, deduplicates against the latest known form for the
    /// key, and stages it for the next breadcrumb. A value that fails to
    /// serialize becomes a synthetic delete: it cannot be sent to any
    /// peer, and a deletion is the safest loss of information.
    pub async fn on_upstream_update(&mut self, raw: RawUpdate) {
        let serialized = match SerializedUpdate::from_raw(&raw) {
            Ok(serialized) => serialized,
            Err(SerializeError::Key(e)) => {
                error!(error = %e, "upstream produced a non-canonicalizable key; dropping update");
                return;
            }
            Err(SerializeError::Value(e)) => match raw.key.canonical() {
                Ok(key) => {
                    warn!(key = %key, error = %e, "value failed to serialize; publishing synthetic delete");
                    SerializedUpdate::deleted(key, raw.revision.clone())
                }
                Err(key_err) => {
                    error!(error = %key_err, "unserializable value under a non-canonicalizable key; dropping update");
                    return;
                }
            },
        };
        self.stage(serialized).await;
    }

    /// Stage the new upstream status for the next breadcrumb. A repeat of
    /// the current status still produces a breadcrumb: peers use it as a
    /// punctuation point.
    pub fn on_upstream_status(&mut self, status: SyncStatus) {
        self.staged_status = Some(status);
    }

    /// Seal and publish the staged breadcrumb. No-op when nothing is
    /// staged. Called after each upstream batch and from the drain
    /// loop's idle tick.
    pub async fn commit(&mut self) {
        let updates: Vec<Arc<SerializedUpdate>> = self.staged.drain(..).flatten().collect();
        self.staged_pos.clear();
        let staged_status = self.staged_status.take();
        if updates.is_empty() && staged_status.is_none() {
            return;
        }

        let mut state = self.shared.state.write().await;
        let index = state.latest_index + 1;
        let status = staged_status.unwrap_or(state.latest_status);
        for update in &updates {
            if update.kind == UpdateKind::Deleted {
                state.live.remove(&update.key);
            } else {
                state.live.insert(
                    update.key.clone(),
                    LiveEntry { update: update.clone(), trail_index: index },
                );
            }
        }
        let count = updates.len();
        state.trail.push_back(Arc::new(Breadcrumb { index, updates, status }));
        state.latest_index = index;
        state.latest_status = status;
        Self::trim_trail(&self.shared, &mut state);
        drop(state);

        let _ = self.shared.publish.send(index);
        debug!(index, updates = count, ?status, "breadcrumb committed");
    }

    async fn stage(&mut self, mut serialized: SerializedUpdate) {
        let key = serialized.key.clone();
        let staged_prev = self
            .staged_pos
            .get(&key)
            .and_then(|&i| self.staged[i].clone());
        let live_prev = {
            let state = self.shared.state.read().await;
            state.live.get(&key).map(|entry| entry.update.clone())
        };
        let latest = staged_prev.clone().or_else(|| live_prev.clone());

        if serialized.kind == UpdateKind::Deleted {
            match (&staged_prev, &live_prev) {
                (None, None) => {
                    debug!(key = %key, "delete for unknown key dropped");
                    return;
                }
                // Created and deleted within one batch: peers never saw
                // the key, so there is nothing to publish.
                (Some(_), None) => {
                    self.unstage(&key);
                    return;
                }
                _ => {}
            }
        }

        // A key that already has an entry cannot be "new" again; this
        // keeps reconnect-driven resyncs from signalling re-creation.
        if serialized.kind == UpdateKind::New && latest.is_some() {
            serialized.kind = UpdateKind::Updated;
        }

        if let Some(latest) = &latest
            && would_be_noop(&serialized, latest)
        {
            debug!(key = %key, "noop update dropped");
            return;
        }

        let update = Arc::new(serialized);
        match self.staged_pos.get(&key) {
            // Same key twice within one batch: only the last form survives.
            Some(&i) => self.staged[i] = Some(update.clone()),
            None => {
                self.staged_pos.insert(key.clone(), self.staged.len());
                self.staged.push(Some(update.clone()));
            }
        }

        // The batch may have circled back to the committed form, in which
        // case transmitting it would tell peers nothing.
        if let Some(live_prev) = &live_prev
            && would_be_noop(&update, live_prev)
        {
            self.unstage(&key);
        }
    }

    fn unstage(&mut self, key: &str) {
        if let Some(i) = self.staged_pos.remove(key) {
            self.staged[i] = None;
        }
    }

    /// Drop breadcrumbs every follower has consumed. With no followers
    /// the whole trail goes: a joining peer starts from the snapshot.
    fn trim_trail(shared: &Shared, state: &mut CacheState) {
        let min_cursor = {
            let followers = shared.followers.lock().expect("follower registry poisoned");
            followers.values().copied().min().unwrap_or(state.latest_index)
        };
        while let Some(front) = state.trail.front() {
            if front.index <= min_cursor {
                state.trail.pop_front();
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CacheHandle
// ---------------------------------------------------------------------------

/// Read-side handle: snapshots, followers, stats, shutdown.
#[derive(Clone)]
pub struct CacheHandle {
    shared: Arc<Shared>,
}

impl CacheHandle {
    /// Atomically take the current snapshot and a follower positioned
    /// right after it: every update committed at an index ≤ the
    /// snapshot's is in the snapshot, everything later comes from the
    /// follower, with no gap and no duplication.
    pub async fn subscribe(&self) -> (Snapshot, Follower) {
        let state = self.shared.state.read().await;
        let snapshot = Snapshot {
            index: state.latest_index,
            status: state.latest_status,
            entries: state.live.values().map(|entry| entry.update.clone()).collect(),
        };
        // Register while still holding the read lock so a commit cannot
        // trim the trail past the snapshot index first.
        let id = self.shared.next_follower_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .followers
            .lock()
            .expect("follower registry poisoned")
            .insert(id, state.latest_index);
        drop(state);

        let follower = Follower {
            shared: self.shared.clone(),
            rx: self.shared.publish.subscribe(),
            id,
            cursor: snapshot.index,
        };
        (snapshot, follower)
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.shared.state.read().await;
        CacheStats {
            live_keys: state.live.len(),
            latest_index: state.latest_index,
            retained_breadcrumbs: state.trail.len(),
            oldest_live_index: state.live.values().map(|entry| entry.trail_index).min(),
        }
    }

    /// End the trail. Followers drain whatever is committed, then finish.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.publish.send_modify(|_| {});
    }
}

// ---------------------------------------------------------------------------
// Follower
// ---------------------------------------------------------------------------

/// A peer sender's position in the trail. Holds an index, not a pointer;
/// breadcrumbs stay immutable and shared.
pub struct Follower {
    shared: Arc<Shared>,
    rx: watch::Receiver<u64>,
    id: u64,
    cursor: u64,
}

impl Follower {
    /// The next delta, waiting if nothing is committed past the cursor.
    /// `None` once the cache has shut down and the trail is drained.
    pub async fn next(&mut self) -> Option<Delta> {
        loop {
            if let Some(delta) = self.pending().await {
                return Some(delta);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            if self.rx.changed().await.is_err() {
                return self.pending().await;
            }
        }
    }

    async fn pending(&mut self) -> Option<Delta> {
        let delta = {
            let state = self.shared.state.read().await;
            if state.latest_index <= self.cursor {
                None
            } else {
                // Registration pins the trail, so the first pending
                // breadcrumb is always still retained.
                let front_index = state.trail.front().map_or(0, |crumb| crumb.index);
                let first = usize::try_from((self.cursor + 1).saturating_sub(front_index))
                    .unwrap_or(usize::MAX);
                let last = usize::try_from(state.latest_index.saturating_sub(front_index))
                    .unwrap_or(usize::MAX);
                Some(if first == last {
                    let crumb = &state.trail[first];
                    Delta {
                        updates: crumb.updates.clone(),
                        status: crumb.status,
                        last_index: crumb.index,
                    }
                } else {
                    coalesce(state.trail.iter().skip(first).take(last - first + 1))
                })
            }
        };
        if let Some(delta) = &delta {
            self.cursor = delta.last_index;
            self.shared
                .followers
                .lock()
                .expect("follower registry poisoned")
                .insert(self.id, self.cursor);
        }
        delta
    }
}

impl Drop for Follower {
    fn drop(&mut self) {
        if let Ok(mut followers) = self.shared.followers.lock() {
            followers.remove(&self.id);
        }
    }
}

/// Collapse a pending range to the last form per key. That form equals
/// the live entry at the range's end for surviving keys; deletions
/// survive as `Deleted` updates. One update per key, however long the
/// range: this is what bounds a slow peer's catch-up cost.
fn coalesce<'a, I>(range: I) -> Delta
where
    I: Iterator<Item = &'a Arc<Breadcrumb>>,
{
    let mut order: Vec<String> = Vec::new();
    let mut last: HashMap<String, Arc<SerializedUpdate>> = HashMap::new();
    let mut status = SyncStatus::WaitForDatastore;
    let mut last_index = 0;
    for crumb in range {
        for update in &crumb.updates {
            if !last.contains_key(&update.key) {
                order.push(update.key.clone());
            }
            last.insert(update.key.clone(), update.clone());
        }
        status = crumb.status;
        last_index = crumb.index;
    }
    let updates = order
        .iter()
        .filter_map(|key| last.remove(key))
        .collect();
    Delta { updates, status, last_index }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_protocol::KeyPath;
    use serde_json::json;
    use std::time::Duration;

    fn raw(key: &str, value: serde_json::Value, revision: &str, kind: UpdateKind) -> RawUpdate {
        RawUpdate {
            key: KeyPath::parse(key).expect("test key parses"),
            value: if kind == UpdateKind::Deleted { None } else { Some(value) },
            revision: revision.to_owned(),
            ttl: Duration::ZERO,
            kind,
        }
    }

    fn deletion(key: &str, revision: &str) -> RawUpdate {
        raw(key, json!(null), revision, UpdateKind::Deleted)
    }

    /// Apply a sequence of updates to a key→value-bytes map the way a
    /// peer would.
    fn apply(map: &mut HashMap<String, Vec<u8>>, updates: &[Arc<SerializedUpdate>]) {
        for update in updates {
            if update.kind == UpdateKind::Deleted {
                map.remove(&update.key);
            } else {
                map.insert(update.key.clone(), update.value.clone());
            }
        }
    }

    #[tokio::test]
    async fn commit_publishes_live_entries_and_index() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.on_upstream_update(raw("/b", json!(2), "rev-2", UpdateKind::New)).await;
        writer.commit().await;

        let (snapshot, _follower) = handle.subscribe().await;
        assert_eq!(snapshot.index, 1);
        assert_eq!(snapshot.entries.len(), 2);
    }

    #[tokio::test]
    async fn identical_content_under_a_new_revision_is_dropped() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.commit().await;

        writer.on_upstream_update(raw("/a", json!(1), "rev-3", UpdateKind::Updated)).await;
        writer.commit().await;

        assert_eq!(handle.stats().await.latest_index, 1, "noop must not commit a breadcrumb");
    }

    #[tokio::test]
    async fn new_is_normalized_to_updated_when_an_entry_exists() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.commit().await;
        let (_, mut follower) = handle.subscribe().await;

        // A resync can replay the key as "new" with fresh content.
        writer.on_upstream_update(raw("/a", json!(2), "rev-5", UpdateKind::New)).await;
        writer.commit().await;

        let delta = follower.next().await.expect("delta");
        assert_eq!(delta.updates.len(), 1);
        assert_eq!(delta.updates[0].kind, UpdateKind::Updated);
    }

    #[tokio::test]
    async fn delete_for_unknown_key_is_dropped() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(deletion("/ghost", "rev-1")).await;
        writer.commit().await;
        assert_eq!(handle.stats().await.latest_index, 0);
    }

    #[tokio::test]
    async fn same_key_twice_in_one_batch_keeps_only_the_last_form() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.commit().await;
        let (_, mut follower) = handle.subscribe().await;

        writer.on_upstream_update(raw("/a", json!(2), "rev-2", UpdateKind::Updated)).await;
        writer.on_upstream_update(raw("/a", json!(3), "rev-3", UpdateKind::Updated)).await;
        writer.commit().await;

        let delta = follower.next().await.expect("delta");
        assert_eq!(delta.updates.len(), 1);
        assert_eq!(delta.updates[0].value, serde_json::to_vec(&json!(3)).unwrap());
    }

    #[tokio::test]
    async fn batch_that_circles_back_to_the_committed_form_publishes_nothing() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.commit().await;

        writer.on_upstream_update(raw("/a", json!(2), "rev-2", UpdateKind::Updated)).await;
        writer.on_upstream_update(raw("/a", json!(1), "rev-3", UpdateKind::Updated)).await;
        writer.commit().await;

        assert_eq!(handle.stats().await.latest_index, 1);
    }

    #[tokio::test]
    async fn create_then_delete_in_one_batch_publishes_nothing() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/flash", json!(1), "rev-1", UpdateKind::New)).await;
        writer.on_upstream_update(deletion("/flash", "rev-2")).await;
        writer.commit().await;
        assert_eq!(handle.stats().await.latest_index, 0);
        assert_eq!(handle.stats().await.live_keys, 0);
    }

    #[tokio::test]
    async fn repeated_status_still_punctuates() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_status(SyncStatus::InSync);
        writer.commit().await;
        writer.on_upstream_status(SyncStatus::InSync);
        writer.commit().await;
        assert_eq!(handle.stats().await.latest_index, 2);
    }

    #[tokio::test]
    async fn idle_commit_with_nothing_staged_is_a_noop() {
        let (mut writer, handle) = new_cache();
        writer.commit().await;
        writer.commit().await;
        assert_eq!(handle.stats().await.latest_index, 0);
    }

    #[tokio::test]
    async fn snapshot_and_tail_have_no_gap_and_no_overlap() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.commit().await;

        let (snapshot, mut follower) = handle.subscribe().await;
        assert_eq!(snapshot.entries.len(), 1);

        writer.on_upstream_update(raw("/b", json!(2), "rev-2", UpdateKind::New)).await;
        writer.commit().await;

        let delta = follower.next().await.expect("delta");
        assert_eq!(delta.updates.len(), 1, "snapshot content must not repeat in the tail");
        assert_eq!(delta.updates[0].key, "/b");
    }

    #[tokio::test]
    async fn stalled_follower_gets_the_range_coalesced_per_key() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(0), "rev-1", UpdateKind::New)).await;
        writer.on_upstream_update(raw("/doomed", json!(0), "rev-2", UpdateKind::New)).await;
        writer.commit().await;
        let (_, mut follower) = handle.subscribe().await;

        // Five commits land while the follower is not draining.
        for i in 1..=4 {
            writer
                .on_upstream_update(raw("/a", json!(i), &format!("rev-{}", 10 + i), UpdateKind::Updated))
                .await;
            writer.commit().await;
        }
        writer.on_upstream_update(deletion("/doomed", "rev-20")).await;
        writer.commit().await;

        let delta = follower.next().await.expect("delta");
        assert_eq!(delta.last_index, 6);
        assert_eq!(delta.updates.len(), 2, "one update per key, however many commits");
        let a = delta.updates.iter().find(|u| u.key == "/a").expect("/a present");
        assert_eq!(a.value, serde_json::to_vec(&json!(4)).unwrap(), "last form wins");
        let doomed = delta.updates.iter().find(|u| u.key == "/doomed").expect("/doomed present");
        assert_eq!(doomed.kind, UpdateKind::Deleted, "deletions survive coalescing");
    }

    #[tokio::test]
    async fn snapshot_plus_deltas_equals_the_live_map() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.on_upstream_update(raw("/b", json!(2), "rev-2", UpdateKind::New)).await;
        writer.commit().await;

        let (snapshot, mut follower) = handle.subscribe().await;
        let mut replica = HashMap::new();
        apply(&mut replica, &snapshot.entries);

        writer.on_upstream_update(raw("/b", json!(20), "rev-3", UpdateKind::Updated)).await;
        writer.on_upstream_update(raw("/c", json!(3), "rev-4", UpdateKind::New)).await;
        writer.commit().await;
        writer.on_upstream_update(deletion("/a", "rev-5")).await;
        writer.commit().await;

        loop {
            let delta = follower.next().await.expect("delta");
            apply(&mut replica, &delta.updates);
            if delta.last_index == handle.stats().await.latest_index {
                break;
            }
        }

        let (final_snapshot, _f) = handle.subscribe().await;
        let mut live = HashMap::new();
        apply(&mut live, &final_snapshot.entries);
        assert_eq!(replica, live);
    }

    #[tokio::test]
    async fn trail_is_trimmed_once_every_follower_has_consumed_it() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.commit().await;
        let (_, mut follower) = handle.subscribe().await;

        writer.on_upstream_update(raw("/a", json!(2), "rev-2", UpdateKind::Updated)).await;
        writer.commit().await;
        assert_eq!(handle.stats().await.retained_breadcrumbs, 1);

        let _ = follower.next().await.expect("delta");
        // The next commit observes the advanced cursor and trims.
        writer.on_upstream_update(raw("/a", json!(3), "rev-3", UpdateKind::Updated)).await;
        writer.commit().await;
        assert_eq!(handle.stats().await.retained_breadcrumbs, 1);
    }

    #[tokio::test]
    async fn with_no_followers_the_trail_holds_no_history() {
        let (mut writer, handle) = new_cache();
        for i in 0..10 {
            writer
                .on_upstream_update(raw("/k", json!(i), &format!("rev-{i}"), UpdateKind::Updated))
                .await;
            writer.commit().await;
        }
        assert_eq!(handle.stats().await.retained_breadcrumbs, 0);
        assert_eq!(handle.stats().await.latest_index, 10);
    }

    #[tokio::test]
    async fn shutdown_ends_followers_after_the_drain() {
        let (mut writer, handle) = new_cache();
        writer.on_upstream_update(raw("/a", json!(1), "rev-1", UpdateKind::New)).await;
        writer.commit().await;
        let (_, mut follower) = handle.subscribe().await;

        writer.on_upstream_update(raw("/a", json!(2), "rev-2", UpdateKind::Updated)).await;
        writer.commit().await;
        handle.shutdown();

        assert!(follower.next().await.is_some(), "committed work drains first");
        assert!(follower.next().await.is_none(), "then the trail ends");
    }
}
