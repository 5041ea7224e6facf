//! A peer wrapper for integration tests: every receive is bounded by a
//! timeout, and expectation helpers panic with a useful message instead
//! of hanging the suite.

use herd_client::{PeerEvent, PeerIdentity, PeerSession};
use herd_protocol::{RawUpdate, SyncStatus};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestPeer {
    session: PeerSession,
}

impl TestPeer {
    /// Connect and complete the handshake with a default test identity.
    pub async fn connect(addr: SocketAddr) -> TestPeer {
        Self::connect_as(addr, "test-peer").await
    }

    /// Connect with a distinguishable hostname, for multi-peer tests.
    pub async fn connect_as(addr: SocketAddr, hostname: &str) -> TestPeer {
        let identity = PeerIdentity {
            hostname: hostname.to_owned(),
            info: "herd-test-utils".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        let session = timeout(RECV_TIMEOUT, PeerSession::connect(addr, identity))
            .await
            .expect("timeout connecting to hub")
            .expect("handshake failed");
        TestPeer { session }
    }

    /// The next event, bounded by the receive timeout.
    pub async fn recv_event(&mut self) -> PeerEvent {
        timeout(RECV_TIMEOUT, self.session.next_event())
            .await
            .expect("timeout waiting for an event")
            .expect("session failed while waiting for an event")
    }

    /// Expect the next event to be an update batch.
    pub async fn recv_updates(&mut self) -> Vec<RawUpdate> {
        match self.recv_event().await {
            PeerEvent::Updates(updates) => updates,
            PeerEvent::Status(status) => panic!("expected updates, got status {status:?}"),
        }
    }

    /// Expect the next event to be a status frame.
    pub async fn recv_status(&mut self) -> SyncStatus {
        match self.recv_event().await {
            PeerEvent::Status(status) => status,
            PeerEvent::Updates(updates) => panic!("expected status, got {} updates", updates.len()),
        }
    }

    /// Drain events until `status` arrives, applying every update batch
    /// to a key→value map along the way. Returns the accumulated map.
    pub async fn collect_until_status(
        &mut self,
        status: SyncStatus,
    ) -> HashMap<String, Option<serde_json::Value>> {
        let mut map = HashMap::new();
        loop {
            match self.recv_event().await {
                PeerEvent::Updates(updates) => apply_updates(&mut map, &updates),
                PeerEvent::Status(seen) if seen == status => return map,
                PeerEvent::Status(_) => {}
            }
        }
    }

    /// True once the hub has closed the socket (cleanly or not).
    pub async fn closed_by_hub(&mut self) -> bool {
        matches!(
            timeout(RECV_TIMEOUT, self.session.next_event()).await,
            Ok(Err(herd_client::ClientError::ConnectionClosed | herd_client::ClientError::Codec(_)))
        )
    }
}

/// Apply a batch the way an agent's local store would.
pub fn apply_updates(
    map: &mut HashMap<String, Option<serde_json::Value>>,
    updates: &[RawUpdate],
) {
    for update in updates {
        let key = update.key.canonical().expect("hub sends canonical keys");
        if update.kind == herd_protocol::UpdateKind::Deleted {
            map.remove(&key);
        } else {
            map.insert(key, update.value.clone());
        }
    }
}
