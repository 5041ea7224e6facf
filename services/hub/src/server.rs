//! Hub: process-lifetime coordinator.
//!
//! Owns the cache, the upstream drain task, the listener, and every peer
//! session. Nothing it spawns outlives it: shutdown stops the accept
//! loop, lets the drain commit its final breadcrumb, ends the trail, and
//! closes peers within a bounded window, forcing any that do not finish.

use crate::cache::new_cache;
use crate::config::HubConfig;
use crate::session::run_session;
use crate::upstream::{UpstreamSource, run_upstream};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior, interval, timeout};
use tracing::{info, warn};

/// Window for peer sessions to close on shutdown before they are forced.
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// A bound hub, ready to run.
pub struct Hub<U: UpstreamSource> {
    config: HubConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    source: U,
}

impl<U: UpstreamSource> Hub<U> {
    /// Bind the peer listener. The upstream watch is not opened until
    /// [`Hub::run`].
    pub async fn start(config: HubConfig, source: U) -> std::io::Result<Hub<U>> {
        let listener = TcpListener::bind(&config.listen.bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "hub listening");
        Ok(Hub { config, listener, local_addr, source })
    }

    /// The bound address (useful when port 0 was configured).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until `shutdown` flips. Consumes the hub; returns once every
    /// owned task has terminated.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Hub { config, listener, local_addr: _, source } = self;

        let (writer, cache) = new_cache();
        let upstream = tokio::spawn(run_upstream(source, writer, shutdown.clone()));

        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut stats = interval(STATS_INTERVAL);
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if sessions.len() >= config.listen.max_peers {
                            warn!(
                                peer = %addr,
                                max_peers = config.listen.max_peers,
                                "peer cap reached; dropping connection"
                            );
                            drop(stream);
                        } else {
                            sessions.spawn(run_session(
                                stream,
                                cache.clone(),
                                config.sync.clone(),
                                shutdown.clone(),
                            ));
                        }
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {},
                _ = stats.tick() => {
                    let cache_stats = cache.stats().await;
                    info!(
                        peers = sessions.len(),
                        live_keys = cache_stats.live_keys,
                        latest_index = cache_stats.latest_index,
                        "hub stats"
                    );
                }
            }
        }

        // Stop accepting, let the drain publish its final breadcrumb,
        // end the trail, then close peers.
        info!("hub shutting down");
        drop(listener);
        let _ = upstream.await;
        cache.shutdown();

        let drained = timeout(SHUTDOWN_WINDOW, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "forcing remaining peer sessions closed");
            sessions.shutdown().await;
        }
        info!("hub stopped");
    }
}
