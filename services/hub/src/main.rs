// hub: Fan-out relay between the datastore and its enforcement agents.
//
// One watch upstream, one in-memory snapshot, many peers downstream.

use tracing::info;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "hub starting");

    // Config from argv[1] if given, else the default path.
    let loaded = match std::env::args().nth(1) {
        Some(path) => hub::config::load_config_from_path(std::path::Path::new(&path)),
        None => hub::config::load_config(),
    };
    let config = match loaded {
        Ok(config) => {
            info!(
                bind = %config.listen.bind,
                upstream = %config.upstream.endpoint,
                max_peers = config.listen.max_peers,
                "config loaded"
            );
            config
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let source = hub::upstream::JsonLinesUpstream::new(config.upstream.endpoint.clone());
    let hub = match hub::server::Hub::start(config, source).await {
        Ok(hub) => hub,
        Err(e) => {
            eprintln!("FATAL: failed to bind listener: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    hub.run(shutdown_rx).await;
}
