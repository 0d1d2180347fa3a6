use anyhow::Result;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vigil::api::RestApi;
use vigil::config::{self, RealtimeTransport};
use vigil::realtime::{create_change_feed, ChangeFeed, LocalChangeFeed};
use vigil::sync::{DashboardStore, CAMERAS, INCIDENTS, UNRESOLVED_INCIDENTS};
use vigil::{BackendGateway, RestClient};

async fn run_app() -> Result<()> {
    // Load configuration, then let the environment override credentials
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = config::load_config(config_path.as_deref())?;
    config.apply_env_overrides();

    // Initialize logging; RUST_LOG still wins over the configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.api.log_level)).init();
    info!("Starting vigil incident dashboard service");

    config.validate()?;
    info!("Configuration loaded, backend at {}", config.backend.url);

    let rest = RestClient::new(&config.backend)?;

    let feed: Arc<dyn ChangeFeed> = match config.realtime.transport {
        RealtimeTransport::Amqp => {
            let feed: Arc<dyn ChangeFeed> = create_change_feed(config.realtime.message_broker.clone()).await?;
            info!("Change feed connected to message broker");
            feed
        }
        RealtimeTransport::Local => {
            warn!("Using in-process change feed; backend changes will not be pushed");
            Arc::new(LocalChangeFeed::new())
        }
    };

    let gateway = Arc::new(BackendGateway::new(rest, feed));
    let store = Arc::new(DashboardStore::new(gateway, config.sync.clone()));

    // Warm the caches; failures are logged and the views start empty
    for key in [INCIDENTS, UNRESOLVED_INCIDENTS] {
        match store.incidents(&key).await {
            Ok(loaded) if loaded.error.is_none() => info!("Loaded {} {}", loaded.rows.len(), key),
            Ok(_) => warn!("Starting with empty {}", key),
            Err(e) => error!("Failed to load {}: {}", key, e),
        }
    }
    if store.cameras().await.error.is_some() {
        warn!("Starting with empty {}", CAMERAS);
    }

    let shutdown = CancellationToken::new();
    let api = RestApi::new(&config.api, store.clone());
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { api.run(shutdown).await })
    };
    info!("API server started");

    // Wait for termination signals
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server error: {}", e),
        Err(e) => error!("API server task failed: {}", e),
    }

    // Let resolutions already sent to the backend settle
    store.resolver().wait_idle().await;

    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_app()) {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}
