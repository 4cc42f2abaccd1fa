use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use artblock_daemon::engine::Engine;
use artblock_daemon::flag::FlagClient;
use artblock_daemon::router::{MessageRouter, RequestSource};
use artblock_daemon::store::BlacklistStore;
use artblock_daemon::sync::SyncClient;
use artblock_daemon::tabs::PlayerRegistry;
use artblock_daemon::{http, socket};
use artblock_proto::config::Config;
use artblock_proto::protocol::{Action, Event, Reply};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File logging
    let data_dir = artblock_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,artblock_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let store = Arc::new(BlacklistStore::open(config.daemon.state_file.clone()).await?);
    info!("Blacklist store: {:?}", config.daemon.state_file);

    let (events, _) = broadcast::channel::<Event>(64);
    let registry = Arc::new(PlayerRegistry::new(config.sites.allowed_domains.clone()));
    let engine = Engine::new(Arc::clone(&store), Arc::new(FlagClient::new(&config)));
    let sync = SyncClient::new(&config);
    let router = Arc::new(MessageRouter::new(
        Arc::clone(&store),
        engine,
        sync,
        Arc::clone(&registry),
        events,
    ));

    // TCP socket server
    let addr = format!("{}:{}", config.daemon.bind_address, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind TCP socket {addr}"))?;
    let _socket_handle = socket::start_server(listener, Arc::clone(&router), Arc::clone(&registry));

    // HTTP API if enabled
    if config.http.enabled {
        let http_addr = format!("{}:{}", config.http.bind_address, config.http.port);
        match tokio::net::TcpListener::bind(&http_addr).await {
            Ok(listener) => {
                let _http_handle = http::start_server(listener, Arc::clone(&router));
            }
            Err(e) => warn!("Failed to bind HTTP API on {http_addr}: {e}"),
        }
    }

    // Periodic community sync.  The interval's first tick fires immediately,
    // which doubles as the startup sync.
    let sync_router = Arc::clone(&router);
    let minutes = config.sync.interval_minutes.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(minutes * 60));
        loop {
            interval.tick().await;
            let reply = sync_router
                .dispatch(&RequestSource::internal(), Action::SyncCommunity)
                .await;
            if let Reply::Sync { success: false, .. } = reply {
                warn!("scheduler: periodic community sync failed, retrying next interval");
            }
        }
    });

    info!("Daemon initialised");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}
