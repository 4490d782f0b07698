#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use chatd::config::{Args, ServerConfig};
use chatd::filter::ContentFilter;
use chatd::hub::Hub;
use chatd::metrics::{start_metrics_server, HealthState};
use chatd::run_with_shutdown;
use chatd::server::ServerState;
use chatd::store::MessageStore;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    if let Some(parent) = config.database.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = MessageStore::open(&config.database)
        .with_context(|| format!("opening {}", config.database.display()))?;
    info!("message database at {}", config.database.display());

    let filter = ContentFilter::with_default_blocklist();
    info!(words = filter.len(), "content filter loaded");

    let hub = Hub::spawn(Arc::new(store), Arc::new(filter), config.history_limit);
    let _retention = hub.spawn_retention_sweep(config.retention(), config.sweep_interval());

    let state = Arc::new(ServerState::new(config.clone(), hub));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });
    health_state.set_ready(true);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let mut server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    let outcome = tokio::select! {
        result = &mut server => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            health_state.set_ready(false);
            let _ = shutdown_tx.send(());
            (&mut server).await
        }
    };
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server error: {}", e),
        Err(e) => tracing::error!("server task failed: {}", e),
    }

    Ok(())
}
