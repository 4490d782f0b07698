use crate::client::handle_connection;
use crate::config::ServerConfig;
use crate::error::ChatdError;
use crate::hub::Hub;
use crate::ratelimit::ConnectionRateLimiter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Shared state for the chat server.
pub struct ServerState {
    /// Handle to the hub event loop.
    pub hub: Hub,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Connection-attempt limiter keyed by originating address.
    pub rate_limiter: ConnectionRateLimiter,
    /// Connections currently being served, including ones mid-handshake.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// Builds server state around a running hub.
    #[must_use]
    pub fn new(config: ServerConfig, hub: Hub) -> Self {
        let rate_limiter = ConnectionRateLimiter::new(config.conn_rate, config.conn_window());
        Self {
            hub,
            config,
            rate_limiter,
            active_connections: AtomicUsize::new(0),
        }
    }
}

/// Decrements the active-connection count when a connection task ends.
struct ConnGuard {
    state: Arc<ServerState>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Spawns the periodic eviction of expired rate-limit windows.
pub fn spawn_rate_limit_sweep(state: Arc<ServerState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = state.rate_limiter.window();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let removed = state.rate_limiter.sweep_expired();
            if removed > 0 {
                debug!(removed, tracked = state.rate_limiter.len(), "rate limit windows evicted");
            }
        }
    })
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), ChatdError> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let result = run_with_shutdown(listener, state, shutdown_rx).await;
    drop(shutdown_tx);
    result
}

/// Run the accept loop with an externally-controlled shutdown signal.
///
/// Sending on (or dropping) the paired sender stops accepting new
/// connections. Every hub client is then disconnected and in-flight
/// connection tasks get a bounded time to finish.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), ChatdError> {
    let local_addr = listener.local_addr()?;
    info!("chat server listening on {}", local_addr);
    let sweeper = spawn_rate_limit_sweep(Arc::clone(&state));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let admitted = state
                            .active_connections
                            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                                (n < state.config.max_conns).then_some(n + 1)
                            })
                            .is_ok();
                        if !admitted {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let guard = ConnGuard { state: Arc::clone(&state) };
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                debug!("connection from {} closed: {}", addr, e);
                            }
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    sweeper.abort();
    if let Err(e) = state.hub.disconnect_all().await {
        warn!("could not disconnect clients: {}", e);
    }

    let drain_timeout = std::time::Duration::from_secs(30);
    let drained = tokio::time::timeout(drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("drain timeout reached with {} connections still active", tasks.len());
        tasks.abort_all();
    }

    info!("server shut down");
    Ok(())
}
