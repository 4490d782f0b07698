use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the chat hub.
#[derive(Parser, Debug, Clone)]
#[command(name = "chatd")]
#[command(about = "Real-time chat broadcast hub")]
#[command(version)]
pub struct Args {
    /// Socket address to accept WebSocket connections on.
    #[arg(long, default_value = "0.0.0.0:1401", env = "CHATD_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "CHATD_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Path to the SQLite message database.
    #[arg(long, default_value = "data/chat.db", env = "CHATD_DATABASE")]
    pub database: PathBuf,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "CHATD_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum inbound WebSocket message size in bytes.
    #[arg(long, default_value = "524288", env = "CHATD_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Capacity of each client's outbound queue.
    #[arg(long, default_value = "256", env = "CHATD_SEND_QUEUE")]
    pub send_queue: usize,
    /// Number of messages replayed to a client on join.
    #[arg(long, default_value = "100", env = "CHATD_HISTORY")]
    pub history_limit: usize,
    /// Connection attempts allowed per address per window.
    #[arg(long, default_value = "10", env = "CHATD_CONN_RATE")]
    pub conn_rate: u32,
    /// Length of the connection rate-limit window in seconds.
    #[arg(long, default_value = "60", env = "CHATD_CONN_WINDOW")]
    pub conn_window: u64,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "54", env = "CHATD_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Seconds to wait for a pong before dropping the connection.
    #[arg(long, default_value = "60", env = "CHATD_PONG_WAIT")]
    pub pong_wait: u64,
    /// Deadline for a single outbound write in seconds.
    #[arg(long, default_value = "10", env = "CHATD_WRITE_TIMEOUT")]
    pub write_timeout: u64,
    /// Persisted messages older than this many days are purged.
    #[arg(long, default_value = "30", env = "CHATD_RETENTION_DAYS")]
    pub retention_days: u32,
    /// Interval between retention sweeps in seconds.
    #[arg(long, default_value = "86400", env = "CHATD_SWEEP_INTERVAL")]
    pub sweep_interval: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to accept WebSocket connections on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Path to the SQLite message database.
    pub database: PathBuf,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_payload: usize,
    /// Capacity of each client's outbound queue.
    pub send_queue: usize,
    /// Number of messages replayed to a client on join.
    pub history_limit: usize,
    /// Connection attempts allowed per address per window.
    pub conn_rate: u32,
    /// Length of the connection rate-limit window in seconds.
    pub conn_window: u64,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Seconds to wait for a pong before dropping the connection.
    pub pong_wait: u64,
    /// Deadline for a single outbound write in seconds.
    pub write_timeout: u64,
    /// Persisted messages older than this many days are purged.
    pub retention_days: u32,
    /// Interval between retention sweeps in seconds.
    pub sweep_interval: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        const MAX_ALLOWED_PAYLOAD: usize = 16 * 1024 * 1024;
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_PAYLOAD
            ));
        }

        // The join history must fit in a fresh queue alongside live traffic.
        if self.send_queue < 2 {
            return Err("send_queue must be at least 2".to_string());
        }
        if self.send_queue > 65_536 {
            return Err("send_queue exceeds reasonable limit (65536)".to_string());
        }

        if self.history_limit == 0 {
            return Err("history_limit must be greater than 0".to_string());
        }
        if self.history_limit > chat_common::types::HISTORY_LIMIT {
            return Err(format!(
                "history_limit cannot exceed cache capacity ({})",
                chat_common::types::HISTORY_LIMIT
            ));
        }

        if self.conn_rate == 0 {
            return Err("conn_rate must be greater than 0".to_string());
        }
        if self.conn_window == 0 {
            return Err("conn_window must be greater than 0".to_string());
        }
        if self.conn_window > 86_400 {
            return Err("conn_window exceeds reasonable limit (86400 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.pong_wait == 0 {
            return Err("pong_wait must be greater than 0".to_string());
        }
        if self.ping_interval >= self.pong_wait {
            return Err("ping_interval must be shorter than pong_wait".to_string());
        }
        if self.pong_wait > 3600 {
            return Err("pong_wait exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.write_timeout == 0 {
            return Err("write_timeout must be greater than 0".to_string());
        }
        if self.write_timeout > 300 {
            return Err("write_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.retention_days == 0 {
            return Err("retention_days must be greater than 0".to_string());
        }
        if self.retention_days > 3650 {
            return Err("retention_days exceeds reasonable limit (3650 days)".to_string());
        }
        if self.sweep_interval == 0 {
            return Err("sweep_interval must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Rate-limit window as a [`Duration`].
    #[must_use]
    pub fn conn_window(&self) -> Duration {
        Duration::from_secs(self.conn_window)
    }

    /// Ping period as a [`Duration`].
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    /// Read deadline as a [`Duration`].
    #[must_use]
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait)
    }

    /// Write deadline as a [`Duration`].
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    /// Retention age as a [`chrono::Duration`].
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Retention sweep period as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            database: args.database,
            max_conns: args.max_conns,
            max_payload: args.max_payload,
            send_queue: args.send_queue,
            history_limit: args.history_limit,
            conn_rate: args.conn_rate,
            conn_window: args.conn_window,
            ping_interval: args.ping_interval,
            pong_wait: args.pong_wait,
            write_timeout: args.write_timeout,
            retention_days: args.retention_days,
            sweep_interval: args.sweep_interval,
        }
    }
}
