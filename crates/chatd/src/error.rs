use thiserror::Error;

/// Errors that can occur during hub operation.
#[derive(Error, Debug)]
pub enum ChatdError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Client frame could not be decoded.
    #[error("frame error: {0}")]
    Frame(#[from] chat_common::FrameError),
    /// Message store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// No pong arrived before the read deadline.
    #[error("read deadline expired")]
    ReadTimeout,
    /// An outbound write did not complete before its deadline.
    #[error("write deadline expired")]
    WriteTimeout,
    /// The originating address exceeded its connection rate.
    #[error("connection rate limit exceeded")]
    RateLimited,
    /// The hub event loop has stopped.
    #[error("hub is not running")]
    HubClosed,
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Errors raised by the message cache and the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A lock was poisoned by a panicking holder.
    #[error("store lock poisoned")]
    Poisoned,
    /// The blocking task running the operation failed.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
