//! Real-time chat broadcast hub.
//!
//! Clients connect over WebSocket, receive the recent history on join, and
//! every message any client sends is filtered, stored, and fanned out to all
//! connected clients.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// WebSocket connection actor.
pub mod client;
/// CLI argument parsing and server configuration.
pub mod config;
/// Error types for hub and store operations.
pub mod error;
/// Blocked-word masking.
pub mod filter;
/// Serialized client registry and broadcast fan-out.
pub mod hub;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Per-address connection rate limiting.
pub mod ratelimit;
/// Accept loop and shared server state.
pub mod server;
/// Message cache and durable storage.
pub mod store;

pub use hub::{ClientHandle, Hub};
pub use server::{run, run_with_shutdown, ServerState};
