//! Wire model shared by the chat hub and its clients.
//!
//! This crate provides:
//! - The chat [`Message`] record and its [`MessageType`] ([`message`])
//! - Server-to-client frame encoding and parsing ([`frame`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod frame;
pub mod message;
pub mod types;

pub use frame::{FrameError, ServerFrame};
pub use message::{Message, MessageType};
