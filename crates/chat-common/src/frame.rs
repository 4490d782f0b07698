//! Server-to-client frame encoding and parsing.
//!
//! Every frame is a single JSON object sent as a WebSocket text message.
//! A frame whose `type` is [`RECENT_MESSAGES_TYPE`] carries the join
//! history; any other frame is a chat [`Message`].

use crate::message::Message;
use crate::types::RECENT_MESSAGES_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A parsed server-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// One broadcast chat message.
    Message(Message),
    /// History replayed on join, oldest first.
    RecentMessages(Vec<Message>),
}

/// Errors that can occur while encoding or parsing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The input was empty.
    #[error("frame is empty")]
    Empty,
    /// The frame exceeds the maximum allowed size.
    #[error("frame too large: max {max}, got {actual}")]
    TooLarge {
        /// Maximum allowed size in bytes.
        max: usize,
        /// Actual size received.
        actual: usize,
    },
    /// The frame is not a valid JSON object of the expected shape.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct RecentMessagesOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    messages: &'a [Message],
}

#[derive(Deserialize)]
struct RecentMessagesIn {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl ServerFrame {
    /// Encodes the frame as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Json`] if serialization fails.
    pub fn serialize(&self) -> Result<String, FrameError> {
        let json = match self {
            Self::Message(msg) => serde_json::to_string(msg)?,
            Self::RecentMessages(messages) => serde_json::to_string(&RecentMessagesOut {
                kind: RECENT_MESSAGES_TYPE,
                messages,
            })?,
        };
        Ok(json)
    }

    /// Parses a frame received from the server.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Empty`] for empty input and [`FrameError::Json`]
    /// when the payload is not a recognizable frame.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        let tag: TypeTag = serde_json::from_slice(data)?;
        if tag.kind.as_deref() == Some(RECENT_MESSAGES_TYPE) {
            let envelope: RecentMessagesIn = serde_json::from_slice(data)?;
            Ok(Self::RecentMessages(envelope.messages))
        } else {
            Ok(Self::Message(serde_json::from_slice(data)?))
        }
    }

    /// Returns the chat message if this is a [`ServerFrame::Message`].
    #[must_use]
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(msg) => Some(msg),
            Self::RecentMessages(_) => None,
        }
    }
}

/// Parses a client-submitted message, enforcing a size cap.
///
/// # Errors
///
/// Returns [`FrameError::Empty`], [`FrameError::TooLarge`] or
/// [`FrameError::Json`].
pub fn parse_inbound(data: &[u8], max_size: usize) -> Result<Message, FrameError> {
    if data.is_empty() {
        return Err(FrameError::Empty);
    }
    if data.len() > max_size {
        return Err(FrameError::TooLarge {
            max: max_size,
            actual: data.len(),
        });
    }
    Ok(serde_json::from_slice(data)?)
}
