//! Chat message record as it travels over the wire and into storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text message.
    #[default]
    Text,
    /// Sticker reference.
    Sticker,
    /// Server-generated notice.
    System,
    /// Highlighted paid message.
    Superchat,
}

impl MessageType {
    /// Wire and storage spelling of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Sticker => "sticker",
            Self::System => "system",
            Self::Superchat => "superchat",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type: {0:?}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "sticker" => Ok(Self::Sticker),
            "system" => Ok(Self::System),
            "superchat" => Ok(Self::Superchat),
            other => Err(UnknownMessageType(other.to_string())),
        }
    }
}

// Missing, null and empty all mean `text`.
impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Self::Text),
            Some(s) if s.is_empty() => Ok(Self::Text),
            Some(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A single chat message.
///
/// `id` is empty and `created_at` is `None` until the hub ingests the
/// message; both are fixed from then on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque unique identifier.
    #[serde(default)]
    pub id: String,
    /// Message text.
    #[serde(rename = "message", default)]
    pub content: String,
    /// Message kind.
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    /// Sender's user id, if the connection supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Sender's display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Ingestion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Creates an unstamped message of the given kind.
    #[must_use]
    pub fn new(kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            content: content.into(),
            kind,
            user_id: None,
            username: None,
            created_at: None,
        }
    }

    /// Creates an unstamped text message.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageType::Text, content)
    }

    /// Sets the sender identity.
    #[must_use]
    pub fn with_sender(mut self, user_id: Option<String>, username: Option<String>) -> Self {
        self.user_id = user_id;
        self.username = username;
        self
    }

    /// Sets the ingestion timestamp.
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}
