//! Protocol constants shared by server and clients.

/// `type` discriminator of the history envelope sent on join.
pub const RECENT_MESSAGES_TYPE: &str = "recent_messages";

/// Display name bound to connections that do not supply one.
pub const DEFAULT_USERNAME: &str = "Anonymous";

/// Number of messages replayed to a client when it joins.
pub const HISTORY_LIMIT: usize = 100;

/// Replacement emitted for a blocked token.
pub const MASK: &str = "***";

/// Result cap applied to searches that do not name one.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;
