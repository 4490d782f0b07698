//! Recent-message cache in front of the durable message database.

mod cache;
mod repository;

pub use cache::HistoryCache;
pub use repository::MessageRepository;

use crate::error::StoreError;
use crate::metrics::counters;
use chat_common::types::HISTORY_LIMIT;
use chat_common::Message;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::warn;

/// Facade over the [`HistoryCache`] and the [`MessageRepository`].
///
/// All methods block; async callers run them on the blocking pool.
#[derive(Debug)]
pub struct MessageStore {
    cache: HistoryCache,
    repo: MessageRepository,
}

impl MessageStore {
    /// Wraps an existing repository with an empty cache.
    #[must_use]
    pub fn new(repo: MessageRepository) -> Self {
        Self {
            cache: HistoryCache::new(HISTORY_LIMIT),
            repo,
        }
    }

    /// Opens the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Self::new(MessageRepository::open(path)?))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if migration fails.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(MessageRepository::open_in_memory()?))
    }

    /// Caches and persists one message.
    ///
    /// A cache failure is logged and does not stop the durable write.
    ///
    /// # Errors
    ///
    /// Returns the durable store's error, if any.
    pub fn save(&self, msg: &Message) -> Result<(), StoreError> {
        if let Err(e) = self.cache.push(msg) {
            counters::store_errors_total("cache_push");
            warn!(id = %msg.id, error = %e, "failed to cache message");
        }
        self.repo.save(msg)
    }

    /// Returns up to `limit` of the newest messages, oldest first.
    ///
    /// Served from the cache when it has anything; otherwise read from the
    /// database, which then repopulates the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        match self.cache.recent(limit) {
            Ok(messages) if !messages.is_empty() => return Ok(messages),
            Ok(_) => {}
            Err(e) => {
                counters::store_errors_total("cache_read");
                warn!(error = %e, "cache read failed, falling back to database");
            }
        }

        let messages = self.repo.recent(limit)?;
        if !messages.is_empty() {
            if let Err(e) = self.cache.populate(&messages) {
                counters::store_errors_total("cache_populate");
                warn!(error = %e, "failed to repopulate cache");
            }
        }
        Ok(messages)
    }

    /// Case-insensitive substring search, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        self.repo.search(query, limit)
    }

    /// Messages in `[start, end)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        self.repo.by_date_range(start, end)
    }

    /// Deletes persisted messages created before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.repo.delete_older_than(cutoff)
    }

    /// The recent-message cache.
    #[must_use]
    pub fn cache(&self) -> &HistoryCache {
        &self.cache
    }

    /// The durable repository.
    #[must_use]
    pub fn repository(&self) -> &MessageRepository {
        &self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn numbered(i: i64) -> Message {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut msg = Message::text(format!("message {i}")).at(base + Duration::seconds(i));
        msg.id = format!("id-{i}");
        msg
    }

    #[test]
    fn save_writes_cache_and_database() {
        let store = MessageStore::in_memory().unwrap();
        store.save(&numbered(1)).unwrap();
        assert_eq!(store.cache().len(), 1);
        assert_eq!(store.repository().count().unwrap(), 1);
    }

    #[test]
    fn recent_prefers_cache() {
        let store = MessageStore::in_memory().unwrap();
        store.repository().save(&numbered(1)).unwrap();
        store.cache().push(&numbered(2)).unwrap();

        let ids: Vec<_> = store.recent(100).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["id-2"]);
    }

    #[test]
    fn empty_cache_falls_back_and_repopulates() {
        let store = MessageStore::in_memory().unwrap();
        for i in 0..5 {
            store.repository().save(&numbered(i)).unwrap();
        }
        assert!(store.cache().is_empty());

        let recent = store.recent(100).unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].id, "id-0");
        assert_eq!(store.cache().len(), 5);
        assert_eq!(store.cache().recent(100).unwrap(), recent);
    }

    #[test]
    fn cache_keeps_latest_hundred_of_hundred_fifty() {
        let store = MessageStore::in_memory().unwrap();
        for i in 0..150 {
            store.save(&numbered(i)).unwrap();
        }
        let recent = store.recent(100).unwrap();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].id, "id-50");
        assert_eq!(recent[99].id, "id-149");
        assert_eq!(store.repository().count().unwrap(), 150);
    }

    #[test]
    fn durable_failure_still_caches() {
        let store = MessageStore::in_memory().unwrap();
        store.save(&numbered(1)).unwrap();
        // Same id again: the insert fails, the cache push does not.
        assert!(store.save(&numbered(1)).is_err());
        assert_eq!(store.cache().len(), 2);
    }

    #[test]
    fn empty_store_returns_empty_history() {
        let store = MessageStore::in_memory().unwrap();
        assert!(store.recent(100).unwrap().is_empty());
    }
}
