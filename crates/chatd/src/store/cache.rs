use crate::error::StoreError;
use chat_common::Message;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

/// Capped list of recently broadcast messages, newest first.
///
/// Records are kept JSON-encoded so a corrupt entry only affects itself:
/// reads skip anything that fails to decode.
#[derive(Debug)]
pub struct HistoryCache {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl HistoryCache {
    /// Creates an empty cache holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Pushes `msg` as the newest record and trims to capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or the lock is poisoned.
    pub fn push(&self, msg: &Message) -> Result<(), StoreError> {
        let record = serde_json::to_string(msg)?;
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.push_front(record);
        entries.truncate(self.capacity);
        Ok(())
    }

    /// Returns up to `limit` of the newest records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let take = limit.min(self.capacity).min(entries.len());
        let mut messages = Vec::with_capacity(take);
        for record in entries.iter().take(take).rev() {
            match serde_json::from_str::<Message>(record) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(error = %e, "skipping undecodable cache record"),
            }
        }
        Ok(messages)
    }

    /// Replaces the whole cache with `messages`, given oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn populate(&self, messages: &[Message]) -> Result<(), StoreError> {
        let mut records = VecDeque::with_capacity(self.capacity);
        for msg in messages.iter().rev().take(self.capacity) {
            match serde_json::to_string(msg) {
                Ok(record) => records.push_back(record),
                Err(e) => warn!(error = %e, id = %msg.id, "skipping unencodable message"),
            }
        }
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        *entries = records;
        Ok(())
    }

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .clear();
        Ok(())
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns `true` if the cache holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn push_raw(&self, record: &str) {
        self.entries.lock().unwrap().push_front(record.to_string());
    }
}
