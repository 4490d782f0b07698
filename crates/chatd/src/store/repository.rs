use crate::error::StoreError;
use chat_common::{Message, MessageType};
use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const COLUMNS: &str = "id, content, type, user_id, username, created_at";

/// SQL function folding text with Unicode lowercase rules. The built-in
/// `lower` and `LIKE` only fold ASCII.
const FOLD_FN: &str = "fold_case";

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        type TEXT NOT NULL DEFAULT 'text',
        user_id TEXT,
        username TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_created_at ON chat_messages(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_messages_user_id ON chat_messages(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_type ON chat_messages(type)",
];

/// Raw column values of one `chat_messages` row.
struct StoredRow {
    id: String,
    content: String,
    kind: String,
    user_id: Option<String>,
    username: Option<String>,
    created_at: i64,
}

impl StoredRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            kind: row.get(2)?,
            user_id: row.get(3)?,
            username: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_message(self) -> Option<Message> {
        let kind = match self.kind.parse::<MessageType>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(id = %self.id, error = %e, "skipping stored message");
                return None;
            }
        };
        let Some(created_at) = DateTime::<Utc>::from_timestamp_micros(self.created_at) else {
            warn!(id = %self.id, created_at = self.created_at, "skipping stored message with bad timestamp");
            return None;
        };
        Some(Message {
            id: self.id,
            content: self.content,
            kind,
            user_id: self.user_id,
            username: self.username,
            created_at: Some(created_at),
        })
    }
}

/// Durable message storage on SQLite.
///
/// Timestamps are stored as microseconds since the Unix epoch so that
/// ordering and range queries work on the integer column directly.
pub struct MessageRepository {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for MessageRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRepository").finish_non_exhaustive()
    }
}

impl MessageRepository {
    /// Opens (or creates) the database at `path` and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Opens a private in-memory database and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migration fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.create_scalar_function(
            FOLD_FN,
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|text| text.to_lowercase())),
        )?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.migrate()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Creates the message table and its indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        for statement in MIGRATIONS {
            conn.execute(statement, [])?;
        }
        Ok(())
    }

    /// Inserts one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails, including on a duplicate id.
    pub fn save(&self, msg: &Message) -> Result<(), StoreError> {
        let created_at = msg.created_at.unwrap_or_else(Utc::now).timestamp_micros();
        self.conn()?.execute(
            "INSERT INTO chat_messages (id, content, type, user_id, username, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                msg.id,
                msg.content,
                msg.kind.as_str(),
                msg.user_id,
                msg.username,
                created_at
            ],
        )?;
        Ok(())
    }

    /// Returns the newest `limit` messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recent(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        let mut messages = self.query(
            &format!("SELECT {COLUMNS} FROM chat_messages ORDER BY created_at DESC LIMIT ?1"),
            params![to_sql_limit(limit)],
        )?;
        messages.reverse();
        Ok(messages)
    }

    /// Case-insensitive substring search over content, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM chat_messages
                 WHERE {FOLD_FN}(content) LIKE ?1 ESCAPE '\\'
                 ORDER BY created_at DESC LIMIT ?2"
            ),
            params![pattern, to_sql_limit(limit)],
        )
    }

    /// Messages with `start <= created_at < end`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM chat_messages
                 WHERE created_at >= ?1 AND created_at < ?2
                 ORDER BY created_at ASC"
            ),
            params![start.timestamp_micros(), end.timestamp_micros()],
        )
    }

    /// Deletes messages created before `cutoff`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = self.conn()?.execute(
            "DELETE FROM chat_messages WHERE created_at < ?1",
            params![cutoff.timestamp_micros()],
        )?;
        Ok(removed)
    }

    /// Total number of stored messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM chat_messages", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, StoredRow::read)?;

        let mut messages = Vec::new();
        for row in rows {
            match row {
                Ok(row) => messages.extend(row.into_message()),
                Err(e) => debug!(error = %e, "skipping unreadable row"),
            }
        }
        Ok(messages)
    }

    #[cfg(test)]
    fn insert_raw(&self, id: &str, kind: &str, created_at: i64) {
        self.conn()
            .unwrap()
            .execute(
                "INSERT INTO chat_messages (id, content, type, created_at) VALUES (?1, 'raw', ?2, ?3)",
                params![id, kind, created_at],
            )
            .unwrap();
    }
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for ch in query.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
