//! SQLite storage for decrypted messages and conversation summaries.
//!
//! Two tables:
//!
//! - `messages`, keyed by the wrap id of the event a message arrived in (or,
//!   for locally sent messages, the id of the self-addressed copy). Saving the
//!   same wrap twice is a no-op.
//! - `conversations`, one summary row per partner, updated in the same
//!   transaction as the message insert.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Conversation previews are cut to this many characters.
pub const PREVIEW_CHARS: usize = 100;

/// Unread count written by [`ConversationStore::mark_all_as_unread`].
pub const UNREAD_SENTINEL: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// The connection mutex was poisoned by a panicking writer.
    Poisoned,
    InvalidFormat(String),
    /// A timestamp that does not fit the database's signed integer column.
    TimestampOutOfRange(u64),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::Poisoned => write!(f, "storage lock poisoned"),
            StorageError::InvalidFormat(v) => write!(f, "unknown message format: {v}"),
            StorageError::TimestampOutOfRange(t) => write!(f, "timestamp {t} out of range"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Which envelope a message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Layered,
    Legacy,
}

impl MessageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageFormat::Layered => "layered",
            MessageFormat::Legacy => "legacy",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "layered" => Ok(MessageFormat::Layered),
            "legacy" => Ok(MessageFormat::Legacy),
            other => Err(StorageError::InvalidFormat(other.to_string())),
        }
    }
}

/// A decrypted direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Rumor id (or legacy event id).
    pub id: String,
    /// Author of the message.
    pub pubkey: String,
    pub content: String,
    /// Real send time from the rumor.
    pub created_at: u64,
    /// The other party, whichever direction the message went.
    pub conversation_with: String,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    pub is_mine: bool,
    pub wrap_id: String,
    pub format: MessageFormat,
}

/// Summary row for one partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub partner: String,
    pub last_message_at: u64,
    pub last_message_preview: String,
    pub unread_count: u32,
    pub subject: Option<String>,
}

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

/// Read a non-negative integer column as `T`.
fn column<T: TryFrom<i64>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let value: i64 = row.get(idx)?;
    T::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Message, String)> {
    let format: String = row.get(9)?;
    Ok((
        Message {
            id: row.get(0)?,
            pubkey: row.get(1)?,
            content: row.get(2)?,
            created_at: column(row, 3)?,
            conversation_with: row.get(4)?,
            reply_to: row.get(5)?,
            subject: row.get(6)?,
            is_mine: row.get::<_, i32>(7)? != 0,
            wrap_id: row.get(8)?,
            format: MessageFormat::Layered,
        },
        format,
    ))
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        partner: row.get(0)?,
        last_message_at: column(row, 1)?,
        last_message_preview: row.get(2)?,
        unread_count: column(row, 3)?,
        subject: row.get(4)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, pubkey, content, created_at, conversation_with,
    reply_to, subject, is_mine, wrap_id, format";

const CONVERSATION_COLUMNS: &str =
    "partner, last_message_at, last_message_preview, unread_count, subject";

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// The message and conversation store.
///
/// The connection sits behind a mutex so the store can be shared between the
/// sync pump and request handlers; every write holds the lock for exactly one
/// transaction.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                wrap_id           TEXT PRIMARY KEY,
                id                TEXT NOT NULL,
                pubkey            TEXT NOT NULL,
                content           TEXT NOT NULL,
                created_at        INTEGER NOT NULL,
                conversation_with TEXT NOT NULL,
                reply_to          TEXT,
                subject           TEXT,
                is_mine           INTEGER NOT NULL DEFAULT 0,
                format            TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_with, created_at);

            CREATE TABLE IF NOT EXISTS conversations (
                partner              TEXT PRIMARY KEY,
                last_message_at      INTEGER NOT NULL,
                last_message_preview TEXT NOT NULL,
                unread_count         INTEGER NOT NULL DEFAULT 0,
                subject              TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_last_message
                ON conversations(last_message_at);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Store a message and fold it into its conversation summary.
    ///
    /// Returns `false` when a message with the same wrap id already exists, in
    /// which case nothing changes.
    pub fn save_message(&self, msg: &Message) -> Result<bool, StorageError> {
        let created_at = i64::try_from(msg.created_at)
            .map_err(|_| StorageError::TimestampOutOfRange(msg.created_at))?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO messages
             (wrap_id, id, pubkey, content, created_at, conversation_with,
              reply_to, subject, is_mine, format)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                msg.wrap_id,
                msg.id,
                msg.pubkey,
                msg.content,
                created_at,
                msg.conversation_with,
                msg.reply_to,
                msg.subject,
                msg.is_mine as i32,
                msg.format.as_str(),
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        let unread_increment: i64 = if msg.is_mine { 0 } else { 1 };
        tx.execute(
            "INSERT INTO conversations
             (partner, last_message_at, last_message_preview, unread_count, subject)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(partner) DO UPDATE SET
                last_message_preview = CASE WHEN excluded.last_message_at > last_message_at
                    THEN excluded.last_message_preview ELSE last_message_preview END,
                subject = CASE WHEN excluded.last_message_at > last_message_at
                                AND excluded.subject IS NOT NULL
                    THEN excluded.subject ELSE subject END,
                last_message_at = MAX(last_message_at, excluded.last_message_at),
                unread_count = MIN(unread_count + excluded.unread_count, 4294967295)",
            params![
                msg.conversation_with,
                created_at,
                preview(&msg.content),
                unread_increment,
                msg.subject,
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// The most recent `limit` messages with `partner`, oldest first.
    ///
    /// With `before`, only messages strictly older than that time are
    /// considered.
    pub fn get_messages(
        &self,
        partner: &str,
        limit: u32,
        before: Option<u64>,
    ) -> Result<Vec<Message>, StorageError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_with = ?1 AND created_at < ?2
             ORDER BY created_at DESC, wrap_id DESC
             LIMIT ?3"
        );
        let before = before
            .and_then(|b| i64::try_from(b).ok())
            .unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![partner, before, limit as i64], message_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            let (mut message, format) = row?;
            message.format = MessageFormat::parse(&format)?;
            result.push(message);
        }
        result.reverse();
        Ok(result)
    }

    pub fn has_message(&self, wrap_id: &str) -> Result<bool, StorageError> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM messages WHERE wrap_id = ?1",
            params![wrap_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Conversations by most recent message first.
    pub fn get_conversations(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<Conversation>, StorageError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             ORDER BY last_message_at DESC, partner ASC
             LIMIT ?1 OFFSET ?2"
        );
        let limit = limit.map(i64::from).unwrap_or(-1);
        let offset = offset.map(i64::from).unwrap_or(0);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit, offset], conversation_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn get_conversation(&self, partner: &str) -> Result<Option<Conversation>, StorageError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE partner = ?1");
        let row = conn
            .query_row(&sql, params![partner], conversation_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn mark_as_read(&self, partner: &str) -> Result<bool, StorageError> {
        let affected = self.lock()?.execute(
            "UPDATE conversations SET unread_count = 0 WHERE partner = ?1",
            params![partner],
        )?;
        Ok(affected > 0)
    }

    pub fn mark_all_as_read(&self) -> Result<u32, StorageError> {
        let affected = self.lock()?.execute(
            "UPDATE conversations SET unread_count = 0 WHERE unread_count != 0",
            [],
        )?;
        Ok(u32::try_from(affected).unwrap_or(u32::MAX))
    }

    /// Flag every read conversation as unread again.
    ///
    /// Conversations that already have unread messages keep their count; the
    /// others get [`UNREAD_SENTINEL`], not a recomputed count.
    pub fn mark_all_as_unread(&self) -> Result<u32, StorageError> {
        let affected = self.lock()?.execute(
            "UPDATE conversations SET unread_count = ?1 WHERE unread_count = 0",
            params![UNREAD_SENTINEL as i64],
        )?;
        Ok(u32::try_from(affected).unwrap_or(u32::MAX))
    }

    /// Delete every message and conversation.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages", [])?;
        tx.execute("DELETE FROM conversations", [])?;
        tx.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Default database path inside a data directory.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("sealpost.db")
}

/// Resolve the sealpost home directory from environment or default.
pub fn resolve_data_dir() -> PathBuf {
    std::env::var("SEALPOST_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_default().join(".sealpost"))
}

fn dirs_or_default() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
