use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::MemoryStore;
use flowforge_core::types::{ChatMessage, Role};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session
        ON messages(session_id, id);";

/// SQLite-backed session memory for agent nodes.
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
}

/// A stored session and how many messages it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub messages: usize,
    pub last_activity: String,
}

impl SqliteMemoryStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| FlowError::Database(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Memory store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FlowError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| FlowError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All sessions, most recently active first.
    pub fn sessions(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, COUNT(*), MAX(timestamp) FROM messages
                 GROUP BY session_id
                 ORDER BY MAX(id) DESC",
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(SessionSummary {
                    session_id: row.get(0)?,
                    messages: row.get::<_, i64>(1)? as usize,
                    last_activity: row.get(2)?,
                })
            })
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.map_err(|e| FlowError::Database(e.to_string()))?);
        }
        Ok(sessions)
    }

    fn load_window(&self, session_id: &str, window: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;

        // Newest `window` rows, returned oldest first
        let mut stmt = conn
            .prepare(
                "SELECT role, content FROM (
                     SELECT id, role, content FROM messages
                     WHERE session_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2
                 ) ORDER BY id ASC",
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![session_id, window as i64], |row| {
                let role: String = row.get(0)?;
                let content: String = row.get(1)?;
                Ok((role, content))
            })
            .map_err(|e| FlowError::Database(e.to_string()))?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content) = row.map_err(|e| FlowError::Database(e.to_string()))?;
            let role = match role.as_str() {
                "system" => Role::System,
                "assistant" => Role::Assistant,
                _ => Role::User,
            };
            messages.push(ChatMessage { role, content });
        }
        Ok(messages)
    }

    fn append(&self, session_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let tx = conn
            .transaction()
            .map_err(|e| FlowError::Database(e.to_string()))?;
        let timestamp = Utc::now().to_rfc3339();
        for m in messages {
            tx.execute(
                "INSERT INTO messages (session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![session_id, m.role.as_str(), m.content, timestamp],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
        }
        tx.commit().map_err(|e| FlowError::Database(e.to_string()))
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))?;
        let removed = conn
            .execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])
            .map_err(|e| FlowError::Database(e.to_string()))?;
        debug!(session_id, removed, "Cleared session memory");
        Ok(())
    }
}

impl MemoryStore for SqliteMemoryStore {
    fn load(&self, session_id: &str, window: usize) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let sid = session_id.to_string();
        Box::pin(async move { self.load_window(&sid, window) })
    }

    fn save(&self, session_id: &str, messages: &[ChatMessage]) -> BoxFuture<'_, Result<()>> {
        let sid = session_id.to_string();
        let messages = messages.to_vec();
        Box::pin(async move { self.append(&sid, &messages) })
    }

    fn clear(&self, session_id: &str) -> BoxFuture<'_, Result<()>> {
        let sid = session_id.to_string();
        Box::pin(async move { self.delete(&sid) })
    }
}
