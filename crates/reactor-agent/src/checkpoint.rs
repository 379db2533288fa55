//! Checkpointer backends: an in-memory map and a SQLite store.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};

use reactor_core::error::{ReactorError, Result};
use reactor_core::{Checkpoint, Checkpointer, ExecutionState, SessionId};

/// Checkpoints held in memory, sharded by session id.
#[derive(Default)]
pub struct MemoryCheckpointer {
    entries: DashMap<SessionId, Checkpoint>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        self.entries.insert(checkpoint.session_id.clone(), checkpoint);
        Box::pin(async { Ok(()) })
    }

    fn load(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let found = self.entries.get(session_id).map(|cp| cp.value().clone());
        Box::pin(async move { Ok(found) })
    }

    fn exists(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let found = self.entries.contains_key(session_id);
        Box::pin(async move { Ok(found) })
    }

    fn delete(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let removed = self.entries.remove(session_id).is_some();
        Box::pin(async move { Ok(removed) })
    }
}

/// Durable checkpoint store backed by SQLite. One row per session.
pub struct SqliteCheckpointer {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointer {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| {
            ReactorError::Checkpoint(format!("Failed to open checkpoint store: {}", e))
        })?;
        Self::init(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            ReactorError::Checkpoint(format!("Failed to open checkpoint store: {}", e))
        })?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 session_id TEXT PRIMARY KEY,
                 state_json TEXT NOT NULL,
                 pending_node TEXT,
                 cursor TEXT,
                 step INTEGER NOT NULL DEFAULT 0,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|e| {
            ReactorError::Checkpoint(format!("Failed to initialize checkpoint schema: {}", e))
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Session ids with a stored checkpoint, most recently updated first.
    pub fn sessions(&self) -> Result<Vec<SessionId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT session_id FROM checkpoints ORDER BY updated_at DESC")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        let ids = rows
            .map(|r| r.map(SessionId).map_err(sql_err))
            .collect::<Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ReactorError::Checkpoint(e.to_string()))
    }

    fn save_sync(&self, cp: &Checkpoint) -> Result<()> {
        let state_json = serde_json::to_string(&cp.state)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (session_id, state_json, pending_node, cursor, step, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id) DO UPDATE SET
                 state_json = excluded.state_json,
                 pending_node = excluded.pending_node,
                 cursor = excluded.cursor,
                 step = excluded.step,
                 updated_at = excluded.updated_at",
            params![
                cp.session_id.as_str(),
                state_json,
                cp.pending_node,
                cp.cursor,
                cp.step as i64,
                cp.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| ReactorError::Checkpoint(format!("Failed to save checkpoint: {}", e)))?;
        Ok(())
    }

    fn load_sync(&self, session_id: &SessionId) -> Result<Option<Checkpoint>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT state_json, pending_node, cursor, step, updated_at
                 FROM checkpoints WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;

        let Some((state_json, pending_node, cursor, step, ts)) = row else {
            return Ok(None);
        };
        let state: ExecutionState = serde_json::from_str(&state_json).map_err(|e| {
            ReactorError::Checkpoint(format!("Corrupt checkpoint for {}: {}", session_id, e))
        })?;
        Ok(Some(Checkpoint {
            session_id: session_id.clone(),
            state,
            pending_node,
            cursor,
            step: step as u64,
            updated_at: DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    fn exists_sync(&self, session_id: &SessionId) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count > 0)
    }

    fn delete_sync(&self, session_id: &SessionId) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM checkpoints WHERE session_id = ?1",
                params![session_id.as_str()],
            )
            .map_err(|e| ReactorError::Checkpoint(format!("Failed to delete checkpoint: {}", e)))?;
        Ok(deleted > 0)
    }
}

fn sql_err(e: rusqlite::Error) -> ReactorError {
    ReactorError::Checkpoint(e.to_string())
}

impl Checkpointer for SqliteCheckpointer {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.save_sync(&checkpoint) })
    }

    fn load(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let session_id = session_id.clone();
        Box::pin(async move { self.load_sync(&session_id) })
    }

    fn exists(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let session_id = session_id.clone();
        Box::pin(async move { self.exists_sync(&session_id) })
    }

    fn delete(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let session_id = session_id.clone();
        Box::pin(async move { self.delete_sync(&session_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_core::ChatMessage;

    fn sample(id: &str) -> Checkpoint {
        let mut state = ExecutionState::for_task("deploy");
        state.messages.push(ChatMessage::assistant("planning"));
        state.extensions.insert("commands".into(), serde_json::json!(["ls"]));
        let mut cp = Checkpoint::new(SessionId::from_string(id), state);
        cp.pending_node = Some("request_approval".into());
        cp.cursor = Some("request_approval".into());
        cp.step = 3;
        cp
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryCheckpointer::new();
        let cp = sample("s1");
        store.save(cp.clone()).await.unwrap();

        assert!(store.exists(&cp.session_id).await.unwrap());
        assert_eq!(store.load(&cp.session_id).await.unwrap(), Some(cp.clone()));
        assert!(store.delete(&cp.session_id).await.unwrap());
        assert!(!store.delete(&cp.session_id).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_missing_session() {
        let store = MemoryCheckpointer::new();
        let sid = SessionId::from_string("nope");
        assert!(store.load(&sid).await.unwrap().is_none());
        assert!(!store.exists(&sid).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointer::open(&dir.path().join("nested/cp.db")).unwrap();

        let cp = sample("s1");
        store.save(cp.clone()).await.unwrap();
        let loaded = store.load(&cp.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, cp.state);
        assert_eq!(loaded.pending_node.as_deref(), Some("request_approval"));
        assert_eq!(loaded.step, 3);

        let mut next = cp.clone();
        next.pending_node = None;
        next.cursor = None;
        next.step = 4;
        store.save(next).await.unwrap();
        let loaded = store.load(&cp.session_id).await.unwrap().unwrap();
        assert!(loaded.is_terminal());
        assert_eq!(loaded.step, 4);
        assert_eq!(store.sessions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.db");
        {
            let store = SqliteCheckpointer::open(&path).unwrap();
            store.save(sample("durable")).await.unwrap();
        }
        let store = SqliteCheckpointer::open(&path).unwrap();
        let sid = SessionId::from_string("durable");
        assert!(store.exists(&sid).await.unwrap());
        assert_eq!(
            store.load(&sid).await.unwrap().unwrap().state.user_input,
            "deploy"
        );
        assert!(store.delete(&sid).await.unwrap());
        assert!(store.load(&sid).await.unwrap().is_none());
    }
}
