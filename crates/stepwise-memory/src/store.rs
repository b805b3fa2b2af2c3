use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::ThreadStore;
use stepwise_core::types::{ThreadId, ThreadSnapshot};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS threads (
        thread_id TEXT PRIMARY KEY,
        step TEXT NOT NULL,
        snapshot TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_threads_updated ON threads(updated_at);";

/// SQLite-backed thread store. One row per thread holding the JSON snapshot.
pub struct SqliteThreadStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StepwiseError {
    StepwiseError::Database(e.to_string())
}

impl SqliteThreadStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepwiseError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets `stepwise threads` read while a REPL is writing.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Thread store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StepwiseError::Database(e.to_string()))
    }
}

impl ThreadStore for SqliteThreadStore {
    fn load(&self, id: &ThreadId) -> BoxFuture<'_, Result<Option<ThreadSnapshot>>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT snapshot FROM threads WHERE thread_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn save(&self, snapshot: &ThreadSnapshot) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(snapshot).map(|json| {
            (
                snapshot.thread_id.0.clone(),
                snapshot.step.clone(),
                json,
                snapshot.created_at.to_rfc3339(),
                snapshot.updated_at.to_rfc3339(),
            )
        });
        Box::pin(async move {
            let (id, step, json, created_at, updated_at) = row?;
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO threads (thread_id, step, snapshot, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(thread_id) DO UPDATE SET
                    step = excluded.step,
                    snapshot = excluded.snapshot,
                    updated_at = excluded.updated_at",
                params![id, step, json, created_at, updated_at],
            )
            .map_err(db_err)?;
            debug!(thread = %id, step = %step, "Thread saved");
            Ok(())
        })
    }

    fn delete(&self, id: &ThreadId) -> BoxFuture<'_, Result<()>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute("DELETE FROM threads WHERE thread_id = ?1", params![id])
                .map_err(db_err)?;
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ThreadId>>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare("SELECT thread_id FROM threads ORDER BY thread_id ASC")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(ThreadId(row.map_err(db_err)?));
            }
            Ok(ids)
        })
    }
}
