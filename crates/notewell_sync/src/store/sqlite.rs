//! SQLite-backed storage implementation.
//!
//! Persists document snapshots, the offline update log, and the mutation
//! queue table to a single SQLite database. This is the native backend;
//! browser builds plug in an embedded-store adapter behind the same
//! [`LocalStore`] trait.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use super::LocalStore;
use crate::error::{Result, SyncError};
use crate::types::QueueItem;

/// SQLite-backed local store.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    ///
    /// Creates the necessary tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the store is dropped.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Per-note CRDT snapshots (full serialized state)
            CREATE TABLE IF NOT EXISTS documents (
                note_id TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Document updates captured while offline, merge-replayed on reconnect
            CREATE TABLE IF NOT EXISTS offline_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                note_id TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_offline_updates_note ON offline_updates(note_id, id);

            -- Offline mutation queue; column names are part of the
            -- cross-platform schema and must match the remote sync_queue table
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                identity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sync_queue_identity ON sync_queue(identity_id);
            "#,
        )?;
        Ok(())
    }

    fn row_to_queue_item(row: &Row<'_>) -> rusqlite::Result<RawQueueItem> {
        Ok(RawQueueItem {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            operation: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            retry_count: row.get(6)?,
            error: row.get(7)?,
        })
    }
}

/// Queue row as stored, before parsing the typed columns.
struct RawQueueItem {
    id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    created_at: String,
    retry_count: u32,
    error: Option<String>,
}

impl RawQueueItem {
    fn parse(self) -> Result<QueueItem> {
        Ok(QueueItem {
            id: parse_uuid(&self.id)?,
            entity: self
                .entity_type
                .parse()
                .map_err(SyncError::Storage)?,
            entity_id: parse_uuid(&self.entity_id)?,
            operation: self.operation.parse().map_err(SyncError::Storage)?,
            payload: serde_json::from_str(&self.payload)?,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map_err(|e| SyncError::Storage(format!("Invalid created_at: {}", e)))?
                .with_timezone(&Utc),
            retry_count: self.retry_count,
            error: self.error,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| SyncError::Storage(format!("Invalid uuid '{}': {}", s, e)))
}

impl LocalStore for SqliteStore {
    fn load_doc(&self, note_id: Uuid) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE note_id = ?",
                params![note_id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(state)
    }

    fn save_doc(&self, note_id: Uuid, state: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO documents (note_id, state, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(note_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![
                note_id.to_string(),
                state,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn delete_doc(&self, note_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM documents WHERE note_id = ?",
            params![note_id.to_string()],
        )?;
        conn.execute(
            "DELETE FROM offline_updates WHERE note_id = ?",
            params![note_id.to_string()],
        )?;
        Ok(())
    }

    fn append_offline_update(&self, note_id: Uuid, update: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO offline_updates (note_id, data, created_at) VALUES (?, ?, ?)",
            params![
                note_id.to_string(),
                update,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn take_offline_updates(&self, note_id: Uuid) -> Result<Vec<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT data FROM offline_updates WHERE note_id = ? ORDER BY id")?;
        let updates = stmt
            .query_map(params![note_id.to_string()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
        drop(stmt);

        conn.execute(
            "DELETE FROM offline_updates WHERE note_id = ?",
            params![note_id.to_string()],
        )?;
        Ok(updates)
    }

    fn offline_update_count(&self, note_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM offline_updates WHERE note_id = ?",
            params![note_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn insert_queue_item(&self, identity: Uuid, item: &QueueItem) -> Result<()> {
        let payload = serde_json::to_string(&item.payload)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_queue
                (id, identity_id, entity_type, entity_id, operation, payload, created_at, retry_count, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                item.id.to_string(),
                identity.to_string(),
                item.entity.to_string(),
                item.entity_id.to_string(),
                item.operation.to_string(),
                payload,
                item.created_at.to_rfc3339(),
                item.retry_count,
                item.error,
            ],
        )?;
        Ok(())
    }

    fn list_queue_items(&self, identity: Uuid) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, operation, payload, created_at, retry_count, error
             FROM sync_queue WHERE identity_id = ? ORDER BY rowid",
        )?;
        let raw = stmt
            .query_map(params![identity.to_string()], Self::row_to_queue_item)?
            .collect::<rusqlite::Result<Vec<RawQueueItem>>>()?;

        raw.into_iter().map(RawQueueItem::parse).collect()
    }

    fn update_queue_item(&self, id: Uuid, retry_count: u32, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_queue SET retry_count = ?, error = ? WHERE id = ?",
            params![retry_count, error, id.to_string()],
        )?;
        Ok(())
    }

    fn delete_queue_item(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sync_queue WHERE id = ?",
            params![id.to_string()],
        )?;
        Ok(())
    }

    fn clear_queue_items(&self, identity: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sync_queue WHERE identity_id = ?",
            params![identity.to_string()],
        )?;
        Ok(())
    }

    fn queue_len(&self, identity: Uuid) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE identity_id = ?",
            params![identity.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}
