//! Bucketed key-value stores for archived job snapshots.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

use rusqlite::{Connection, OptionalExtension, params};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("snapshot store lock poisoned")]
    Poisoned,
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// String values under `(bucket, key)`.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, bucket: &str, key: &str) -> SnapshotResult<Option<String>>;

    /// Insert or overwrite.
    fn put(&self, bucket: &str, key: &str, value: &str) -> SnapshotResult<()>;

    /// Deleting an absent key is not an error.
    fn delete(&self, bucket: &str, key: &str) -> SnapshotResult<()>;

    fn count(&self, bucket: &str) -> SnapshotResult<u64>;

    /// Drop every key of `bucket`.
    fn clear(&self, bucket: &str) -> SnapshotResult<()>;
}

/// In-memory snapshot store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    buckets: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn get(&self, bucket: &str, key: &str) -> SnapshotResult<Option<String>> {
        let buckets = self.buckets.read().map_err(|_| SnapshotError::Poisoned)?;
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    fn put(&self, bucket: &str, key: &str, value: &str) -> SnapshotResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| SnapshotError::Poisoned)?;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> SnapshotResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| SnapshotError::Poisoned)?;
        if let Some(b) = buckets.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn count(&self, bucket: &str) -> SnapshotResult<u64> {
        let buckets = self.buckets.read().map_err(|_| SnapshotError::Poisoned)?;
        Ok(buckets.get(bucket).map_or(0, |b| b.len() as u64))
    }

    fn clear(&self, bucket: &str) -> SnapshotResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| SnapshotError::Poisoned)?;
        buckets.remove(bucket);
        Ok(())
    }
}

/// Single-file SQLite snapshot store.
#[derive(Debug)]
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> SnapshotResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> SnapshotResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SnapshotResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS snapshots (
              bucket TEXT NOT NULL,
              key TEXT NOT NULL,
              value TEXT NOT NULL,
              PRIMARY KEY (bucket, key)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> SnapshotResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SnapshotError::Poisoned)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn get(&self, bucket: &str, key: &str) -> SnapshotResult<Option<String>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT value FROM snapshots WHERE bucket=?1 AND key=?2",
                params![bucket, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    fn put(&self, bucket: &str, key: &str, value: &str) -> SnapshotResult<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO snapshots(bucket, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(bucket, key) DO UPDATE SET value=excluded.value
            "#,
            params![bucket, key, value],
        )?;
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> SnapshotResult<()> {
        self.conn()?.execute(
            "DELETE FROM snapshots WHERE bucket=?1 AND key=?2",
            params![bucket, key],
        )?;
        Ok(())
    }

    fn count(&self, bucket: &str) -> SnapshotResult<u64> {
        let n = self.conn()?.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE bucket=?1",
            params![bucket],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn clear(&self, bucket: &str) -> SnapshotResult<()> {
        self.conn()?
            .execute("DELETE FROM snapshots WHERE bucket=?1", params![bucket])?;
        Ok(())
    }
}
