//! Durable key-value store over a local libSQL database

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{KeyValueStore, WriteBatch, WriteOp};
use crate::db::Database;
use crate::error::Result;

/// Thread-safe store backed by the `kv` table.
#[derive(Clone)]
pub struct LibSqlStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LibSqlStore {
    /// Open (or create) the store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let db = Database::open(&db_path).await?;
        tracing::info!("Opened sync store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing database file, if any.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

impl KeyValueStore for LibSqlStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query("SELECT value FROM kv WHERE key = ?1", libsql::params![key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<Vec<u8>>(0)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                libsql::params![key, value.to_vec()],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute("DELETE FROM kv WHERE key = ?1", libsql::params![key])
            .await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_len = i64::try_from(prefix.chars().count()).unwrap_or(i64::MAX);
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT key FROM kv WHERE substr(key, 1, ?2) = ?1 ORDER BY key ASC",
                libsql::params![prefix, prefix_len],
            )
            .await?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await? {
            keys.push(row.get::<String>(0)?);
        }
        Ok(keys)
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN IMMEDIATE", ()).await?;

        for op in batch.into_ops() {
            let applied = match op {
                WriteOp::Put { key, value } => {
                    conn.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        libsql::params![key, value],
                    )
                    .await
                }
                WriteOp::Delete { key } => {
                    conn.execute("DELETE FROM kv WHERE key = ?1", libsql::params![key])
                        .await
                }
            };
            if let Err(e) = applied {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
        }

        if let Err(e) = conn.execute("COMMIT", ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        Ok(())
    }
}
