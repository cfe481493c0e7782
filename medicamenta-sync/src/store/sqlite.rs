//! Local SQLite persistence for offline-first operation
//!
//! Provides:
//! - A shared connection pool with WAL and secure deletion
//! - One table per record kind with indexed status/collection/document columns
//! - JSON bodies so record schemas can evolve without migrations
//!
//! The queue and conflict registry keep their state in memory and write
//! through, so a database file belongs to one engine at a time. Opening
//! takes an exclusive lock on `<db_path>.lock`; a second open fails with
//! [`SyncError::DatabaseLocked`] until the first engine shuts down.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use super::{IndexField, RecordStore, StoredRecord};
use crate::error::{SyncError, SyncResult};

/// Configuration for the local database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Whether to enable secure deletion (overwrites freed pages).
    /// Cleared queue items may carry PHI.
    pub enable_secure_delete: bool,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("medicamenta_sync.db"),
            max_connections: 5,
            enable_wal: true,
            enable_secure_delete: true,
        }
    }
}

impl SqliteStoreConfig {
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}

/// Local database handle, shared by all record stores
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
    // Held for the lifetime of the handle; closing the file releases it
    _lock: Arc<File>,
}

impl SqliteDatabase {
    /// Open (creating if needed) the database file.
    ///
    /// Fails with [`SyncError::DatabaseLocked`] while another engine holds
    /// the file.
    pub async fn open(config: &SqliteStoreConfig) -> SyncResult<Self> {
        let lock = acquire_lock(&config.db_path)?;

        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .foreign_keys(true);

        // secure_delete is a per-connection pragma
        let secure_delete = config.enable_secure_delete;
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if secure_delete {
                        sqlx::query("PRAGMA secure_delete = ON")
                            .execute(&mut *conn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        tracing::debug!(db_path = %config.db_path.display(), "Opened local sync database");

        Ok(Self {
            pool,
            _lock: Arc::new(lock),
        })
    }

    /// Typed store for one record kind, creating its table on first use
    pub async fn store<R: StoredRecord>(&self) -> SyncResult<SqliteStore<R>> {
        SqliteStore::create(self.pool.clone()).await
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reclaim space freed by cleared records. Worth running after
    /// `clear_completed` on large queues.
    pub async fn vacuum(&self) -> SyncResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut path = db_path.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

fn acquire_lock(db_path: &Path) -> SyncResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(db_path))?;

    // Non-blocking: a running app must not stall the admin CLI
    file.try_lock_exclusive().map_err(|err| {
        tracing::warn!(db_path = %db_path.display(), error = %err, "Sync database is locked");
        SyncError::DatabaseLocked(db_path.display().to_string())
    })?;

    Ok(file)
}

pub struct SqliteStore<R> {
    pool: SqlitePool,
    table: &'static str,
    _kind: PhantomData<fn() -> R>,
}

impl<R: StoredRecord> SqliteStore<R> {
    async fn create(pool: SqlitePool) -> SyncResult<Self> {
        let table = R::KIND;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                status TEXT,
                collection TEXT,
                document_key TEXT,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#
        ))
        .execute(&pool)
        .await?;

        for field in [IndexField::Status, IndexField::Collection, IndexField::DocumentKey] {
            let column = field.column();
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table}({column})"
            ))
            .execute(&pool)
            .await?;
        }

        Ok(Self {
            pool,
            table,
            _kind: PhantomData,
        })
    }

    fn decode_rows(rows: &[sqlx::sqlite::SqliteRow]) -> SyncResult<Vec<R>> {
        rows.iter()
            .map(|row| -> SyncResult<R> {
                let body: String = row.try_get("body")?;
                Ok(serde_json::from_str(&body)?)
            })
            .collect()
    }
}

#[async_trait]
impl<R: StoredRecord> RecordStore<R> for SqliteStore<R> {
    async fn put(&self, record: &R) -> SyncResult<()> {
        let body = serde_json::to_string(record)?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, status, collection, document_key, body, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                collection = excluded.collection,
                document_key = excluded.document_key,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            self.table
        ))
        .bind(record.record_id().to_string())
        .bind(record.index_value(IndexField::Status))
        .bind(record.index_value(IndexField::Collection))
        .bind(record.index_value(IndexField::DocumentKey))
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> SyncResult<Option<R>> {
        let row = sqlx::query(&format!("SELECT body FROM {} WHERE id = ?", self.table))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> SyncResult<Vec<R>> {
        let rows = sqlx::query(&format!("SELECT body FROM {}", self.table))
            .fetch_all(&self.pool)
            .await?;

        Self::decode_rows(&rows)
    }

    async fn get_by_index(&self, field: IndexField, value: &str) -> SyncResult<Vec<R>> {
        let rows = sqlx::query(&format!(
            "SELECT body FROM {} WHERE {} = ?",
            self.table,
            field.column()
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        Self::decode_rows(&rows)
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> SyncResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let statement = format!("DELETE FROM {} WHERE id = ?", self.table);
        let mut tx = self.pool.begin().await?;
        let mut removed: u64 = 0;
        for id in ids {
            let result = sqlx::query(&statement)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            removed = removed.saturating_add(result.rows_affected());
        }
        tx.commit().await?;

        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }
}
