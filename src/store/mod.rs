//! SQLite storage for vector records and the persisted index (sqlx async
//! with sync wrappers)
//!
//! Provides sync methods that internally use a tokio runtime to execute
//! async sqlx operations. Callers use the Store synchronously while
//! benefiting from sqlx's pooling and prepared-statement cache.
//!
//! ## Module Structure
//!
//! - `helpers` - Record types and embedding byte conversion
//! - `records` - Vector record CRUD, batched ingest, scans
//! - `migrations` - Forward-only schema upgrades

mod migrations;
mod records;

/// Helper types and embedding conversion functions.
pub(crate) mod helpers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::runtime::Runtime;

pub use helpers::{
    MetadataFilter, RecordMeta, StoreError, StoredRecord, VectorRecord, CURRENT_SCHEMA_VERSION,
};
pub use records::ScoredId;

use crate::config::DbOptions;
use crate::metric::DistanceMetric;

/// Thread-safe SQLite store for vector records, index state, and the
/// cognitive tables.
///
/// Uses sqlx connection pooling for concurrent reads and WAL mode for
/// crash safety. All methods are synchronous but internally use an async
/// runtime to execute sqlx operations.
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) rt: Runtime,
    /// Embedding dimension fixed at init, validated on every ingest.
    dimension: usize,
    /// Distance metric recorded at init.
    metric: DistanceMetric,
    /// Transient-error retry budget.
    io_retries: u32,
    /// Whether close() has already been called (skip WAL checkpoint in Drop)
    closed: AtomicBool,
}

impl Store {
    /// Open or create a database per the given options.
    ///
    /// Applies pragmas, creates the schema on first open, migrates forward
    /// when the stored schema version is older, and validates that the
    /// stored dimension/metric agree with the options.
    pub fn open(options: &DbOptions) -> Result<Self, StoreError> {
        let rt = Runtime::new().map_err(|e| StoreError::Runtime(e.to_string()))?;

        let in_memory = options.path == ":memory:";
        let connect = if in_memory {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            // Forward slashes for URL compatibility (Windows backslashes don't work)
            let path_str = options.path.replace('\\', "/");
            SqliteConnectOptions::new()
                .filename(&path_str)
                .create_if_missing(true)
        };

        let journal = if in_memory {
            "MEMORY"
        } else if options.wal {
            "WAL"
        } else {
            "DELETE"
        };
        // PRAGMA cache_size takes negative KiB
        let cache_size = -(options.cache_size_kib as i64);
        let mmap_size = options.mmap_size_bytes;

        let pool = rt.block_on(async {
            SqlitePoolOptions::new()
                // In-memory databases are per-connection; a pool pinned to
                // one live connection keeps every caller on the same
                // database (an idle-closed connection would drop the data).
                .max_connections(if in_memory { 1 } else { 4 })
                .min_connections(if in_memory { 1 } else { 0 })
                .idle_timeout(if in_memory {
                    None
                } else {
                    Some(Duration::from_secs(300))
                })
                .after_connect(move |conn, _meta| {
                    let journal = journal.to_string();
                    Box::pin(async move {
                        sqlx::query(&format!("PRAGMA journal_mode = {journal}"))
                            .execute(&mut *conn)
                            .await?;
                        // 5000ms busy timeout before SQLITE_BUSY
                        sqlx::query("PRAGMA busy_timeout = 5000")
                            .execute(&mut *conn)
                            .await?;
                        // NORMAL sync: fsync on WAL checkpoint only (safe with WAL)
                        sqlx::query("PRAGMA synchronous = NORMAL")
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query(&format!("PRAGMA cache_size = {cache_size}"))
                            .execute(&mut *conn)
                            .await?;
                        // Keep temp tables in memory
                        sqlx::query("PRAGMA temp_store = MEMORY")
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query(&format!("PRAGMA mmap_size = {mmap_size}"))
                            .execute(&mut *conn)
                            .await?;
                        Ok(())
                    })
                })
                .connect_with(connect)
                .await
        })?;

        let store = Self {
            pool,
            rt,
            dimension: options.dimension,
            metric: options.metric,
            io_retries: options.io_retries,
            closed: AtomicBool::new(false),
        };

        tracing::info!(path = %options.path, dimension = options.dimension, "Database connected");

        store.init_schema()?;
        store.check_schema_version()?;
        store.check_stored_config(options)?;

        Ok(store)
    }

    /// Embedding dimension fixed for this database.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Distance metric recorded at init.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Create tables and seed the metadata rows on first open.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.rt.block_on(async {
            // Create tables - execute each statement separately
            let schema = include_str!("../schema.sql");
            for statement in schema.split(';') {
                let stmt: String = statement
                    .lines()
                    .skip_while(|line| {
                        let trimmed = line.trim();
                        trimmed.is_empty() || trimmed.starts_with("--")
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                sqlx::query(stmt).execute(&self.pool).await?;
            }

            // Seed metadata only on first open
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'schema_version'")
                    .fetch_optional(&self.pool)
                    .await?;
            if existing.is_none() {
                let now = chrono::Utc::now().to_rfc3339();
                for (key, value) in [
                    ("schema_version", CURRENT_SCHEMA_VERSION.to_string()),
                    ("dimension", self.dimension.to_string()),
                    ("metric", self.metric.to_string()),
                    ("created_at", now),
                    ("agentdb_version", env!("CARGO_PKG_VERSION").to_string()),
                ] {
                    sqlx::query("INSERT INTO metadata (key, value) VALUES (?1, ?2)")
                        .bind(key)
                        .bind(value)
                        .execute(&self.pool)
                        .await?;
                }
                tracing::info!(
                    schema_version = CURRENT_SCHEMA_VERSION,
                    "Schema initialized"
                );
            }
            Ok(())
        })
    }

    fn check_schema_version(&self) -> Result<(), StoreError> {
        self.rt.block_on(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'schema_version'")
                    .fetch_optional(&self.pool)
                    .await?;

            let version: i32 = row
                .and_then(|(s,)| {
                    s.parse()
                        .map_err(|e| {
                            tracing::warn!(
                                stored_value = %s,
                                error = %e,
                                "Failed to parse schema_version, defaulting to 0"
                            );
                        })
                        .ok()
                })
                .unwrap_or(0);

            if version > CURRENT_SCHEMA_VERSION {
                return Err(StoreError::SchemaNewerThanSupported {
                    found: version,
                    supported: CURRENT_SCHEMA_VERSION,
                });
            }
            if version < CURRENT_SCHEMA_VERSION && version > 0 {
                migrations::migrate(&self.pool, version, CURRENT_SCHEMA_VERSION).await?;
                tracing::info!(
                    from = version,
                    to = CURRENT_SCHEMA_VERSION,
                    "Schema migrated successfully"
                );
            }
            Ok(())
        })
    }

    /// An existing database fixes dimension and metric; reopening with
    /// different options is an error, not a silent reconfiguration.
    fn check_stored_config(&self, options: &DbOptions) -> Result<(), StoreError> {
        self.rt.block_on(async {
            let dim_row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'dimension'")
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((dim_str,)) = dim_row {
                if let Ok(stored_dim) = dim_str.parse::<usize>() {
                    if stored_dim != options.dimension {
                        return Err(StoreError::DimensionMismatch {
                            expected: stored_dim,
                            actual: options.dimension,
                        });
                    }
                }
            }

            let metric_row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'metric'")
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((stored,)) = metric_row {
                if stored != options.metric.to_string() {
                    return Err(StoreError::Runtime(format!(
                        "database was created with metric '{stored}', reopened with '{}'",
                        options.metric
                    )));
                }
            }
            Ok(())
        })
    }

    /// Retrieve a single metadata value by key.
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.rt.block_on(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = ?1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(v,)| v))
        })
    }

    /// Read a key from `hnsw_meta`.
    pub(crate) fn get_index_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.rt.block_on(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM hnsw_meta WHERE key = ?1")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(v,)| v))
        })
    }

    /// Upsert a key into `hnsw_meta`.
    pub(crate) fn put_index_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.rt.block_on(async {
            sqlx::query("INSERT OR REPLACE INTO hnsw_meta (key, value) VALUES (?1, ?2)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    /// Run `f` inside a single transaction. All effects are visible only
    /// on commit; any error rolls the whole unit of work back.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T, StoreError>,
    {
        let tx = self.rt.block_on(self.pool.begin())?;
        let mut handle = StoreTx {
            store: self,
            tx: Some(tx),
        };
        match f(&mut handle) {
            Ok(value) => {
                handle.commit()?;
                Ok(value)
            }
            Err(e) => {
                handle.rollback();
                Err(e)
            }
        }
    }

    /// Retry transient SQLite failures (busy/locked/disk I/O) with
    /// exponential backoff, up to the configured budget. SQLITE_FULL is
    /// reclassified as `StorageFull` and never retried.
    pub(crate) fn with_retry<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(StoreError::Database(e)) => {
                    let msg = e.to_string();
                    if msg.contains("disk is full") || msg.contains("database or disk is full") {
                        return Err(StoreError::StorageFull(msg));
                    }
                    let transient = msg.contains("locked")
                        || msg.contains("busy")
                        || msg.contains("disk I/O error");
                    if transient && attempt < self.io_retries {
                        let backoff = Duration::from_millis(10 << attempt);
                        tracing::warn!(
                            op,
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %msg,
                            "Transient database error, retrying"
                        );
                        std::thread::sleep(backoff);
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Database(e));
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Size of the database in bytes (page_count x page_size).
    pub fn size_bytes(&self) -> Result<u64, StoreError> {
        self.rt.block_on(async {
            let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
                .fetch_one(&self.pool)
                .await?;
            let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
                .fetch_one(&self.pool)
                .await?;
            Ok((page_count * page_size) as u64)
        })
    }

    /// Gracefully close the store, performing a WAL checkpoint.
    ///
    /// Safe to skip (pool will close connections on drop), but recommended
    /// for clean shutdown in long-running processes.
    pub fn close(self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.rt.block_on(async {
            // TRUNCATE mode: checkpoint and delete WAL file
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await?;
            tracing::debug!("WAL checkpoint completed");
            self.pool.close().await;
            Ok(())
        })
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return; // Already checkpointed in close()
        }
        // Best-effort WAL checkpoint on drop to avoid leaving large WAL files.
        // Errors are logged but not propagated (Drop can't fail).
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if let Err(e) = self.rt.block_on(async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(&self.pool)
                    .await
            }) {
                tracing::debug!(error = %e, "WAL checkpoint on drop failed (non-fatal)");
            }
        }));
    }
}

/// Scoped unit of work handed to [`Store::transaction`] closures.
///
/// Operations issued through the handle run on the transaction's
/// connection; nothing is visible to other readers until commit.
pub struct StoreTx<'a> {
    store: &'a Store,
    tx: Option<sqlx::Transaction<'static, sqlx::Sqlite>>,
}

impl StoreTx<'_> {
    /// Insert one record inside the transaction, returning its id.
    pub fn insert(&mut self, record: &VectorRecord) -> Result<String, StoreError> {
        let dimension = self.store.dimension;
        if record.embedding.len() != dimension {
            return Err(StoreError::DimensionMismatch {
                expected: dimension,
                actual: record.embedding.len(),
            });
        }
        let id = record
            .id
            .clone()
            .unwrap_or_else(crate::new_record_id);
        let bytes = helpers::embedding_to_bytes(&record.embedding);
        let norm = crate::metric::l2_norm(&record.embedding);
        let metadata_text = record
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());
        let now = crate::now_ms();

        let rt = &self.store.rt;
        let conn = self.tx.as_deref_mut().expect("transaction already finished");
        rt.block_on(async {
            let result = sqlx::query(
                "INSERT INTO vectors (id, embedding, norm, metadata, ts, kind) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'record')",
            )
            .bind(&id)
            .bind(&bytes)
            .bind(norm)
            .bind(&metadata_text)
            .bind(now)
            .execute(&mut *conn)
            .await;
            match result {
                Ok(_) => Ok(id),
                Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                    Err(StoreError::Conflict(id))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Delete a record by id. Returns true when a row was removed.
    pub fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
        let rt = &self.store.rt;
        let conn = self.tx.as_deref_mut().expect("transaction already finished");
        rt.block_on(async {
            let result = sqlx::query("DELETE FROM vectors WHERE id = ?1")
                .bind(id)
                .execute(&mut *conn)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn commit(mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            self.store.rt.block_on(tx.commit())?;
        }
        Ok(())
    }

    fn rollback(mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = self.store.rt.block_on(tx.rollback()) {
                tracing::debug!(error = %e, "Transaction rollback failed (non-fatal)");
            }
        }
    }
}
