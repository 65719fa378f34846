//! Vector record CRUD, batched ingest, and scans

use sqlx::Row;

use super::helpers::{
    bytes_to_embedding, embedding_to_bytes, MetadataFilter, RecordMeta, StoreError, StoredRecord,
    VectorRecord, KIND_RECORD,
};
use super::Store;
use crate::cancel::CancellationToken;
use crate::metric::{l2_norm, DistanceMetric};

/// Upper bound on rows per ingest transaction. Caps both fsync overhead
/// (one commit per chunk) and the window a cancellation has to wait.
pub(crate) const MAX_INSERT_CHUNK: usize = 5_000;

/// SQLite's default host-parameter limit is 999; IN-clause hydration stays
/// well under it.
const IN_CLAUSE_BATCH: usize = 500;

/// Rows per page when streaming the table (keyset pagination on id).
pub(crate) const SCAN_BATCH: usize = 1_000;

/// An id with its similarity score, as produced by the search paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

/// One row of the embedding stream (id order, ascending).
pub(crate) struct EmbeddingRow {
    pub id: String,
    pub embedding: Vec<f32>,
}

impl Store {
    /// Atomic batched insert of plain records. See `insert_many_kind`.
    pub fn insert_many(
        &self,
        records: &[VectorRecord],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>, StoreError> {
        self.insert_many_kind(records, KIND_RECORD, cancel)
    }

    /// Atomic batched insert (10-100x faster than individual inserts).
    ///
    /// Rows are written in chunks of at most `MAX_INSERT_CHUNK`, one
    /// transaction per chunk. The INSERT statement text is identical for
    /// every row, so sqlx's per-connection statement cache compiles it
    /// once and reuses it across the whole batch.
    ///
    /// All embeddings are validated against the store dimension before the
    /// first write, so a dimension error has no side effects. Cancellation
    /// is observed between chunks; completed chunks stay committed.
    pub(crate) fn insert_many_kind(
        &self,
        records: &[VectorRecord],
        kind: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>, StoreError> {
        let dimension = self.dimension();
        for record in records {
            if record.embedding.len() != dimension {
                return Err(StoreError::DimensionMismatch {
                    expected: dimension,
                    actual: record.embedding.len(),
                });
            }
        }

        let mut ids = Vec::with_capacity(records.len());
        for chunk in records.chunks(MAX_INSERT_CHUNK) {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    tracing::info!(inserted = ids.len(), "Batch insert cancelled");
                    return Err(StoreError::Cancelled);
                }
            }

            let chunk_ids = self.with_retry("insert_many", || {
                self.rt.block_on(async {
                    let mut tx = self.pool.begin().await?;
                    let now = crate::now_ms();
                    let mut chunk_ids = Vec::with_capacity(chunk.len());
                    for record in chunk {
                        let id = record.id.clone().unwrap_or_else(crate::new_record_id);
                        let bytes = embedding_to_bytes(&record.embedding);
                        let norm = l2_norm(&record.embedding);
                        let metadata_text = record
                            .metadata
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()
                            .map_err(|e| StoreError::Runtime(e.to_string()))?;
                        let result = sqlx::query(
                            "INSERT INTO vectors (id, embedding, norm, metadata, ts, kind) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        )
                        .bind(&id)
                        .bind(&bytes)
                        .bind(norm)
                        .bind(&metadata_text)
                        .bind(now)
                        .bind(kind)
                        .execute(&mut *tx)
                        .await;
                        match result {
                            Ok(_) => chunk_ids.push(id),
                            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                                return Err(StoreError::Conflict(id));
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    tx.commit().await?;
                    Ok(chunk_ids)
                })
            })?;
            ids.extend(chunk_ids);
        }

        tracing::debug!(count = ids.len(), kind, "Batch insert complete");
        Ok(ids)
    }

    /// Insert a single record. Supported but explicitly slower than
    /// `insert_many` — each call pays its own transaction commit.
    pub fn insert_one(&self, record: &VectorRecord) -> Result<String, StoreError> {
        let ids = self.insert_many(std::slice::from_ref(record), None)?;
        Ok(ids.into_iter().next().expect("one record inserted"))
    }

    /// Fetch a record by id.
    pub fn get(&self, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let dimension = self.dimension();
        self.rt.block_on(async {
            let row = sqlx::query(
                "SELECT id, embedding, norm, metadata, ts FROM vectors WHERE id = ?1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|row| record_from_row(&row, dimension)).transpose()
        })
    }

    /// Fetch many records in one round-trip per `IN_CLAUSE_BATCH` ids,
    /// returned in the order requested. Missing ids are skipped.
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<StoredRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let dimension = self.dimension();
        let mut by_id = std::collections::HashMap::with_capacity(ids.len());
        self.rt.block_on(async {
            for batch in ids.chunks(IN_CLAUSE_BATCH) {
                let placeholders: Vec<String> =
                    (1..=batch.len()).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "SELECT id, embedding, norm, metadata, ts FROM vectors WHERE id IN ({})",
                    placeholders.join(",")
                );
                let mut query = sqlx::query(&sql);
                for id in batch {
                    query = query.bind(id);
                }
                let rows = query.fetch_all(&self.pool).await?;
                for row in rows {
                    let record = record_from_row(&row, dimension)?;
                    by_id.insert(record.id.clone(), record);
                }
            }
            Ok::<_, StoreError>(())
        })?;
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Delete a record. Returns true when a row existed.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.with_retry("delete", || {
            self.rt.block_on(async {
                let result = sqlx::query("DELETE FROM vectors WHERE id = ?1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(result.rows_affected() > 0)
            })
        })
    }

    /// Replace a record's embedding and metadata in place. The creation
    /// timestamp is preserved; norms are recomputed.
    pub fn update(&self, id: &str, record: &VectorRecord) -> Result<(), StoreError> {
        let dimension = self.dimension();
        if record.embedding.len() != dimension {
            return Err(StoreError::DimensionMismatch {
                expected: dimension,
                actual: record.embedding.len(),
            });
        }
        let bytes = embedding_to_bytes(&record.embedding);
        let norm = l2_norm(&record.embedding);
        let metadata_text = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Runtime(e.to_string()))?;

        self.with_retry("update", || {
            self.rt.block_on(async {
                let result = sqlx::query(
                    "UPDATE vectors SET embedding = ?2, norm = ?3, metadata = ?4, quantized = NULL \
                     WHERE id = ?1",
                )
                .bind(id)
                .bind(&bytes)
                .bind(norm)
                .bind(&metadata_text)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound(id.to_string()));
                }
                Ok(())
            })
        })
    }

    /// Number of rows, optionally restricted to one kind.
    pub fn count(&self, kind: Option<&str>) -> Result<u64, StoreError> {
        self.rt.block_on(async {
            let (count,): (i64,) = match kind {
                Some(kind) => {
                    sqlx::query_as("SELECT COUNT(*) FROM vectors WHERE kind = ?1")
                        .bind(kind)
                        .fetch_one(&self.pool)
                        .await?
                }
                None => {
                    sqlx::query_as("SELECT COUNT(*) FROM vectors")
                        .fetch_one(&self.pool)
                        .await?
                }
            };
            Ok(count as u64)
        })
    }

    /// Streamed scan over metadata columns (no embedding decode).
    ///
    /// Pages through the table in id order with keyset pagination, so very
    /// large tables never force the whole dataset into RAM. The filter is
    /// applied per row; up to `limit` matches are returned.
    pub fn scan(
        &self,
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<RecordMeta>, StoreError> {
        let mut out = Vec::new();
        let mut cursor = String::new();
        while out.len() < limit {
            let rows: Vec<(String, Option<String>, i64)> = self.rt.block_on(async {
                sqlx::query_as(
                    "SELECT id, metadata, ts FROM vectors \
                     WHERE kind = 'record' AND id > ?1 ORDER BY id LIMIT ?2",
                )
                .bind(&cursor)
                .bind(SCAN_BATCH as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from)
            })?;
            if rows.is_empty() {
                break;
            }
            cursor = rows.last().map(|(id, _, _)| id.clone()).unwrap_or_default();
            for (id, metadata_text, ts) in rows {
                let metadata = parse_metadata(metadata_text.as_deref(), &id);
                if filter.matches(metadata.as_ref()) {
                    out.push(RecordMeta {
                        id,
                        metadata,
                        created_at_ms: ts,
                    });
                    if out.len() == limit {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Stream embedding rows of one kind, in id order, in bounded batches.
    ///
    /// The callback returns `false` to stop early. Used by brute-force
    /// search, index construction, and memory collapse so none of them
    /// ever hold the full table in memory.
    pub(crate) fn stream_embeddings(
        &self,
        kind: &str,
        mut f: impl FnMut(Vec<EmbeddingRow>) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError> {
        let dimension = self.dimension();
        let mut cursor = String::new();
        loop {
            let rows: Vec<(String, Vec<u8>)> = self.rt.block_on(async {
                sqlx::query_as(
                    "SELECT id, embedding FROM vectors \
                     WHERE kind = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
                )
                .bind(kind)
                .bind(&cursor)
                .bind(SCAN_BATCH as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from)
            })?;
            if rows.is_empty() {
                return Ok(());
            }
            cursor = rows.last().map(|(id, _)| id.clone()).unwrap_or_default();
            let mut batch = Vec::with_capacity(rows.len());
            for (id, bytes) in rows {
                let embedding = bytes_to_embedding(&bytes, dimension)?;
                batch.push(EmbeddingRow { id, embedding });
            }
            if !f(batch)? {
                return Ok(());
            }
        }
    }

    /// Exact nearest-neighbor search by full scan.
    ///
    /// This is the fallback below `min_vectors_for_index` and the recovery
    /// path when the ANN index is corrupt or degraded. Ties are broken by
    /// id, which for generated (time-ordered) ids means insertion order.
    pub(crate) fn brute_force_search(
        &self,
        query: &[f32],
        k: usize,
        metric: DistanceMetric,
        threshold: Option<f32>,
        kind: &str,
    ) -> Result<Vec<ScoredId>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(f32, String)> = Vec::new();
        self.stream_embeddings(kind, |batch| {
            use rayon::prelude::*;
            let mut batch_scores: Vec<(f32, String)> = batch
                .into_par_iter()
                .map(|row| (metric.score(query, &row.embedding), row.id))
                .filter(|(score, _)| threshold.map_or(true, |t| *score >= t))
                .collect();
            scored.append(&mut batch_scores);
            Ok(true)
        })?;

        // Descending score; ascending id on ties (= insertion order)
        scored.sort_unstable_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(score, id)| ScoredId { id, score })
            .collect())
    }

    /// Uniform-ish training sample for quantizer calibration: the first
    /// `n` rows in id order. Time-ordered ids make this a time-prefix
    /// sample, which is adequate for per-column min/max and k-means.
    pub(crate) fn embedding_sample(&self, n: usize) -> Result<Vec<Vec<f32>>, StoreError> {
        let mut sample = Vec::with_capacity(n);
        self.stream_embeddings(KIND_RECORD, |batch| {
            for row in batch {
                if sample.len() >= n {
                    return Ok(false);
                }
                sample.push(row.embedding);
            }
            Ok(sample.len() < n)
        })?;
        Ok(sample)
    }

    /// Write a quantized code blob alongside a record.
    pub(crate) fn put_quantized(&self, id: &str, blob: &[u8]) -> Result<(), StoreError> {
        self.rt.block_on(async {
            let result = sqlx::query("UPDATE vectors SET quantized = ?2 WHERE id = ?1")
                .bind(id)
                .bind(blob)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Read a record's quantized code blob, if one was written.
    pub(crate) fn get_quantized(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.rt.block_on(async {
            let row: Option<(Option<Vec<u8>>,)> =
                sqlx::query_as("SELECT quantized FROM vectors WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.and_then(|(blob,)| blob))
        })
    }
}

fn parse_metadata(text: Option<&str>, id: &str) -> Option<serde_json::Value> {
    let text = text?;
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(record_id = %id, error = %e, "Stored metadata is not valid JSON");
            None
        }
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow, dimension: usize) -> Result<StoredRecord, StoreError> {
    let id: String = row.get(0);
    let bytes: Vec<u8> = row.get(1);
    let embedding = bytes_to_embedding(&bytes, dimension)?;
    let metadata_text: Option<String> = row.get(3);
    let metadata = parse_metadata(metadata_text.as_deref(), &id);
    Ok(StoredRecord {
        id,
        embedding,
        norm: row.get(2),
        metadata,
        created_at_ms: row.get(4),
    })
}
