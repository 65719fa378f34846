//! The `Db` facade: one handle unifying store, index, cache, and codec
//!
//! All public operations validate input first (no side effects on bad
//! input), route reads through the query cache, and pick between the ANN
//! index and exact brute force per the search policy:
//!
//! 1. validate query (finite floats, dimension, zero-vector vs cosine)
//! 2. fingerprint and consult the cache
//! 3. HNSW when the index serves queries and the metric matches,
//!    otherwise exact brute force
//! 4. hydrate metadata in one IN-clause round trip
//! 5. apply the post-filter
//! 6. insert into the cache

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cache::{Fingerprint, QueryCache};
use crate::cancel::{check_interrupt, CancellationToken, Deadline, Interrupt};
use crate::codec::VectorCodec;
use crate::cognitive::context::ContextSynthesizer;
use crate::cognitive::experiences::ExperienceCurator;
use crate::cognitive::optimizer::MemoryOptimizer;
use crate::cognitive::patterns::PatternMatcher;
use crate::config::{DbOptions, HnswOptions};
use crate::hnsw::{HnswIndex, IndexState};
use crate::metric::DistanceMetric;
use crate::metrics::Metrics;
use crate::store::helpers::KIND_RECORD;
use crate::store::{MetadataFilter, Store, StoredRecord, VectorRecord};
use crate::DbError;

/// `hnsw_meta` key holding the trained quantizer.
const META_QUANTIZER: &str = "quantizer";

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    /// Similarity score, higher is better (cosine similarity for the
    /// cosine metric).
    pub score: f32,
    pub metadata: Option<serde_json::Value>,
}

/// Optional search parameters; the plain `Db::search` uses defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Override the database metric for this query (forces the exact
    /// brute-force path when it differs from the index metric).
    pub metric: Option<DistanceMetric>,
    /// Minimum similarity score for a hit.
    pub threshold: Option<f32>,
    /// Post-filter over metadata; applied after hydration.
    pub filter: Option<MetadataFilter>,
    /// Per-call deadline.
    pub deadline: Option<Deadline>,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Snapshot returned by `Db::stats()`.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub records: u64,
    pub size_bytes: u64,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub index_state: IndexState,
    pub index_nodes: usize,
    pub index_edges: usize,
    pub index_tombstones: usize,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    /// Flat counter map (see `Metrics::snapshot`).
    pub counters: BTreeMap<String, u64>,
}

/// The single-entry API object for one open database.
pub struct Db {
    store: Arc<Store>,
    index: Arc<HnswIndex>,
    cache: QueryCache,
    codec: RwLock<VectorCodec>,
    metrics: Arc<Metrics>,
    options: DbOptions,
    /// Monotonic mutation counter; compared against `indexed_seq` to make
    /// repeated `build_index` calls no-ops.
    mutation_seq: AtomicU64,
    indexed_seq: AtomicU64,
    /// Set when the persisted graph failed verification: the ANN path is
    /// disabled for the session, reads continue via brute force.
    ann_disabled: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Open or create a database.
    pub fn open(options: DbOptions) -> Result<Self, DbError> {
        options.validate().map_err(DbError::InvalidInput)?;

        let store = Arc::new(Store::open(&options)?);
        let mut codec = VectorCodec::new(options.dimension);
        if let Some(json) = store.get_index_meta(META_QUANTIZER)? {
            codec.quantizer_from_json(&json)?;
            tracing::info!(codec_id = codec.codec_id(), "Quantizer restored");
        }

        let index = Arc::new(HnswIndex::new(
            options.hnsw.clone(),
            options.metric,
            options.dimension,
        ));
        let ann_disabled = AtomicBool::new(false);
        if options.hnsw.enabled {
            match index.load(&store) {
                Ok(true) => {}
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Persisted index failed verification; ANN disabled for this session");
                    ann_disabled.store(true, Ordering::Release);
                }
            }
        }

        Ok(Self {
            store,
            index,
            cache: QueryCache::new(&options.query_cache),
            codec: RwLock::new(codec),
            metrics: Arc::new(Metrics::new()),
            options,
            mutation_seq: AtomicU64::new(1),
            indexed_seq: AtomicU64::new(0),
            ann_disabled,
        })
    }

    pub fn dimension(&self) -> usize {
        self.options.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.options.metric
    }

    /// Cognitive layer: typed reasoning patterns.
    pub fn patterns(&self) -> PatternMatcher {
        PatternMatcher::new(Arc::clone(&self.store))
    }

    /// Cognitive layer: scored task executions.
    pub fn experiences(&self) -> ExperienceCurator {
        ExperienceCurator::new(Arc::clone(&self.store))
    }

    /// Cognitive layer: memory collapse.
    pub fn memory(&self) -> MemoryOptimizer {
        MemoryOptimizer::new(Arc::clone(&self.store))
    }

    /// Cognitive layer: parallel context synthesis.
    pub fn context(&self) -> ContextSynthesizer {
        ContextSynthesizer::new(Arc::clone(&self.store))
    }

    // ---- Ingest ----

    /// Insert a single record.
    pub fn insert(&self, record: VectorRecord) -> Result<String, DbError> {
        let mut ids = self.insert_batch(vec![record])?;
        Ok(ids.remove(0))
    }

    /// Atomic batched insert; returns ids in input order.
    pub fn insert_batch(&self, records: Vec<VectorRecord>) -> Result<Vec<String>, DbError> {
        self.insert_batch_with(records, None, None)
    }

    /// Batched insert with cancellation and deadline, observed at chunk
    /// boundaries.
    pub fn insert_batch_with(
        &self,
        records: Vec<VectorRecord>,
        cancel: Option<&CancellationToken>,
        deadline: Option<&Deadline>,
    ) -> Result<Vec<String>, DbError> {
        self.track(|| {
            for record in &records {
                self.validate_embedding(&record.embedding)?;
            }
            if let Some(stop) = check_interrupt(cancel, deadline) {
                return Err(interrupt_error(stop));
            }

            let ids = self.store.insert_many(&records, cancel)?;
            self.note_mutation();
            self.metrics
                .inserts
                .fetch_add(ids.len() as u64, Ordering::Relaxed);
            self.metrics.insert_batch_size.record(ids.len() as u64);

            // Quantized codes, when a codec is trained
            {
                let codec = self.codec.read().expect("codec lock poisoned");
                if self.options.quantization.enabled && codec.quantizer().is_some() {
                    for (id, record) in ids.iter().zip(&records) {
                        let blob = codec.quantize(&record.embedding)?;
                        self.store.put_quantized(id, &blob)?;
                    }
                }
            }

            // Keep a serving index current; a Seeded index defers
            self.maybe_seed_index()?;
            if self.index_serves() {
                let items: Vec<(String, Vec<f32>)> = ids
                    .iter()
                    .cloned()
                    .zip(records.iter().map(|r| r.embedding.clone()))
                    .collect();
                self.index_insert(&items, cancel)?;
            }

            Ok(ids)
        })
    }

    // ---- Reads ----

    /// Fetch a record by id.
    pub fn get(&self, id: &str) -> Result<Option<StoredRecord>, DbError> {
        self.track(|| Ok(self.store.get(id)?))
    }

    /// Fetch a record's quantized code blob (tag byte + code), if the
    /// codec has written one.
    pub fn get_quantized(&self, id: &str) -> Result<Option<Vec<u8>>, DbError> {
        self.track(|| Ok(self.store.get_quantized(id)?))
    }

    /// Reconstruct the codec approximation of a stored record from its
    /// quantized code. Never equal to the original beyond the codec's
    /// declared tolerance; never written back to the store.
    pub fn dequantize(&self, id: &str) -> Result<Option<Vec<f32>>, DbError> {
        self.track(|| {
            let Some(blob) = self.store.get_quantized(id)? else {
                return Ok(None);
            };
            let codec = self.codec.read().expect("codec lock poisoned");
            Ok(Some(codec.dequantize(&blob)?))
        })
    }

    /// Streamed scan over record metadata (no embedding decode).
    pub fn scan(
        &self,
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<Vec<crate::store::RecordMeta>, DbError> {
        self.track(|| Ok(self.store.scan(filter, limit)?))
    }

    /// Search with default options.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, DbError> {
        self.search_with(query, k, &SearchOptions::default())
    }

    /// Full search entry point (metric/threshold/filter/deadline).
    pub fn search_with(
        &self,
        query: &[f32],
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, DbError> {
        self.track(|| {
            let started = Instant::now();
            let metric = opts.metric.unwrap_or(self.options.metric);

            // Step 1: validation, before any side effect
            self.validate_embedding(query)?;
            if metric == DistanceMetric::Cosine && query.iter().all(|&x| x == 0.0) {
                return Err(DbError::InvalidInput(
                    "all-zero query vector is undefined under the cosine metric".to_string(),
                ));
            }
            if k == 0 {
                return Ok(Vec::new());
            }
            if let Some(stop) = check_interrupt(None, opts.deadline.as_ref()) {
                return Err(interrupt_error(stop));
            }

            // Step 2: cache
            let key = Fingerprint::new(query, k, metric, opts.threshold, opts.filter.as_ref());
            if let Some(hit) = self.cache.get(&key) {
                self.metrics
                    .searches_cache_hit
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
            self.metrics
                .searches_cache_miss
                .fetch_add(1, Ordering::Relaxed);

            // Step 3: index or brute force
            self.maybe_seed_index()?;
            let ann_usable = self.index_serves() && metric == self.options.metric;
            // Over-fetch when a post-filter may discard hits
            let fetch_k = if opts.filter.is_some() { k * 4 } else { k };
            let scored: Vec<(String, f32)> = if ann_usable {
                match self.index.search(query, fetch_k) {
                    Ok(outcome) => {
                        self.metrics.searches_hnsw.fetch_add(1, Ordering::Relaxed);
                        self.metrics
                            .beam_fill_permille
                            .record(outcome.beam_fill_permille);
                        outcome
                            .neighbors
                            .into_iter()
                            .map(|n| (n.id, metric.score_from_distance(n.distance)))
                            .filter(|(_, score)| {
                                opts.threshold.map_or(true, |t| *score >= t)
                            })
                            .collect()
                    }
                    Err(e) => {
                        self.quarantine_index_error(&e);
                        self.brute_force(query, fetch_k, metric, opts.threshold)?
                    }
                }
            } else {
                self.brute_force(query, fetch_k, metric, opts.threshold)?
            };

            if let Some(stop) = check_interrupt(None, opts.deadline.as_ref()) {
                return Err(interrupt_error(stop));
            }

            // Step 4: hydrate metadata in one round trip
            let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
            let records = self.store.get_many(&ids)?;
            let metadata_by_id: std::collections::HashMap<String, Option<serde_json::Value>> =
                records.into_iter().map(|r| (r.id, r.metadata)).collect();

            // Step 5: post-filter
            let mut results: Vec<SearchResult> = scored
                .into_iter()
                .filter_map(|(id, score)| {
                    let metadata = metadata_by_id.get(&id)?.clone();
                    if let Some(filter) = &opts.filter {
                        if !filter.matches(metadata.as_ref()) {
                            return None;
                        }
                    }
                    Some(SearchResult {
                        id,
                        score,
                        metadata,
                    })
                })
                .collect();
            results.truncate(k);

            // Step 6: cache
            self.cache.put(key, results.clone());
            self.metrics
                .search_latency_us
                .record(started.elapsed().as_micros() as u64);
            Ok(results)
        })
    }

    // ---- Mutation ----

    /// Delete a record. Cascades to the index (tombstone + durable
    /// removal) and invalidates the cache. Returns true when the record
    /// existed.
    pub fn delete(&self, id: &str) -> Result<bool, DbError> {
        self.track(|| {
            let removed = self.store.delete(id)?;
            if removed {
                self.note_mutation();
                self.metrics.deletes.fetch_add(1, Ordering::Relaxed);
                if self.index.remove(id) {
                    self.index.flush_remove(&self.store, id)?;
                }
                if self.index.state() == IndexState::Degraded && self.options.hnsw.auto_rebuild {
                    tracing::info!("Auto-rebuilding degraded index");
                    self.rebuild_index(None, None)?;
                }
            }
            Ok(removed)
        })
    }

    /// Replace a record's embedding/metadata. Cascades to index and cache.
    pub fn update(&self, id: &str, record: VectorRecord) -> Result<(), DbError> {
        self.track(|| {
            self.validate_embedding(&record.embedding)?;
            self.store.update(id, &record)?;
            self.note_mutation();

            if self.index_serves() {
                self.index.remove(id);
                self.index_insert(&[(id.to_string(), record.embedding.clone())], None)?;
            }
            Ok(())
        })
    }

    // ---- Index management ----

    /// Build (or rebuild) the ANN index from the stored records.
    ///
    /// A second call with no intervening mutation is a no-op. Trains the
    /// configured quantizer on first build when enough records exist.
    pub fn build_index(
        &self,
        cancel: Option<&CancellationToken>,
        deadline: Option<&Deadline>,
    ) -> Result<(), DbError> {
        self.track(|| {
            if !self.options.hnsw.enabled {
                return Err(DbError::InvalidInput(
                    "hnsw is disabled in the database options".to_string(),
                ));
            }
            let current = self.mutation_seq.load(Ordering::Acquire);
            if self.indexed_seq.load(Ordering::Acquire) == current
                && self.index.state() == IndexState::Ready
            {
                tracing::debug!("build_index: no mutations since last build, no-op");
                return Ok(());
            }
            self.train_quantizer_if_needed()?;
            self.rebuild_index(cancel, deadline)?;
            self.indexed_seq.store(current, Ordering::Release);
            Ok(())
        })
    }

    /// Drop the graph and its persisted image; search falls back to
    /// brute force until the next build.
    pub fn clear_index(&self) -> Result<(), DbError> {
        self.track(|| {
            self.index.clear();
            self.index.flush(&self.store)?;
            self.ann_disabled.store(false, Ordering::Release);
            self.indexed_seq.store(0, Ordering::Release);
            Ok(())
        })
    }

    /// Replace the index tuning parameters. The graph keeps its current
    /// shape until the next rebuild.
    pub fn update_index_config(&self, hnsw: HnswOptions) -> Result<(), DbError> {
        self.track(|| {
            hnsw.validate().map_err(DbError::InvalidInput)?;
            self.index.set_options(hnsw);
            Ok(())
        })
    }

    /// Drop every cached query result.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Engine statistics.
    pub fn stats(&self) -> Result<DbStats, DbError> {
        self.track(|| {
            let index_stats = self.index.stats();
            Ok(DbStats {
                records: self.store.count(Some(KIND_RECORD))?,
                size_bytes: self.store.size_bytes()?,
                dimension: self.options.dimension,
                metric: self.options.metric,
                index_state: index_stats.state,
                index_nodes: index_stats.nodes,
                index_edges: index_stats.edges,
                index_tombstones: index_stats.tombstones,
                cache_entries: self.cache.len(),
                cache_hits: self.metrics.cache_hits(),
                cache_misses: self.metrics.cache_misses(),
                cache_hit_ratio: self.metrics.cache_hit_ratio(),
                counters: self.metrics.snapshot(),
            })
        })
    }

    /// Close the database, checkpointing the WAL.
    pub fn close(self) -> Result<(), DbError> {
        let store = Arc::try_unwrap(self.store).map_err(|_| {
            DbError::Internal("close called while cognitive handles are alive".to_string())
        })?;
        store.close()?;
        Ok(())
    }

    // ---- Internals ----

    fn validate_embedding(&self, embedding: &[f32]) -> Result<(), DbError> {
        if embedding.is_empty() {
            return Err(DbError::InvalidInput("empty embedding".to_string()));
        }
        if embedding.len() != self.options.dimension {
            return Err(DbError::DimensionMismatch {
                expected: self.options.dimension,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(DbError::InvalidInput(
                "embedding contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    fn note_mutation(&self) {
        self.mutation_seq.fetch_add(1, Ordering::AcqRel);
        self.cache.bump_generation();
    }

    fn index_serves(&self) -> bool {
        !self.ann_disabled.load(Ordering::Acquire) && self.index.state().serves_queries()
    }

    /// Insert freshly written records into a serving graph. A working set
    /// that no longer fits the memory budget is not an ingest failure:
    /// the records are durable, so ANN is switched off for the session
    /// and search continues via brute force.
    fn index_insert(
        &self,
        items: &[(String, Vec<f32>)],
        cancel: Option<&CancellationToken>,
    ) -> Result<(), DbError> {
        match self.index.insert_batch(items, cancel) {
            Ok(_) => {
                self.index.flush(&self.store)?;
                Ok(())
            }
            Err(e @ crate::hnsw::HnswError::BudgetExhausted { .. }) => {
                tracing::warn!(
                    error = %e,
                    "Index working set exceeds its memory budget; search falls back to brute force"
                );
                self.ann_disabled.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.quarantine_index_error(&e);
                Err(e.into())
            }
        }
    }

    /// Transition Seeded -> Ready by building once the record count
    /// crosses the threshold.
    fn maybe_seed_index(&self) -> Result<(), DbError> {
        if self.ann_disabled.load(Ordering::Acquire)
            || !self.options.hnsw.enabled
            || self.index.state() != IndexState::Seeded
        {
            return Ok(());
        }
        let count = self.store.count(Some(KIND_RECORD))? as usize;
        let options = self.index.options();
        if count >= options.min_vectors_for_index {
            // Refuse up front when the working set cannot fit the budget
            let needed = (count * self.options.dimension * 4) as u64;
            if needed > options.memory_budget_bytes {
                tracing::debug!(
                    needed,
                    budget = options.memory_budget_bytes,
                    "Working set exceeds hnsw.memory_budget_bytes; staying on brute force"
                );
                return Ok(());
            }
            tracing::info!(count, "Record threshold crossed, building HNSW index");
            self.rebuild_index(None, None)?;
            self.indexed_seq
                .store(self.mutation_seq.load(Ordering::Acquire), Ordering::Release);
        }
        Ok(())
    }

    fn rebuild_index(
        &self,
        cancel: Option<&CancellationToken>,
        deadline: Option<&Deadline>,
    ) -> Result<(), DbError> {
        let budget = self.index.options().memory_budget_bytes;
        let mut rows: Vec<(String, Vec<f32>)> = Vec::new();
        let mut resident_bytes = 0u64;
        let mut timed_out = false;
        let mut over_budget = false;
        self.store.stream_embeddings(KIND_RECORD, |batch| {
            match check_interrupt(cancel, deadline) {
                Some(Interrupt::Cancelled) => return Err(crate::store::StoreError::Cancelled),
                Some(Interrupt::TimedOut) => {
                    timed_out = true;
                    return Ok(false);
                }
                None => {}
            }
            for row in batch {
                resident_bytes += (row.embedding.len() * 4) as u64;
                rows.push((row.id, row.embedding));
            }
            if resident_bytes > budget {
                over_budget = true;
                return Ok(false);
            }
            Ok(true)
        })?;
        if timed_out {
            return Err(DbError::Timeout);
        }
        if over_budget {
            return Err(DbError::from(crate::hnsw::HnswError::BudgetExhausted {
                budget,
            }));
        }

        self.index.build_from(rows, cancel).map_err(|e| {
            self.quarantine_index_error(&e);
            DbError::from(e)
        })?;
        if let Some(d) = deadline {
            if d.expired() {
                // The graph built past the deadline; durable state is
                // untouched and the next call can flush it.
                return Err(DbError::Timeout);
            }
        }
        self.index.flush(&self.store)?;
        Ok(())
    }

    /// Train the configured quantizer when enabled and not yet trained,
    /// then backfill codes for existing rows.
    fn train_quantizer_if_needed(&self) -> Result<(), DbError> {
        if !self.options.quantization.enabled {
            return Ok(());
        }
        {
            let codec = self.codec.read().expect("codec lock poisoned");
            if codec.quantizer().is_some() {
                return Ok(());
            }
        }
        let sample = self.store.embedding_sample(4_096)?;
        if sample.is_empty() {
            return Ok(());
        }

        let mut codec = self.codec.write().expect("codec lock poisoned");
        if codec.quantizer().is_some() {
            return Ok(());
        }
        codec.train(&self.options.quantization, &sample)?;
        if let Some(json) = codec.quantizer_to_json()? {
            self.store.put_index_meta(META_QUANTIZER, &json)?;
        }

        // Backfill codes for everything already stored
        let mut pending: Vec<(String, Vec<u8>)> = Vec::new();
        self.store.stream_embeddings(KIND_RECORD, |batch| {
            for row in batch {
                let blob = codec
                    .quantize(&row.embedding)
                    .map_err(|e| crate::store::StoreError::Runtime(e.to_string()))?;
                pending.push((row.id, blob));
            }
            Ok(true)
        })?;
        for (id, blob) in pending {
            self.store.put_quantized(&id, &blob)?;
        }
        Ok(())
    }

    fn brute_force(
        &self,
        query: &[f32],
        k: usize,
        metric: DistanceMetric,
        threshold: Option<f32>,
    ) -> Result<Vec<(String, f32)>, DbError> {
        self.metrics.searches_brute.fetch_add(1, Ordering::Relaxed);
        let scored = self
            .store
            .brute_force_search(query, k, metric, threshold, KIND_RECORD)?;
        Ok(scored.into_iter().map(|s| (s.id, s.score)).collect())
    }

    /// An index error that signals corruption disables the ANN path for
    /// the rest of the session.
    fn quarantine_index_error(&self, e: &crate::hnsw::HnswError) {
        if matches!(e, crate::hnsw::HnswError::Corrupt(_)) {
            tracing::error!(error = %e, "Index corruption detected; ANN disabled for this session");
            self.ann_disabled.store(true, Ordering::Release);
        }
    }

    /// Record the error kind in metrics on the way out.
    fn track<T>(&self, f: impl FnOnce() -> Result<T, DbError>) -> Result<T, DbError> {
        match f() {
            Ok(value) => Ok(value),
            Err(e) => {
                self.metrics.record_error(e.kind());
                Err(e)
            }
        }
    }
}

fn interrupt_error(stop: Interrupt) -> DbError {
    match stop {
        Interrupt::Cancelled => DbError::Cancelled,
        Interrupt::TimedOut => DbError::Timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(idx: usize, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[idx] = 1.0;
        v
    }

    fn open_small() -> Db {
        Db::open(DbOptions::new(3)).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let db = open_small();
        let id = db
            .insert(VectorRecord::new(vec![1.0, 2.0, 3.0]))
            .unwrap();
        let record = db.get(&id).unwrap().unwrap();
        assert_eq!(record.embedding, vec![1.0, 2.0, 3.0]);
        let expected = (1.0f32 + 4.0 + 9.0).sqrt();
        assert!((record.norm - expected).abs() <= 1e-6);
    }

    #[test]
    fn test_search_empty_db_returns_empty() {
        let db = open_small();
        assert!(db.search(&unit(0, 3), 5).unwrap().is_empty());
    }

    #[test]
    fn test_zero_query_cosine_is_invalid() {
        let db = open_small();
        assert!(matches!(
            db.search(&[0.0, 0.0, 0.0], 5),
            Err(DbError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_zero_query_euclidean_is_valid() {
        let db = open_small();
        db.insert(VectorRecord::new(unit(0, 3))).unwrap();
        let results = db
            .search_with(
                &[0.0, 0.0, 0.0],
                1,
                &SearchOptions::new().with_metric(DistanceMetric::Euclidean),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_non_finite_embedding_rejected() {
        let db = open_small();
        assert!(matches!(
            db.insert(VectorRecord::new(vec![1.0, f32::NAN, 0.0])),
            Err(DbError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch_on_insert() {
        let db = open_small();
        assert!(matches!(
            db.insert(VectorRecord::new(vec![1.0, 2.0])),
            Err(DbError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_k_zero_returns_empty() {
        let db = open_small();
        db.insert(VectorRecord::new(unit(0, 3))).unwrap();
        assert!(db.search(&unit(0, 3), 0).unwrap().is_empty());
    }

    #[test]
    fn test_k_larger_than_count_returns_all() {
        let db = open_small();
        db.insert(VectorRecord::new(unit(0, 3))).unwrap();
        db.insert(VectorRecord::new(unit(1, 3))).unwrap();
        let results = db.search(&unit(0, 3), 100).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_build_index_disabled_errors() {
        let db = Db::open(DbOptions::new(3).without_index()).unwrap();
        assert!(matches!(
            db.build_index(None, None),
            Err(DbError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_stats_counts() {
        let db = open_small();
        db.insert(VectorRecord::new(unit(0, 3))).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.dimension, 3);
        assert!(stats.size_bytes > 0);
    }
}
