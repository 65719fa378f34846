//! HNSW (Hierarchical Navigable Small World) index for fast vector search
//!
//! Provides O(log n) approximate nearest neighbor search over the stored
//! embeddings. The graph lives in RAM and is persisted relationally
//! (`hnsw_nodes` / `hnsw_edges` / `hnsw_meta`) so a database file is fully
//! self-contained; an adjacency checksum is verified on load.
//!
//! ## Concurrency
//!
//! A single `RwLock` guards the graph: insertions serialize on the write
//! lock, searches share the read lock and therefore never observe a
//! partially inserted node. There is no lock-free fast path — correctness
//! beats throughput here.
//!
//! ## Lifecycle
//!
//! Disabled -> (enabled) Seeded -> Building -> Ready <-> Degraded.
//! Below `min_vectors_for_index` the index stays Seeded and the backend
//! answers queries by brute force; deletions tombstone nodes and a
//! compaction rebuild restores Ready from Degraded.

mod build;
mod graph;
mod persist;
mod search;

pub use graph::IndexState;
pub use search::IndexSearch;

use std::sync::{Mutex, RwLock};

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::config::HnswOptions;
use crate::metric::DistanceMetric;
use crate::store::StoreError;
use graph::Graph;

#[derive(Error, Debug)]
pub enum HnswError {
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("vector working set would exceed hnsw.memory_budget_bytes ({budget} bytes)")]
    BudgetExhausted { budget: u64 },
    #[error("HNSW error: {0}")]
    Internal(String),
}

/// Search hit: arena-resolved record id and its distance to the query
/// (lower is closer; the backend converts to a similarity score).
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: String,
    pub distance: f32,
}

/// Point-in-time index statistics for `Db::stats()`.
#[derive(Debug, Clone)]
pub struct HnswStats {
    pub state: IndexState,
    pub nodes: usize,
    pub edges: usize,
    pub max_level: usize,
    pub tombstones: usize,
    /// Bytes held by the transient vector working set.
    pub resident_vector_bytes: usize,
}

pub(crate) struct Inner {
    pub options: HnswOptions,
    pub graph: Graph,
    pub state: IndexState,
}

/// The ANN index. One per open database.
pub struct HnswIndex {
    metric: DistanceMetric,
    dimension: usize,
    pub(crate) inner: RwLock<Inner>,
    /// Deterministic level draws; seeded so rebuilds reproduce exactly.
    rng: Mutex<StdRng>,
}

impl HnswIndex {
    pub fn new(options: HnswOptions, metric: DistanceMetric, dimension: usize) -> Self {
        let state = if options.enabled {
            IndexState::Seeded
        } else {
            IndexState::Disabled
        };
        Self {
            metric,
            dimension,
            inner: RwLock::new(Inner {
                options,
                graph: Graph::default(),
                state,
            }),
            rng: Mutex::new(StdRng::seed_from_u64(42)),
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn options(&self) -> HnswOptions {
        self.read().options.clone()
    }

    /// Replace the tuning parameters. Takes effect for future inserts and
    /// searches; an existing graph keeps its shape until rebuilt.
    pub fn set_options(&self, options: HnswOptions) {
        let mut inner = self.write();
        let enabled = options.enabled;
        inner.options = options;
        if !enabled {
            inner.state = IndexState::Disabled;
        } else if inner.state == IndexState::Disabled {
            inner.state = if inner.graph.live_len() == 0 {
                IndexState::Seeded
            } else {
                IndexState::Ready
            };
        }
    }

    pub fn state(&self) -> IndexState {
        self.read().state
    }

    pub(crate) fn set_state(&self, state: IndexState) {
        let mut inner = self.write();
        tracing::debug!(
            from = inner.state.as_str(),
            to = state.as_str(),
            "Index state change"
        );
        inner.state = state;
    }

    pub fn len(&self) -> usize {
        self.read().graph.live_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HnswStats {
        let inner = self.read();
        HnswStats {
            state: inner.state,
            nodes: inner.graph.len(),
            edges: inner.graph.edge_count(),
            max_level: inner.graph.max_level,
            tombstones: inner.graph.tombstones,
            resident_vector_bytes: inner.graph.resident_bytes,
        }
    }

    /// Drop the graph and return to Seeded (or Disabled).
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.graph.clear();
        inner.state = if inner.options.enabled {
            IndexState::Seeded
        } else {
            IndexState::Disabled
        };
    }

    /// Tombstone a record's node. Returns true when the node existed.
    /// Transitions Ready -> Degraded when the tombstone fraction crosses
    /// the threshold.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.write();
        let removed = inner.graph.tombstone(id);
        if removed {
            if inner.state == IndexState::Ready
                && inner.graph.tombstone_ratio() > graph::TOMBSTONE_DEGRADE_RATIO
            {
                tracing::info!(
                    ratio = inner.graph.tombstone_ratio(),
                    "Tombstone threshold crossed, index degraded"
                );
                inner.state = IndexState::Degraded;
            }
        }
        removed
    }

    /// Draw an insertion level from the geometric distribution
    /// floor(-ln(U) * mL), capped at MAX_LEVEL.
    pub(crate) fn draw_level(&self, level_mult: f64) -> usize {
        use rand::RngExt;
        let mut rng = self.rng.lock().expect("rng mutex poisoned");
        let u: f64 = rng.random_range(f64::EPSILON..=1.0);
        let level = (-u.ln() * level_mult).floor();
        (level as usize).min(graph::MAX_LEVEL)
    }

    /// Audit every graph invariant. Cheap enough for tests and load-time
    /// verification, not for the hot path.
    pub fn debug_validate(&self) -> Result<(), HnswError> {
        let inner = self.read();
        inner.graph.validate(inner.options.m, inner.options.m0)
    }

    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("hnsw lock poisoned")
    }

    pub(crate) fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("hnsw lock poisoned")
    }
}

/// Heap entry ordered by distance then arena index, so ties are broken
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DistEntry {
    pub dist: f32,
    pub idx: u32,
}

impl Eq for DistEntry {}

impl Ord for DistEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

impl PartialOrd for DistEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Shared test helper: deterministic normalized embedding from a seed.
#[cfg(test)]
pub(crate) fn make_test_embedding(dim: usize, seed: u32) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    for (i, val) in v.iter_mut().enumerate() {
        *val = ((seed as f32 * 0.1) + (i as f32 * 0.001)).sin();
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in &mut v {
            *val /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> HnswIndex {
        HnswIndex::new(HnswOptions::default(), DistanceMetric::Cosine, 8)
    }

    #[test]
    fn test_initial_state() {
        assert_eq!(index().state(), IndexState::Seeded);

        let disabled = HnswIndex::new(
            HnswOptions {
                enabled: false,
                ..Default::default()
            },
            DistanceMetric::Cosine,
            8,
        );
        assert_eq!(disabled.state(), IndexState::Disabled);
    }

    #[test]
    fn test_draw_level_distribution() {
        let idx = index();
        let mult = HnswOptions::default().level_mult();
        let mut counts = [0usize; graph::MAX_LEVEL + 1];
        for _ in 0..10_000 {
            counts[idx.draw_level(mult)] += 1;
        }
        // Level 0 dominates; each level decays roughly geometrically
        assert!(counts[0] > 9_000, "level 0 too rare: {}", counts[0]);
        assert!(counts[0] > counts[1]);
        assert!(counts[1] > counts[3].max(1));
    }

    #[test]
    fn test_dist_entry_ordering() {
        let a = DistEntry { dist: 0.1, idx: 5 };
        let b = DistEntry { dist: 0.2, idx: 1 };
        let tie = DistEntry { dist: 0.1, idx: 7 };
        assert!(a < b);
        assert!(a < tie);
    }

    #[test]
    fn test_clear_resets_to_seeded() {
        let idx = index();
        idx.set_state(IndexState::Ready);
        idx.clear();
        assert_eq!(idx.state(), IndexState::Seeded);
        assert!(idx.is_empty());
    }

    #[test]
    fn test_set_options_toggles_state() {
        let idx = index();
        idx.set_options(HnswOptions {
            enabled: false,
            ..Default::default()
        });
        assert_eq!(idx.state(), IndexState::Disabled);
        idx.set_options(HnswOptions::default());
        assert_eq!(idx.state(), IndexState::Seeded);
    }
}
