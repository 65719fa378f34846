//! Database configuration
//!
//! Options can be built in code or loaded from a TOML file; code-level
//! setters override file values. Every option except `dimension` has a
//! default.
//!
//! ```toml
//! # agentdb.toml
//! path = ":memory:"
//! dimension = 384
//! metric = "cosine"
//!
//! [hnsw]
//! m = 16
//! ef_search = 50
//!
//! [query_cache]
//! max_entries = 1000
//! ttl_ms = 300000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::metric::DistanceMetric;

/// HNSW index tuning.
///
/// Defaults suit agent memory workloads (1k-1M embeddings):
/// - M=16 / M0=32: standard connectivity, good recall at moderate memory
/// - ef_construction=200: thorough one-time graph construction
/// - ef_search=50: interactive-latency queries; raise for better recall
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswOptions {
    /// Whether the ANN index may be used at all.
    pub enabled: bool,
    /// Out-edge budget per node at levels above 0.
    pub m: usize,
    /// Out-edge budget at level 0 (default 2·M).
    pub m0: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Beam width during queries.
    pub ef_search: usize,
    /// Level-draw multiplier. `None` means 1/ln(M).
    pub ml: Option<f64>,
    /// Below this record count, search uses exact brute force and graph
    /// construction is deferred.
    pub min_vectors_for_index: usize,
    /// Rebuild automatically when tombstones cross the degradation
    /// threshold, instead of waiting for an explicit `build_index`.
    pub auto_rebuild: bool,
    /// Upper bound in bytes on the graph's in-RAM vector working set.
    /// The durable embeddings stay in the store; the graph only caches
    /// what traversal needs, and once that set would exceed this budget
    /// the graph refuses to grow and search stays on the exact
    /// brute-force path.
    pub memory_budget_bytes: u64,
}

impl Default for HnswOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            m: 16,
            m0: 32,
            ef_construction: 200,
            ef_search: 50,
            ml: None,
            min_vectors_for_index: 1000,
            auto_rebuild: false,
            memory_budget_bytes: 268_435_456,
        }
    }
}

impl HnswOptions {
    /// Effective level multiplier: explicit `ml` or 1/ln(M).
    pub fn level_mult(&self) -> f64 {
        match self.ml {
            Some(ml) => ml,
            None => {
                let m = self.m as f64;
                if m > 1.0 {
                    1.0 / m.ln()
                } else {
                    0.0
                }
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.m <= 1 {
            return Err(format!("hnsw.m must be > 1, got {}", self.m));
        }
        if self.m0 < self.m {
            return Err(format!(
                "hnsw.m0 must be >= hnsw.m, got {} < {}",
                self.m0, self.m
            ));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err("hnsw beam widths must be > 0".to_string());
        }
        if self.memory_budget_bytes == 0 {
            return Err("hnsw.memory_budget_bytes must be > 0".to_string());
        }
        Ok(())
    }
}

/// Query cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheOptions {
    pub enabled: bool,
    /// Maximum number of cached result lists.
    pub max_entries: usize,
    /// Per-entry time to live in milliseconds.
    pub ttl_ms: u64,
}

impl Default for QueryCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl_ms: 300_000,
        }
    }
}

/// Quantization codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationKind {
    Scalar,
    Product,
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationOptions {
    pub enabled: bool,
    /// Which quantizer to train. Ignored when `enabled` is false.
    pub kind: Option<QuantizationKind>,
    /// Bits per code for the product quantizer (4-8).
    pub bits: u8,
    /// Subvector count for the product quantizer.
    pub subvectors: usize,
}

impl Default for QuantizationOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: None,
            bits: 8,
            subvectors: 8,
        }
    }
}

/// All options for opening a database.
///
/// `dimension` is required; everything else defaults per the table in the
/// crate docs. Use `DbOptions::new(dim)` then chain setters, or load a
/// TOML file with [`DbOptions::from_toml_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbOptions {
    /// `":memory:"` or a filesystem path.
    pub path: String,
    /// Embedding dimension, fixed for the life of the database.
    pub dimension: usize,
    /// Distance metric used for search and index construction.
    pub metric: DistanceMetric,
    /// Write-ahead-log journaling (on by default; turning it off is only
    /// useful for read-only media).
    pub wal: bool,
    /// SQLite page cache budget in KiB.
    pub cache_size_kib: u64,
    /// Memory-mapped I/O window in bytes (0 disables mmap).
    pub mmap_size_bytes: u64,
    /// Transient I/O errors are retried this many times with exponential
    /// backoff before surfacing.
    pub io_retries: u32,
    pub hnsw: HnswOptions,
    pub query_cache: QueryCacheOptions,
    pub quantization: QuantizationOptions,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            dimension: 0,
            metric: DistanceMetric::Cosine,
            wal: true,
            cache_size_kib: 100_000,
            mmap_size_bytes: 268_435_456,
            io_retries: 3,
            hnsw: HnswOptions::default(),
            query_cache: QueryCacheOptions::default(),
            quantization: QuantizationOptions::default(),
        }
    }
}

impl DbOptions {
    /// In-memory database with the given embedding dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    /// Open or create a database file at `path`.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_hnsw(mut self, hnsw: HnswOptions) -> Self {
        self.hnsw = hnsw;
        self
    }

    /// Disable the ANN index entirely; all searches use brute force.
    pub fn without_index(mut self) -> Self {
        self.hnsw.enabled = false;
        self
    }

    pub fn with_query_cache(mut self, cache: QueryCacheOptions) -> Self {
        self.query_cache = cache;
        self
    }

    pub fn with_quantization(mut self, quantization: QuantizationOptions) -> Self {
        self.quantization = quantization;
        self
    }

    /// Load options from a TOML file. Missing keys take defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let options: DbOptions = toml::from_str(&content)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
        options.validate()?;
        Ok(options)
    }

    /// Check option constraints. Called by `Db::open`.
    pub fn validate(&self) -> Result<(), String> {
        if self.dimension == 0 {
            return Err("dimension is required and must be > 0".to_string());
        }
        if self.dimension > 65_536 {
            return Err(format!(
                "dimension {} is unreasonably large",
                self.dimension
            ));
        }
        self.hnsw.validate()?;
        if self.quantization.enabled {
            if self.quantization.kind.is_none() {
                return Err("quantization.kind required when quantization.enabled".to_string());
            }
            if !(4..=8).contains(&self.quantization.bits) {
                return Err(format!(
                    "quantization.bits must be in 4..=8, got {}",
                    self.quantization.bits
                ));
            }
            if self.quantization.subvectors == 0
                || self.dimension % self.quantization.subvectors != 0
            {
                return Err(format!(
                    "quantization.subvectors must divide dimension {} evenly, got {}",
                    self.dimension, self.quantization.subvectors
                ));
            }
        }
        Ok(())
    }
}
