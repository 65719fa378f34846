//! # agentdb - Embedded Vector Database for Agents
//!
//! Stores high-dimensional embeddings with arbitrary JSON metadata in a
//! single SQLite file, serves approximate nearest-neighbor queries through
//! an HNSW index, and layers a cognitive memory API (patterns, experiences,
//! memory collapse, context synthesis) on top of the store.
//!
//! ## Features
//!
//! - **Durable vector store**: WAL-journaled SQLite, batched ingest at
//!   100k+ rows/sec, read-your-writes semantics
//! - **HNSW index**: multi-layer proximity graph persisted inside the
//!   database; in-RAM working set bounded by a configurable memory
//!   budget; exact brute-force fallback below a configurable threshold
//! - **Quantization**: scalar (4x), product (up to ~400x), and binary (32x)
//!   codecs on a dedicated column, never replacing the original embedding
//! - **Query cache**: LRU + TTL keyed by a byte-exact query fingerprint,
//!   invalidated by a generation counter on every mutation
//! - **Cognitive layer**: rolling pattern statistics, scored experiences,
//!   centroid memory collapse, parallel context synthesis
//!
//! ## Quick Start
//!
//! ```no_run
//! use agentdb::{Db, DbOptions, VectorRecord};
//!
//! # fn main() -> anyhow::Result<()> {
//! let db = Db::open(DbOptions::new(384).with_path("agent.db"))?;
//!
//! let id = db.insert(VectorRecord::new(vec![0.1; 384]))?;
//! let results = db.search(&vec![0.1; 384], 5)?;
//! assert_eq!(results[0].id, id);
//! # Ok(())
//! # }
//! ```
//!
// Public library API modules
pub mod backend;
pub mod cancel;
pub mod codec;
pub mod cognitive;
pub mod config;
pub mod hnsw;
pub mod metric;
pub mod metrics;
pub mod store;

// Internal modules - the cache is owned by the Db facade and not exposed
// directly; its types surface only through `Db::stats()`.
pub(crate) mod cache;

pub use backend::{Db, DbStats, SearchOptions, SearchResult};
pub use cancel::{CancellationToken, Deadline};
pub use codec::VectorCodec;
pub use cognitive::context::{Context, ContextQuery, ContextSynthesizer};
pub use cognitive::experiences::{
    Experience, ExperienceCurator, ExperienceFilter, ExperienceMatch, NewExperience,
};
pub use cognitive::optimizer::{CollapseReport, CollapseStrategy, MemoryNode, MemoryOptimizer};
pub use cognitive::patterns::{
    NewPattern, Pattern, PatternFilter, PatternMatch, PatternMatcher, PatternStats, PatternUpdate,
};
pub use config::{DbOptions, HnswOptions, QuantizationKind, QuantizationOptions, QueryCacheOptions};
pub use hnsw::IndexState;
pub use metric::DistanceMetric;
pub use metrics::Metrics;
pub use store::{MetadataFilter, RecordMeta, Store, StoredRecord, VectorRecord};

/// Unified error type for all public operations.
///
/// Every variant is a tagged kind a caller can match on; per-module errors
/// (store, index, codec) are classified into these kinds at the API
/// boundary. Validation errors are returned before any side effect.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Malformed vector, out-of-range k, unknown metric, bad filter.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Embedding dimension differs from the store's fixed dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Id absent on get/update/delete.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-id or version collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invariant violation detected on open or traversal. The ANN path is
    /// disabled for the session; reads continue via brute force.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    /// Database was created by a newer schema than this build supports.
    #[error("schema version {found} is newer than supported {supported}")]
    SchemaIncompatible { found: i32, supported: i32 },

    /// Underlying storage is out of space.
    #[error("storage full: {0}")]
    StorageFull(String),

    /// Disk or database failure after exhausting retries.
    #[error("io error: {0}")]
    Io(String),

    /// Operation was cancelled at a chunk boundary.
    #[error("operation cancelled")]
    Cancelled,

    /// Per-call deadline expired before completion.
    #[error("operation timed out")]
    Timeout,

    /// Last-resort wrapper. Must never surface for conditions the caller
    /// could have validated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Stable snake_case kind label, used as the metrics error key.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::InvalidInput(_) => "invalid_input",
            DbError::DimensionMismatch { .. } => "dimension_mismatch",
            DbError::NotFound(_) => "not_found",
            DbError::Conflict(_) => "conflict",
            DbError::IndexCorrupt(_) => "index_corrupt",
            DbError::SchemaIncompatible { .. } => "schema_incompatible",
            DbError::StorageFull(_) => "storage_full",
            DbError::Io(_) => "io",
            DbError::Cancelled => "cancelled",
            DbError::Timeout => "timeout",
            DbError::Internal(_) => "internal",
        }
    }
}

impl From<store::StoreError> for DbError {
    fn from(e: store::StoreError) -> Self {
        use store::StoreError;
        match e {
            StoreError::DimensionMismatch { expected, actual } => {
                DbError::DimensionMismatch { expected, actual }
            }
            StoreError::NotFound(id) => DbError::NotFound(id),
            StoreError::Conflict(id) => DbError::Conflict(id),
            StoreError::SchemaNewerThanSupported { found, supported } => {
                DbError::SchemaIncompatible { found, supported }
            }
            StoreError::MigrationNotSupported(from, to) => DbError::SchemaIncompatible {
                found: from,
                supported: to,
            },
            StoreError::StorageFull(msg) => DbError::StorageFull(msg),
            StoreError::Cancelled => DbError::Cancelled,
            StoreError::Database(e) => DbError::Io(e.to_string()),
            StoreError::Io(e) => DbError::Io(e.to_string()),
            StoreError::Runtime(msg) => DbError::Internal(msg),
            StoreError::Corrupt(msg) => DbError::IndexCorrupt(msg),
        }
    }
}

impl From<hnsw::HnswError> for DbError {
    fn from(e: hnsw::HnswError) -> Self {
        use hnsw::HnswError;
        match e {
            HnswError::DimensionMismatch { expected, actual } => {
                DbError::DimensionMismatch { expected, actual }
            }
            HnswError::Corrupt(msg) => DbError::IndexCorrupt(msg),
            HnswError::Store(e) => DbError::from(e),
            HnswError::Cancelled => DbError::Cancelled,
            // A resource bound the caller cannot validate away
            HnswError::BudgetExhausted { budget } => DbError::Internal(format!(
                "index working set would exceed hnsw.memory_budget_bytes ({budget} bytes)"
            )),
            HnswError::Internal(msg) => DbError::Internal(msg),
        }
    }
}

impl From<codec::CodecError> for DbError {
    fn from(e: codec::CodecError) -> Self {
        use codec::CodecError;
        match e {
            CodecError::DimensionMismatch { expected, actual } => {
                DbError::DimensionMismatch { expected, actual }
            }
            CodecError::InvalidBlob(msg) => DbError::IndexCorrupt(msg),
            CodecError::NotTrained => {
                DbError::InvalidInput("quantizer has not been trained".to_string())
            }
            CodecError::InsufficientSample { needed, got } => DbError::InvalidInput(format!(
                "quantizer training needs >= {needed} vectors, got {got}"
            )),
        }
    }
}

/// Current epoch time in milliseconds. Single clock source for record
/// timestamps, cache epochs, and collapse windows.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a new time-ordered record id (uuid v7, lexically sortable).
pub(crate) fn new_record_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_labels_are_stable() {
        assert_eq!(DbError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(DbError::Cancelled.kind(), "cancelled");
        assert_eq!(DbError::Timeout.kind(), "timeout");
        assert_eq!(
            DbError::DimensionMismatch {
                expected: 3,
                actual: 4
            }
            .kind(),
            "dimension_mismatch"
        );
    }

    #[test]
    fn test_record_ids_are_lexically_sortable() {
        let a = new_record_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_record_id();
        assert!(a < b, "uuid v7 ids must sort by creation time: {a} vs {b}");
    }

    #[test]
    fn test_store_error_classification() {
        let e = store::StoreError::DimensionMismatch {
            expected: 384,
            actual: 3,
        };
        match DbError::from(e) {
            DbError::DimensionMismatch { expected, actual } => {
                assert_eq!(expected, 384);
                assert_eq!(actual, 3);
            }
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
    }
}
