//! Store helper types and embedding byte conversion

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version for database migrations
///
/// Increment this when changing the database schema. Store::open() checks
/// this against the stored version and migrates forward when possible.
///
/// History:
/// - v1: Current (vectors, hnsw graph, cognitive tables)
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Row kind tags in the `vectors` table.
pub(crate) const KIND_RECORD: &str = "record";
pub(crate) const KIND_PATTERN: &str = "pattern";
pub(crate) const KIND_EXPERIENCE: &str = "experience";
pub(crate) const KIND_MEMORY_NODE: &str = "memory_node";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("dimension mismatch: store expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("id collision: {0}")]
    Conflict(String),
    #[error("database schema is v{found}, this build supports up to v{supported}")]
    SchemaNewerThanSupported { found: i32, supported: i32 },
    #[error("no migration path from schema v{0} to v{1}")]
    MigrationNotSupported(i32, i32),
    #[error("storage full: {0}")]
    StorageFull(String),
    #[error("stored data corrupt: {0}")]
    Corrupt(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// A record to insert: embedding plus optional metadata.
///
/// The id is assigned at insert time (time-ordered, lexically sortable)
/// unless one is supplied, in which case an existing id is a `Conflict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Caller-chosen id; `None` means generate one.
    pub id: Option<String>,
    /// The embedding. Length must equal the store dimension.
    pub embedding: Vec<f32>,
    /// Opaque JSON metadata bag.
    pub metadata: Option<serde_json::Value>,
}

impl VectorRecord {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            id: None,
            embedding,
            metadata: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A record read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    /// Precomputed L2 norm, written at ingest.
    pub norm: f32,
    pub metadata: Option<serde_json::Value>,
    /// Creation time, milliseconds since epoch.
    pub created_at_ms: i64,
}

/// Metadata-only view used by `scan` (no embedding decode).
#[derive(Debug, Clone)]
pub struct RecordMeta {
    pub id: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at_ms: i64,
}

/// Equality filter over top-level metadata keys.
///
/// All listed keys must be present and equal for a record to match. The
/// canonical byte form (sorted keys, stable serialization) doubles as the
/// filter component of cache fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    fields: BTreeMap<String, serde_json::Value>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eq(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when the record's metadata satisfies every constraint.
    pub fn matches(&self, metadata: Option<&serde_json::Value>) -> bool {
        if self.fields.is_empty() {
            return true;
        }
        let Some(serde_json::Value::Object(map)) = metadata else {
            return false;
        };
        self.fields
            .iter()
            .all(|(k, v)| map.get(k).is_some_and(|actual| actual == v))
    }

    /// Canonical serialization: BTreeMap ordering gives sorted keys, and
    /// serde_json's default map is itself ordered, so nested objects are
    /// canonical too.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }
}

// ============ Embedding Serialization ============

/// Pack an embedding as little-endian IEEE-754 f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode embedding bytes into an owned Vec, validating the length against
/// the store dimension. Corrupted or truncated blobs are surfaced rather
/// than silently skipped because a wrong-length embedding in `vectors`
/// means the row itself is damaged.
pub fn bytes_to_embedding(bytes: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != dimension * 4 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob is {} bytes, expected {} for dimension {}",
            bytes.len(),
            dimension * 4,
            dimension
        )));
    }
    if (bytes.as_ptr() as usize) % std::mem::align_of::<f32>() == 0 {
        Ok(bytemuck::cast_slice::<u8, f32>(bytes).to_vec())
    } else {
        // SQLite blobs are not guaranteed aligned; fall back to a copy.
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_embedding_bytes_round_trip() {
        let v = vec![1.0f32, -2.5, 0.0, f32::MIN_POSITIVE];
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes.len(), 16);
        let back = bytes_to_embedding(&bytes, 4).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_bytes_to_embedding_rejects_bad_length() {
        let bytes = vec![0u8; 10];
        assert!(matches!(
            bytes_to_embedding(&bytes, 4),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_unaligned_decode() {
        // Slice at an odd offset so the pointer is misaligned for f32
        let v = vec![3.5f32, -1.25];
        let mut bytes = vec![0u8];
        bytes.extend(embedding_to_bytes(&v));
        let back = bytes_to_embedding(&bytes[1..], 2).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_metadata_filter_matches() {
        let filter = MetadataFilter::new()
            .with_eq("kind", json!("pattern"))
            .with_eq("domain", json!("coding"));

        let m = json!({"kind": "pattern", "domain": "coding", "extra": 1});
        assert!(filter.matches(Some(&m)));

        let wrong = json!({"kind": "pattern", "domain": "ops"});
        assert!(!filter.matches(Some(&wrong)));

        assert!(!filter.matches(None));
        assert!(MetadataFilter::new().matches(None));
    }

    #[test]
    fn test_metadata_filter_canonical_ordering() {
        let a = MetadataFilter::new()
            .with_eq("b", json!(2))
            .with_eq("a", json!(1));
        let b = MetadataFilter::new()
            .with_eq("a", json!(1))
            .with_eq("b", json!(2));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }
}
