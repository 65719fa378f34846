//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::TestDb;
//! ```

#![allow(dead_code)]

use agentdb::{Db, DbOptions, HnswOptions, VectorRecord};
use tempfile::TempDir;

/// Test database with automatic cleanup
///
/// Wraps a `Db` with its backing `TempDir`, ensuring the directory lives
/// as long as the database is in use.
pub struct TestDb {
    pub db: Db,
    /// Temp directory (kept alive to prevent cleanup)
    _dir: TempDir,
}

/// Install a test subscriber once so `RUST_LOG=agentdb=debug cargo test`
/// shows engine traces.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestDb {
    /// File-backed database with the given dimension, HNSW on defaults.
    pub fn new(dimension: usize) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("agent.db");
        let options = DbOptions::new(dimension).with_path(path.to_string_lossy().to_string());
        let db = Db::open(options).expect("Failed to open db");
        Self { db, _dir: dir }
    }

    /// Open with fully custom options. The path is always overridden to
    /// a file in the temp directory so `reopen` round-trips work.
    pub fn with_options(mut options: DbOptions) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("agent.db");
        options.path = path.to_string_lossy().to_string();
        let db = Db::open(options).expect("Failed to open db");
        Self { db, _dir: dir }
    }

    /// The database file path (for reopen tests).
    pub fn path(&self) -> String {
        self._dir
            .path()
            .join("agent.db")
            .to_string_lossy()
            .to_string()
    }

    /// Reopen the same file with the same options.
    pub fn reopen(self, options: DbOptions) -> Self {
        let TestDb { db, _dir } = self;
        drop(db);
        let path = _dir.path().join("agent.db");
        let options = options.with_path(path.to_string_lossy().to_string());
        let db = Db::open(options).expect("Failed to reopen db");
        Self { db, _dir }
    }
}

impl std::ops::Deref for TestDb {
    type Target = Db;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Deterministic normalized embedding from a seed. Same seed = same
/// direction = high similarity; different seeds diverge.
pub fn seeded_embedding(dim: usize, seed: u32) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    for (i, val) in v.iter_mut().enumerate() {
        *val = ((seed as f32 * 0.1) + (i as f32 * 0.001)).sin();
    }
    normalize(&mut v);
    v
}

/// Pseudo-random unit vector from a seed (xorshift, no rand dependency
/// in the fixture).
pub fn random_unit(dim: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).max(1);
    let mut v = Vec::with_capacity(dim);
    for _ in 0..dim {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let x = (state as f64 / u64::MAX as f64) as f32 * 2.0 - 1.0;
        v.push(x);
    }
    normalize(&mut v);
    v
}

pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v {
            *x /= norm;
        }
    }
}

/// A record with a fixed id and a seeded embedding.
pub fn seeded_record(dim: usize, seed: u32) -> VectorRecord {
    VectorRecord::new(seeded_embedding(dim, seed)).with_id(format!("rec{seed:05}"))
}

/// HNSW options tuned for small test corpora: index activates at one
/// record and builds quickly.
pub fn small_hnsw() -> HnswOptions {
    HnswOptions {
        m: 8,
        m0: 16,
        ef_construction: 64,
        ef_search: 32,
        min_vectors_for_index: 10,
        ..Default::default()
    }
}

/// Exact cosine similarity (f64 accumulation) for ground-truth checks.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f64 = a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum();
    let na: f64 = a.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)) as f32
    }
}
