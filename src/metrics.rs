//! Counters and histograms for the storage engine
//!
//! Everything here is lock-free atomics so the hot search path pays a few
//! `fetch_add`s at most. `snapshot()` returns a flat map suitable for
//! external scraping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Fixed histogram bucket upper bounds for search latency, in microseconds.
const LATENCY_BOUNDS_US: [u64; 8] = [100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000];

/// Bucket bounds for insert batch sizes (rows per call).
const BATCH_BOUNDS: [u64; 6] = [1, 10, 100, 1_000, 5_000, 50_000];

/// Bucket bounds for HNSW beam fill ratio, in permille of efSearch.
const BEAM_FILL_BOUNDS: [u64; 5] = [200, 400, 600, 800, 1_000];

/// Fixed-bucket histogram. One extra overflow bucket catches values past
/// the last bound.
#[derive(Debug)]
pub(crate) struct Histogram {
    bounds: &'static [u64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [u64]) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, value: u64) {
        let idx = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    fn snapshot_into(&self, prefix: &str, out: &mut BTreeMap<String, u64>) {
        for (i, bucket) in self.buckets.iter().enumerate() {
            let label = if i < self.bounds.len() {
                format!("{prefix}.le_{}", self.bounds[i])
            } else {
                format!("{prefix}.le_inf")
            };
            out.insert(label, bucket.load(Ordering::Relaxed));
        }
        out.insert(format!("{prefix}.count"), self.count.load(Ordering::Relaxed));
        out.insert(format!("{prefix}.sum"), self.sum.load(Ordering::Relaxed));
    }
}

/// Engine-wide counters and histograms.
///
/// One instance lives in the `Db` facade; components receive a reference.
#[derive(Debug)]
pub struct Metrics {
    pub(crate) inserts: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) searches_cache_hit: AtomicU64,
    pub(crate) searches_cache_miss: AtomicU64,
    pub(crate) searches_hnsw: AtomicU64,
    pub(crate) searches_brute: AtomicU64,
    /// Error counts keyed by the tagged error kind (`DbError::kind()`).
    errors: Mutex<BTreeMap<&'static str, u64>>,
    pub(crate) search_latency_us: Histogram,
    pub(crate) insert_batch_size: Histogram,
    pub(crate) beam_fill_permille: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            inserts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            searches_cache_hit: AtomicU64::new(0),
            searches_cache_miss: AtomicU64::new(0),
            searches_hnsw: AtomicU64::new(0),
            searches_brute: AtomicU64::new(0),
            errors: Mutex::new(BTreeMap::new()),
            search_latency_us: Histogram::new(&LATENCY_BOUNDS_US),
            insert_batch_size: Histogram::new(&BATCH_BOUNDS),
            beam_fill_permille: Histogram::new(&BEAM_FILL_BOUNDS),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_error(&self, kind: &'static str) {
        let mut errors = self.errors.lock().expect("metrics mutex poisoned");
        *errors.entry(kind).or_insert(0) += 1;
    }

    /// Total cache hits since open.
    pub fn cache_hits(&self) -> u64 {
        self.searches_cache_hit.load(Ordering::Relaxed)
    }

    /// Total cache misses since open.
    pub fn cache_misses(&self) -> u64 {
        self.searches_cache_miss.load(Ordering::Relaxed)
    }

    /// Cache hit ratio in [0, 1]; 0.0 before any search.
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.cache_hits();
        let total = hits + self.cache_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Flat counter map for external scraping.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        out.insert("inserts".to_string(), self.inserts.load(Ordering::Relaxed));
        out.insert("deletes".to_string(), self.deletes.load(Ordering::Relaxed));
        out.insert(
            "searches.cache_hit".to_string(),
            self.searches_cache_hit.load(Ordering::Relaxed),
        );
        out.insert(
            "searches.cache_miss".to_string(),
            self.searches_cache_miss.load(Ordering::Relaxed),
        );
        out.insert(
            "searches.hnsw".to_string(),
            self.searches_hnsw.load(Ordering::Relaxed),
        );
        out.insert(
            "searches.brute".to_string(),
            self.searches_brute.load(Ordering::Relaxed),
        );
        {
            let errors = self.errors.lock().expect("metrics mutex poisoned");
            for (kind, count) in errors.iter() {
                out.insert(format!("errors.{kind}"), *count);
            }
        }
        self.search_latency_us
            .snapshot_into("search_latency_us", &mut out);
        self.insert_batch_size
            .snapshot_into("insert_batch_size", &mut out);
        self.beam_fill_permille
            .snapshot_into("hnsw_beam_fill_permille", &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_appear_in_snapshot() {
        let m = Metrics::new();
        m.inserts.fetch_add(3, Ordering::Relaxed);
        m.searches_cache_hit.fetch_add(1, Ordering::Relaxed);
        m.searches_cache_miss.fetch_add(1, Ordering::Relaxed);

        let snap = m.snapshot();
        assert_eq!(snap["inserts"], 3);
        assert_eq!(snap["searches.cache_hit"], 1);
        assert_eq!(snap["searches.cache_miss"], 1);
        assert_eq!(snap["deletes"], 0);
    }

    #[test]
    fn test_hit_ratio() {
        let m = Metrics::new();
        assert_eq!(m.cache_hit_ratio(), 0.0);
        m.searches_cache_hit.fetch_add(3, Ordering::Relaxed);
        m.searches_cache_miss.fetch_add(1, Ordering::Relaxed);
        assert!((m.cache_hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_error_kinds() {
        let m = Metrics::new();
        m.record_error("invalid_input");
        m.record_error("invalid_input");
        m.record_error("io");
        let snap = m.snapshot();
        assert_eq!(snap["errors.invalid_input"], 2);
        assert_eq!(snap["errors.io"], 1);
    }

    #[test]
    fn test_histogram_buckets() {
        let m = Metrics::new();
        m.search_latency_us.record(50); // le_100
        m.search_latency_us.record(700); // le_1000
        m.search_latency_us.record(9_999_999); // overflow

        let snap = m.snapshot();
        assert_eq!(snap["search_latency_us.le_100"], 1);
        assert_eq!(snap["search_latency_us.le_1000"], 1);
        assert_eq!(snap["search_latency_us.le_inf"], 1);
        assert_eq!(snap["search_latency_us.count"], 3);
        assert_eq!(snap["search_latency_us.sum"], 50 + 700 + 9_999_999);
    }

    #[test]
    fn test_histogram_bounds_sorted() {
        for bounds in [
            &LATENCY_BOUNDS_US[..],
            &BATCH_BOUNDS[..],
            &BEAM_FILL_BOUNDS[..],
        ] {
            for w in bounds.windows(2) {
                assert!(w[0] < w[1], "bucket bounds must be strictly increasing");
            }
        }
    }
}
