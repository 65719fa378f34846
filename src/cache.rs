//! LRU + TTL query cache
//!
//! Maps a byte-exact query fingerprint to a cached result list. Hits
//! promote the entry to the MRU end in O(1); misses insert and evict the
//! LRU entry past capacity. Every mutation of the store bumps a monotonic
//! generation counter, and entries stamped with an older generation are
//! treated as misses — the cache never serves a result whose underlying
//! data may have changed.
//!
//! A single mutex serializes access; the hit path does only a map lookup,
//! a timestamp check, and the list promotion inside the critical section.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;

use crate::backend::SearchResult;
use crate::config::QueryCacheOptions;
use crate::metric::DistanceMetric;
use crate::store::MetadataFilter;

/// Deterministic, byte-exact cache key.
///
/// Layout: query vector as little-endian IEEE-754 bytes, k as a varint,
/// the metric id byte, the threshold as LE IEEE-754 (NaN sentinel when
/// absent), and the canonical filter serialization (`null` when no filter
/// was supplied, so "no filter" and "empty filter object" differ).
///
/// The derived `Hash` feeds the map; equality is full byte comparison, so
/// hash collisions can never alias two different queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn new(
        query: &[f32],
        k: usize,
        metric: DistanceMetric,
        threshold: Option<f32>,
        filter: Option<&MetadataFilter>,
    ) -> Self {
        let mut bytes = Vec::with_capacity(query.len() * 4 + 16);
        for &x in query {
            bytes.extend_from_slice(&x.to_le_bytes());
        }
        write_varint(&mut bytes, k as u64);
        bytes.push(metric.id());
        bytes.extend_from_slice(&threshold.unwrap_or(f32::NAN).to_le_bytes());
        match filter {
            Some(f) => bytes.extend_from_slice(&f.canonical_bytes()),
            None => bytes.extend_from_slice(b"null"),
        }
        Self(bytes)
    }

    /// Short digest for logging; never used for addressing.
    #[allow(dead_code)]
    pub fn digest(&self) -> String {
        let hash = blake3::hash(&self.0);
        hash.to_hex()[..32].to_string()
    }
}

/// LEB128, matching the usual varint framing.
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct CacheEntry {
    results: Vec<SearchResult>,
    generation: u64,
    inserted_at_ms: i64,
    last_hit_at_ms: i64,
}

/// The cache proper. Owned exclusively by the `Db` facade.
pub(crate) struct QueryCache {
    enabled: bool,
    ttl_ms: i64,
    map: Mutex<LruCache<Fingerprint, CacheEntry>>,
    /// Bumped by every ingest/update/delete; entries from older
    /// generations are unreachable.
    generation: AtomicU64,
}

impl QueryCache {
    pub fn new(options: &QueryCacheOptions) -> Self {
        let capacity = NonZeroUsize::new(options.max_entries.max(1))
            .expect("max(1) is non-zero");
        Self {
            enabled: options.enabled && options.max_entries > 0,
            ttl_ms: options.ttl_ms as i64,
            map: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate everything cached before this point.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Look up a fingerprint. Expired and stale entries are evicted on
    /// the spot and reported as misses.
    pub fn get(&self, key: &Fingerprint) -> Option<Vec<SearchResult>> {
        if !self.enabled {
            return None;
        }
        let now = crate::now_ms();
        let current_gen = self.generation();
        let mut map = self.map.lock().expect("cache mutex poisoned");
        match map.get_mut(key) {
            Some(entry) => {
                if entry.generation < current_gen || now - entry.inserted_at_ms > self.ttl_ms {
                    map.pop(key);
                    return None;
                }
                entry.last_hit_at_ms = now;
                Some(entry.results.clone())
            }
            None => None,
        }
    }

    /// Insert a fresh result list, evicting the LRU entry past capacity.
    pub fn put(&self, key: Fingerprint, results: Vec<SearchResult>) {
        if !self.enabled {
            return;
        }
        let now = crate::now_ms();
        let entry = CacheEntry {
            results,
            generation: self.generation(),
            inserted_at_ms: now,
            last_hit_at_ms: now,
        };
        let mut map = self.map.lock().expect("cache mutex poisoned");
        map.put(key, entry);
    }

    pub fn clear(&self) {
        self.map.lock().expect("cache mutex poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("cache mutex poisoned").len()
    }
}
