//! HNSW graph construction
//!
//! Implements the standard insertion algorithm: draw a level from the
//! geometric distribution, greedy-descend from the entry point to the
//! insertion level, then beam-search each level down to 0 collecting
//! candidates, link with the diversity heuristic, and prune symmetrically
//! when a neighbor overflows its degree cap.
//!
//! Construction happens entirely in RAM under the write lock; durable
//! writes are batched by `persist.rs`, never issued inline with traversal.

use super::graph::Graph;
use super::search::{greedy_step, search_layer};
use super::{DistEntry, HnswError, HnswIndex, IndexState};
use crate::cancel::CancellationToken;
use crate::metric::DistanceMetric;

impl HnswIndex {
    /// Insert a batch of (record id, embedding) pairs into the graph.
    ///
    /// The whole batch runs under one write-lock acquisition; searches see
    /// either the graph before the batch or after it. Re-inserting an id
    /// that was tombstoned creates a fresh node; the tombstone stays for
    /// routing until the next rebuild.
    ///
    /// Fails with `BudgetExhausted` (before touching the graph) when the
    /// batch would push the resident working set past the configured
    /// memory budget — the caller falls back to exact search.
    ///
    /// Returns the number of nodes inserted.
    pub fn insert_batch(
        &self,
        items: &[(String, Vec<f32>)],
        cancel: Option<&CancellationToken>,
    ) -> Result<usize, HnswError> {
        for (_, vector) in items {
            if vector.len() != self.dimension() {
                return Err(HnswError::DimensionMismatch {
                    expected: self.dimension(),
                    actual: vector.len(),
                });
            }
        }

        let metric = self.metric();
        let mut inner = self.write();
        let level_mult = inner.options.level_mult();
        let (m, m0, ef_construction) = (
            inner.options.m,
            inner.options.m0,
            inner.options.ef_construction,
        );

        let budget = inner.options.memory_budget_bytes;
        let batch_bytes: usize = items
            .iter()
            .map(|(_, v)| v.len() * std::mem::size_of::<f32>())
            .sum();
        if (inner.graph.resident_bytes + batch_bytes) as u64 > budget {
            return Err(HnswError::BudgetExhausted { budget });
        }

        let mut inserted = 0usize;
        for (id, vector) in items {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    tracing::info!(inserted, "HNSW batch insert cancelled");
                    return Err(HnswError::Cancelled);
                }
            }
            // A live node under this id means the record is already
            // indexed; skip rather than create a duplicate.
            if let Some(&existing) = inner.graph.by_id.get(id) {
                if !inner.graph.nodes[existing as usize].deleted {
                    continue;
                }
            }
            let level = self.draw_level(level_mult);
            let idx = inner.graph.push_node(id.clone(), level, vector.clone())?;
            insert_node(&mut inner.graph, idx, metric, m, m0, ef_construction);
            inserted += 1;
        }

        tracing::debug!(
            inserted,
            total = inner.graph.len(),
            "HNSW batch insert complete"
        );
        Ok(inserted)
    }

    /// Build (or rebuild) the graph from scratch over `rows`.
    ///
    /// Transitions to Building for the duration; exact fallback remains
    /// available to the backend while this runs.
    pub fn build_from(
        &self,
        rows: Vec<(String, Vec<f32>)>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), HnswError> {
        self.set_state(IndexState::Building);
        self.write().graph.clear();

        // Chunked so cancellation is honored between chunks
        const BUILD_CHUNK: usize = 5_000;
        for chunk in rows.chunks(BUILD_CHUNK) {
            match self.insert_batch(chunk, cancel) {
                Ok(_) => {}
                Err(e) => {
                    // A partial graph must not serve queries
                    self.clear();
                    return Err(e);
                }
            }
        }

        self.set_state(IndexState::Ready);
        tracing::info!(nodes = self.len(), "HNSW graph built");
        Ok(())
    }
}

/// Insert an already-pushed node into the graph structure.
fn insert_node(
    graph: &mut Graph,
    idx: u32,
    metric: DistanceMetric,
    m: usize,
    m0: usize,
    ef_construction: usize,
) {
    let level = graph.nodes[idx as usize].level;

    let Some(entry) = graph.entry_point else {
        graph.entry_point = Some(idx);
        graph.max_level = level;
        return;
    };

    let query = graph.vectors[idx as usize].clone();

    // Phase 1: greedy descent through the levels above the node's level,
    // following the single nearest neighbor at each hop.
    let mut ep = entry;
    let top = graph.max_level;
    for l in ((level + 1)..=top).rev() {
        ep = greedy_step(graph, &query, ep, l, metric);
    }

    // Phase 2: beam search from `min(level, top)` down to 0; link at each
    // level the node participates in.
    let mut entry_points = vec![ep];
    for l in (0..=level.min(top)).rev() {
        let candidates = search_layer(graph, &query, &entry_points, ef_construction, l, metric);
        let cap = if l == 0 { m0 } else { m };
        let selected = select_neighbors(graph, &candidates, cap, metric);

        for &neighbor in &selected {
            link(graph, idx, neighbor, l);
            let neighbor_cap = if l == 0 { m0 } else { m };
            if graph.nodes[neighbor as usize].neighbors[l].len() > neighbor_cap {
                prune_node(graph, neighbor, l, neighbor_cap, metric);
            }
        }

        entry_points = candidates.iter().map(|c| c.idx).collect();
        if entry_points.is_empty() {
            entry_points = vec![ep];
        }
    }

    // Phase 3: a node drawn above the current top becomes the entry point.
    if level > graph.max_level {
        graph.max_level = level;
        graph.entry_point = Some(idx);
    }
}

/// The standard HNSW diversity heuristic: walk candidates in ascending
/// distance order and accept one only if it is closer to the query node
/// than to any already-accepted neighbor. Slots left over are padded with
/// the nearest rejected candidates (keep-pruned-connections).
fn select_neighbors(
    graph: &Graph,
    candidates: &[DistEntry],
    cap: usize,
    metric: DistanceMetric,
) -> Vec<u32> {
    let mut selected: Vec<DistEntry> = Vec::with_capacity(cap);
    let mut rejected: Vec<u32> = Vec::new();

    for c in candidates {
        if selected.len() >= cap {
            break;
        }
        let c_vec = &graph.vectors[c.idx as usize];
        let diverse = selected.iter().all(|s| {
            metric.distance(c_vec, &graph.vectors[s.idx as usize]) > c.dist
        });
        if diverse {
            selected.push(*c);
        } else {
            rejected.push(c.idx);
        }
    }

    let mut out: Vec<u32> = selected.iter().map(|s| s.idx).collect();
    for idx in rejected {
        if out.len() >= cap {
            break;
        }
        out.push(idx);
    }
    out
}

/// Create the bidirectional edge pair (no-ops on duplicates/self-edges).
fn link(graph: &mut Graph, a: u32, b: u32, level: usize) {
    if a == b {
        return;
    }
    let a_list = &mut graph.nodes[a as usize].neighbors[level];
    if !a_list.contains(&b) {
        a_list.push(b);
    }
    let b_list = &mut graph.nodes[b as usize].neighbors[level];
    if !b_list.contains(&a) {
        b_list.push(a);
    }
}

/// Re-select an overflowing node's neighbors with the same heuristic and
/// drop the reverse edges of evicted peers, keeping the graph strictly
/// bidirectional.
fn prune_node(graph: &mut Graph, idx: u32, level: usize, cap: usize, metric: DistanceMetric) {
    let own_vec = graph.vectors[idx as usize].clone();
    let mut candidates: Vec<DistEntry> = graph.nodes[idx as usize].neighbors[level]
        .iter()
        .map(|&n| DistEntry {
            dist: metric.distance(&own_vec, &graph.vectors[n as usize]),
            idx: n,
        })
        .collect();
    candidates.sort_unstable();

    let keep = select_neighbors(graph, &candidates, cap, metric);
    let keep_set: std::collections::HashSet<u32> = keep.iter().copied().collect();

    let dropped: Vec<u32> = candidates
        .iter()
        .map(|c| c.idx)
        .filter(|n| !keep_set.contains(n))
        .collect();

    graph.nodes[idx as usize].neighbors[level] = keep;
    for &peer in &dropped {
        graph.nodes[peer as usize].neighbors[level].retain(|&x| x != idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HnswOptions;
    use crate::hnsw::make_test_embedding;

    fn small_options() -> HnswOptions {
        HnswOptions {
            m: 4,
            m0: 8,
            ef_construction: 32,
            ef_search: 16,
            min_vectors_for_index: 1,
            ..Default::default()
        }
    }

    fn build_index(n: u32) -> HnswIndex {
        let index = HnswIndex::new(small_options(), DistanceMetric::Cosine, 16);
        let items: Vec<(String, Vec<f32>)> = (0..n)
            .map(|i| (format!("v{i:04}"), make_test_embedding(16, i)))
            .collect();
        index.build_from(items, None).unwrap();
        index
    }

    #[test]
    fn test_build_satisfies_invariants() {
        let index = build_index(200);
        assert_eq!(index.state(), IndexState::Ready);
        assert_eq!(index.len(), 200);
        index.debug_validate().unwrap();
    }

    #[test]
    fn test_single_node_graph() {
        let index = build_index(1);
        index.debug_validate().unwrap();
        let inner = index.read();
        assert_eq!(inner.graph.entry_point, Some(0));
        assert_eq!(inner.graph.edge_count(), 0);
    }

    #[test]
    fn test_insert_batch_rejects_wrong_dimension() {
        let index = HnswIndex::new(small_options(), DistanceMetric::Cosine, 16);
        let err = index
            .insert_batch(&[("bad".to_string(), vec![0.0; 4])], None)
            .unwrap_err();
        assert!(matches!(
            err,
            HnswError::DimensionMismatch {
                expected: 16,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_duplicate_insert_is_skipped() {
        let index = build_index(10);
        let before = index.len();
        index
            .insert_batch(
                &[("v0001".to_string(), make_test_embedding(16, 1))],
                None,
            )
            .unwrap();
        assert_eq!(index.len(), before);
    }

    #[test]
    fn test_cancelled_build_leaves_no_graph() {
        let index = HnswIndex::new(small_options(), DistanceMetric::Cosine, 16);
        let token = CancellationToken::new();
        token.cancel();
        let items: Vec<(String, Vec<f32>)> = (0..50)
            .map(|i| (format!("v{i}"), make_test_embedding(16, i)))
            .collect();
        let err = index.build_from(items, Some(&token)).unwrap_err();
        assert!(matches!(err, HnswError::Cancelled));
        assert_eq!(index.len(), 0);
        assert_ne!(index.state(), IndexState::Ready);
    }

    #[test]
    fn test_insert_batch_respects_memory_budget() {
        // Budget fits one 16-dim vector (64 bytes) but not two
        let options = HnswOptions {
            memory_budget_bytes: 100,
            ..small_options()
        };
        let index = HnswIndex::new(options, DistanceMetric::Cosine, 16);
        index
            .insert_batch(&[("a".to_string(), make_test_embedding(16, 1))], None)
            .unwrap();
        let err = index
            .insert_batch(&[("b".to_string(), make_test_embedding(16, 2))], None)
            .unwrap_err();
        assert!(matches!(err, HnswError::BudgetExhausted { budget: 100 }));
        // The refused batch left the graph untouched
        assert_eq!(index.len(), 1);
        assert_eq!(index.stats().resident_vector_bytes, 64);
    }

    #[test]
    fn test_resident_bytes_tracked() {
        let index = build_index(50);
        assert_eq!(index.stats().resident_vector_bytes, 50 * 16 * 4);
        index.clear();
        assert_eq!(index.stats().resident_vector_bytes, 0);
    }

    #[test]
    fn test_entry_point_has_max_level() {
        let index = build_index(300);
        let inner = index.read();
        let ep = inner.graph.entry_point.unwrap();
        let max = inner.graph.nodes.iter().map(|n| n.level).max().unwrap();
        assert_eq!(inner.graph.nodes[ep as usize].level, max);
    }

    #[test]
    fn test_reinsert_after_tombstone() {
        let index = build_index(20);
        assert!(index.remove("v0003"));
        index
            .insert_batch(
                &[("v0003".to_string(), make_test_embedding(16, 3))],
                None,
            )
            .unwrap();
        // Live again, tombstone still counted in the arena
        let inner = index.read();
        assert_eq!(inner.graph.tombstones, 1);
        let idx = inner.graph.by_id["v0003"];
        assert!(!inner.graph.nodes[idx as usize].deleted);
    }
}
