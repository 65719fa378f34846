//! HNSW search: greedy descent plus bounded beam search
//!
//! Tombstoned nodes are traversed for routing but never returned.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use super::graph::Graph;
use super::{DistEntry, HnswError, HnswIndex, Neighbor};
use crate::metric::DistanceMetric;

/// Result of one ANN query: neighbors sorted by ascending distance, plus
/// how full the level-0 beam got (permille of ef) for observability.
#[derive(Debug, Clone)]
pub struct IndexSearch {
    pub neighbors: Vec<Neighbor>,
    pub beam_fill_permille: u64,
}

impl HnswIndex {
    /// Approximate k-nearest-neighbor search.
    ///
    /// Callers must have checked that the index state serves queries; a
    /// query against a non-serving state is an internal error, not a
    /// user-facing condition.
    pub fn search(&self, query: &[f32], k: usize) -> Result<IndexSearch, HnswError> {
        if query.len() != self.dimension() {
            return Err(HnswError::DimensionMismatch {
                expected: self.dimension(),
                actual: query.len(),
            });
        }

        let inner = self.read();
        if !inner.state.serves_queries() {
            return Err(HnswError::Internal(format!(
                "search in non-serving state {}",
                inner.state.as_str()
            )));
        }
        let graph = &inner.graph;
        let metric = self.metric();

        let Some(entry) = graph.entry_point else {
            return Ok(IndexSearch {
                neighbors: Vec::new(),
                beam_fill_permille: 0,
            });
        };
        if k == 0 {
            return Ok(IndexSearch {
                neighbors: Vec::new(),
                beam_fill_permille: 0,
            });
        }

        // Adaptive beam: at least ef_search, at least 2k, never more than
        // the live node count (searching wider than the graph is wasted).
        let ef = inner
            .options
            .ef_search
            .max(k * 2)
            .min(graph.live_len().max(1));

        // Greedy descent from the top level down to 1
        let mut ep = entry;
        for level in (1..=graph.max_level).rev() {
            ep = greedy_step(graph, query, ep, level, metric);
        }

        // Beam search at level 0
        let results = search_layer(graph, query, &[ep], ef, 0, metric);
        let beam_fill_permille = (results.len() as u64 * 1000) / ef.max(1) as u64;

        let neighbors = results
            .into_iter()
            .take(k)
            .map(|e| Neighbor {
                id: graph.nodes[e.idx as usize].id.clone(),
                distance: e.dist,
            })
            .collect();

        Ok(IndexSearch {
            neighbors,
            beam_fill_permille,
        })
    }
}

/// Follow the single nearest neighbor at `level` until no hop improves
/// the distance. Tombstoned nodes participate in routing.
pub(crate) fn greedy_step(
    graph: &Graph,
    query: &[f32],
    mut ep: u32,
    level: usize,
    metric: DistanceMetric,
) -> u32 {
    let mut best = metric.distance(query, &graph.vectors[ep as usize]);
    loop {
        let mut improved = false;
        let Some(neighbors) = graph.nodes[ep as usize].neighbors.get(level) else {
            return ep;
        };
        for &n in neighbors {
            let d = metric.distance(query, &graph.vectors[n as usize]);
            if d < best {
                best = d;
                ep = n;
                improved = true;
            }
        }
        if !improved {
            return ep;
        }
    }
}

/// Bounded beam search over one level.
///
/// Maintains a candidate min-heap and a bounded result max-heap of width
/// `ef`, with a visited set so each node is scored once. Returns up to
/// `ef` live nodes sorted by ascending distance; deleted nodes route but
/// are excluded from results.
pub(crate) fn search_layer(
    graph: &Graph,
    query: &[f32],
    entry_points: &[u32],
    ef: usize,
    level: usize,
    metric: DistanceMetric,
) -> Vec<DistEntry> {
    let mut visited: HashSet<u32> = HashSet::new();
    let mut candidates: BinaryHeap<Reverse<DistEntry>> = BinaryHeap::new();
    let mut results: BinaryHeap<DistEntry> = BinaryHeap::new();

    for &ep in entry_points {
        if !visited.insert(ep) {
            continue;
        }
        let entry = DistEntry {
            dist: metric.distance(query, &graph.vectors[ep as usize]),
            idx: ep,
        };
        candidates.push(Reverse(entry));
        if !graph.nodes[ep as usize].deleted {
            results.push(entry);
        }
    }

    while let Some(Reverse(current)) = candidates.pop() {
        // The closest unexplored candidate is already farther than the
        // worst kept result: the beam has converged.
        if results.len() >= ef {
            if let Some(worst) = results.peek() {
                if current.dist > worst.dist {
                    break;
                }
            }
        }

        let Some(neighbors) = graph.nodes[current.idx as usize].neighbors.get(level) else {
            continue;
        };
        for &n in neighbors {
            if !visited.insert(n) {
                continue;
            }
            let d = metric.distance(query, &graph.vectors[n as usize]);
            let keep = results.len() < ef
                || results.peek().map(|w| d < w.dist).unwrap_or(true);
            if keep {
                let entry = DistEntry { dist: d, idx: n };
                candidates.push(Reverse(entry));
                if !graph.nodes[n as usize].deleted {
                    results.push(entry);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
    }

    let mut out = results.into_vec();
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HnswOptions;
    use crate::hnsw::make_test_embedding;
    use crate::hnsw::IndexState;

    fn options() -> HnswOptions {
        HnswOptions {
            m: 8,
            m0: 16,
            ef_construction: 64,
            ef_search: 32,
            min_vectors_for_index: 1,
            ..Default::default()
        }
    }

    fn build(n: u32) -> HnswIndex {
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        let items: Vec<(String, Vec<f32>)> = (0..n)
            .map(|i| (format!("v{i:04}"), make_test_embedding(16, i)))
            .collect();
        index.build_from(items, None).unwrap();
        index
    }

    #[test]
    fn test_search_finds_exact_match() {
        let index = build(100);
        let query = make_test_embedding(16, 42);
        let found = index.search(&query, 5).unwrap();
        assert!(!found.neighbors.is_empty());
        assert_eq!(found.neighbors[0].id, "v0042");
        assert!(found.neighbors[0].distance < 1e-5);
    }

    #[test]
    fn test_search_k_zero() {
        let index = build(10);
        let found = index.search(&make_test_embedding(16, 1), 0).unwrap();
        assert!(found.neighbors.is_empty());
    }

    #[test]
    fn test_search_empty_graph() {
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        index.set_state(IndexState::Ready);
        let found = index.search(&make_test_embedding(16, 1), 5).unwrap();
        assert!(found.neighbors.is_empty());
    }

    #[test]
    fn test_search_wrong_dimension() {
        let index = build(10);
        assert!(matches!(
            index.search(&[0.0; 3], 5),
            Err(HnswError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_search_excludes_tombstones() {
        let index = build(50);
        let query = make_test_embedding(16, 7);
        assert_eq!(index.search(&query, 1).unwrap().neighbors[0].id, "v0007");

        index.remove("v0007");
        let after = index.search(&query, 5).unwrap();
        assert!(after.neighbors.iter().all(|n| n.id != "v0007"));
    }

    #[test]
    fn test_results_sorted_by_distance() {
        let index = build(200);
        let found = index.search(&make_test_embedding(16, 3), 10).unwrap();
        for pair in found.neighbors.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_search_in_seeded_state_is_internal_error() {
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        assert!(matches!(
            index.search(&make_test_embedding(16, 1), 5),
            Err(HnswError::Internal(_))
        ));
    }
}
