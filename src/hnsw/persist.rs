//! HNSW graph persistence (flush/load through the relational store)
//!
//! The durable graph is always the compacted view: live nodes and the
//! edges between live nodes. In-memory tombstones keep routing until a
//! rebuild, but never reach disk — a freshly loaded graph starts with
//! zero tombstones.
//!
//! A blake3 checksum of the canonical adjacency stream is stored in
//! `hnsw_meta` on every flush and verified on load; a mismatch (or any
//! invariant violation) surfaces as `Corrupt`, which disables the ANN
//! path for the session while brute-force reads continue.

use std::collections::HashMap;

use super::graph::Graph;
use super::{HnswError, HnswIndex, IndexState};
use crate::store::Store;

/// Edge-insert batching: 4 binds per row, comfortably under SQLite's
/// 999-parameter limit.
const EDGE_INSERT_BATCH: usize = 200;

/// Meta keys in `hnsw_meta`.
const META_ENTRY_POINT: &str = "entry_point";
const META_MAX_LEVEL: &str = "max_level";
const META_NODE_COUNT: &str = "node_count";
const META_CHECKSUM: &str = "checksum";
const META_M: &str = "m";
const META_M0: &str = "m0";
const META_EF_CONSTRUCTION: &str = "ef_construction";
const META_DIMENSION: &str = "dimension";
const META_METRIC_ID: &str = "metric_id";

impl HnswIndex {
    /// Flush the graph to the store in a single transaction.
    ///
    /// The whole durable image is rewritten: node rows, live-live edges,
    /// parameters, entry point, and the adjacency checksum. Called after
    /// each insertion batch; per-vector writes inline with traversal are
    /// deliberately not supported.
    pub fn flush(&self, store: &Store) -> Result<(), HnswError> {
        let mut inner = self.write();
        let metric = self.metric();

        // Durable rows computed from the live subgraph
        let mut node_rows: Vec<(u32, String, usize)> = Vec::new();
        let mut edge_rows: Vec<(u32, u32, usize, f32)> = Vec::new();
        for (idx, node) in inner.graph.nodes.iter().enumerate() {
            if node.deleted {
                continue;
            }
            let idx = idx as u32;
            node_rows.push((idx, node.id.clone(), node.level));
            for (level, neighbors) in node.neighbors.iter().enumerate() {
                for &n in neighbors {
                    if inner.graph.nodes[n as usize].deleted {
                        continue;
                    }
                    let distance = metric.distance(
                        &inner.graph.vectors[idx as usize],
                        &inner.graph.vectors[n as usize],
                    );
                    edge_rows.push((idx, n, level, distance));
                }
            }
        }

        let checksum = durable_checksum(&node_rows, &edge_rows);
        // A tombstoned entry point is an in-memory routing aid only; the
        // durable image must reference live nodes exclusively.
        let entry = inner
            .graph
            .entry_point
            .filter(|&e| !inner.graph.nodes[e as usize].deleted);
        let max_level = inner.graph.max_level;
        let options = inner.options.clone();

        store.with_retry("hnsw_flush", || {
            store.rt.block_on(async {
                let mut tx = store.pool.begin().await?;
                sqlx::query("DELETE FROM hnsw_edges").execute(&mut *tx).await?;
                sqlx::query("DELETE FROM hnsw_nodes").execute(&mut *tx).await?;

                for (idx, vector_id, level) in &node_rows {
                    sqlx::query(
                        "INSERT INTO hnsw_nodes (id, vector_id, level) VALUES (?1, ?2, ?3)",
                    )
                    .bind(*idx as i64)
                    .bind(vector_id)
                    .bind(*level as i64)
                    .execute(&mut *tx)
                    .await?;
                }

                for batch in edge_rows.chunks(EDGE_INSERT_BATCH) {
                    let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
                        "INSERT INTO hnsw_edges (from_id, to_id, level, distance) ",
                    );
                    builder.push_values(batch.iter(), |mut b, (from, to, level, distance)| {
                        b.push_bind(*from as i64)
                            .push_bind(*to as i64)
                            .push_bind(*level as i64)
                            .push_bind(*distance);
                    });
                    builder.build().execute(&mut *tx).await?;
                }

                let meta: Vec<(&str, String)> = vec![
                    (
                        META_ENTRY_POINT,
                        entry.map(|e| e.to_string()).unwrap_or_default(),
                    ),
                    (META_MAX_LEVEL, max_level.to_string()),
                    (META_NODE_COUNT, node_rows.len().to_string()),
                    (META_CHECKSUM, checksum.clone()),
                    (META_M, options.m.to_string()),
                    (META_M0, options.m0.to_string()),
                    (META_EF_CONSTRUCTION, options.ef_construction.to_string()),
                    (META_DIMENSION, self.dimension().to_string()),
                    (META_METRIC_ID, metric.id().to_string()),
                ];
                for (key, value) in meta {
                    sqlx::query("INSERT OR REPLACE INTO hnsw_meta (key, value) VALUES (?1, ?2)")
                        .bind(key)
                        .bind(value)
                        .execute(&mut *tx)
                        .await?;
                }

                tx.commit().await?;
                Ok(())
            })
        })?;

        drop(inner);
        tracing::debug!(
            nodes = node_rows.len(),
            edges = edge_rows.len(),
            "HNSW graph flushed"
        );
        Ok(())
    }

    /// Remove one tombstoned node from the durable image in a small
    /// transaction: its node row, every incident edge, and the refreshed
    /// meta rows (count, entry point, checksum). The in-memory tombstone
    /// keeps routing until the next rebuild.
    pub fn flush_remove(&self, store: &Store, id: &str) -> Result<(), HnswError> {
        let mut inner = self.write();
        let metric = self.metric();
        let Some(&removed_idx) = inner.graph.by_id.get(id) else {
            return Ok(());
        };

        // Durable image after removal: live nodes, live-live edges
        let mut node_rows: Vec<(u32, String, usize)> = Vec::new();
        let mut edge_rows: Vec<(u32, u32, usize, f32)> = Vec::new();
        for (idx, node) in inner.graph.nodes.iter().enumerate() {
            if node.deleted {
                continue;
            }
            let idx = idx as u32;
            node_rows.push((idx, node.id.clone(), node.level));
            for (level, neighbors) in node.neighbors.iter().enumerate() {
                for &n in neighbors {
                    if inner.graph.nodes[n as usize].deleted {
                        continue;
                    }
                    let distance = metric.distance(
                        &inner.graph.vectors[idx as usize],
                        &inner.graph.vectors[n as usize],
                    );
                    edge_rows.push((idx, n, level, distance));
                }
            }
        }
        let checksum = durable_checksum(&node_rows, &edge_rows);
        let entry = inner
            .graph
            .entry_point
            .filter(|&e| !inner.graph.nodes[e as usize].deleted);
        let max_level = inner.graph.max_level;
        let node_count = node_rows.len();

        store.with_retry("hnsw_flush_remove", || {
            store.rt.block_on(async {
                let mut tx = store.pool.begin().await?;
                sqlx::query("DELETE FROM hnsw_nodes WHERE id = ?1")
                    .bind(removed_idx as i64)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM hnsw_edges WHERE from_id = ?1 OR to_id = ?1")
                    .bind(removed_idx as i64)
                    .execute(&mut *tx)
                    .await?;
                for (key, value) in [
                    (
                        META_ENTRY_POINT,
                        entry.map(|e| e.to_string()).unwrap_or_default(),
                    ),
                    (META_MAX_LEVEL, max_level.to_string()),
                    (META_NODE_COUNT, node_count.to_string()),
                    (META_CHECKSUM, checksum.clone()),
                ] {
                    sqlx::query("INSERT OR REPLACE INTO hnsw_meta (key, value) VALUES (?1, ?2)")
                        .bind(key)
                        .bind(value)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            })
        })?;

        drop(inner);
        tracing::debug!(record_id = id, "HNSW node removed from durable image");
        Ok(())
    }

    /// Load a persisted graph. Returns false when the store holds none.
    ///
    /// Verifies the checksum and the full graph invariants before serving;
    /// either failure is `Corrupt`.
    pub fn load(&self, store: &Store) -> Result<bool, HnswError> {
        let Some(count_str) = store.get_index_meta(META_NODE_COUNT)? else {
            return Ok(false);
        };
        let node_count: usize = count_str
            .parse()
            .map_err(|_| HnswError::Corrupt(format!("bad node_count '{count_str}'")))?;

        let stored_dim = store.get_index_meta(META_DIMENSION)?;
        if let Some(dim) = stored_dim {
            let dim: usize = dim
                .parse()
                .map_err(|_| HnswError::Corrupt(format!("bad dimension '{dim}'")))?;
            if dim != self.dimension() {
                return Err(HnswError::Corrupt(format!(
                    "persisted graph dimension {dim} != store dimension {}",
                    self.dimension()
                )));
            }
        }

        let node_rows: Vec<(i64, String, i64)> = store.rt.block_on(async {
            sqlx::query_as("SELECT id, vector_id, level FROM hnsw_nodes ORDER BY id")
                .fetch_all(&store.pool)
                .await
                .map_err(crate::store::StoreError::from)
        })?;
        let edge_rows: Vec<(i64, i64, i64, f64)> = store.rt.block_on(async {
            sqlx::query_as(
                "SELECT from_id, to_id, level, distance FROM hnsw_edges \
                 ORDER BY from_id, level, to_id",
            )
            .fetch_all(&store.pool)
            .await
            .map_err(crate::store::StoreError::from)
        })?;

        if node_rows.len() != node_count {
            return Err(HnswError::Corrupt(format!(
                "hnsw_nodes has {} rows, meta says {node_count}",
                node_rows.len()
            )));
        }

        // Recompute the checksum from what was actually read
        let durable_nodes: Vec<(u32, String, usize)> = node_rows
            .iter()
            .map(|(id, vid, level)| (*id as u32, vid.clone(), *level as usize))
            .collect();
        let durable_edges: Vec<(u32, u32, usize, f32)> = edge_rows
            .iter()
            .map(|(f, t, l, d)| (*f as u32, *t as u32, *l as usize, *d as f32))
            .collect();
        let expected = store.get_index_meta(META_CHECKSUM)?.unwrap_or_default();
        let actual = durable_checksum(&durable_nodes, &durable_edges);
        if !expected.is_empty() && expected != actual {
            return Err(HnswError::Corrupt(format!(
                "adjacency checksum mismatch: stored {expected}, computed {actual}"
            )));
        }

        // Hydrate embeddings for every persisted node
        let ids: Vec<String> = durable_nodes.iter().map(|(_, id, _)| id.clone()).collect();
        let records = store.get_many(&ids)?;
        let mut vectors_by_id: HashMap<String, Vec<f32>> = records
            .into_iter()
            .map(|r| (r.id, r.embedding))
            .collect();

        // Rebuild the arena, remapping durable ids to dense indices
        let mut graph = Graph::default();
        let mut remap: HashMap<u32, u32> = HashMap::with_capacity(durable_nodes.len());
        for (durable_id, vector_id, level) in &durable_nodes {
            let vector = vectors_by_id.remove(vector_id).ok_or_else(|| {
                HnswError::Corrupt(format!(
                    "hnsw node references missing vector '{vector_id}'"
                ))
            })?;
            let new_idx = graph.push_node(vector_id.clone(), *level, vector)?;
            remap.insert(*durable_id, new_idx);
        }

        // A persisted graph that no longer fits the configured budget is
        // not corrupt; it is simply not served. Brute force takes over.
        let budget = { self.read().options.memory_budget_bytes };
        if graph.resident_bytes as u64 > budget {
            tracing::warn!(
                resident_bytes = graph.resident_bytes,
                budget,
                "Persisted graph exceeds hnsw.memory_budget_bytes; staying on brute force"
            );
            return Ok(false);
        }

        for (from, to, level, _distance) in &durable_edges {
            let (Some(&from), Some(&to)) = (remap.get(from), remap.get(to)) else {
                return Err(HnswError::Corrupt(format!(
                    "edge {from}->{to} references unknown node"
                )));
            };
            let node = &mut graph.nodes[from as usize];
            if *level >= node.neighbors.len() {
                return Err(HnswError::Corrupt(format!(
                    "edge at level {level} exceeds node level {}",
                    node.level
                )));
            }
            node.neighbors[*level].push(to);
        }

        graph.max_level = graph.nodes.iter().map(|n| n.level).max().unwrap_or(0);
        graph.entry_point = match store.get_index_meta(META_ENTRY_POINT)? {
            Some(s) if !s.is_empty() => {
                let durable: u32 = s
                    .parse()
                    .map_err(|_| HnswError::Corrupt(format!("bad entry_point '{s}'")))?;
                Some(*remap.get(&durable).ok_or_else(|| {
                    HnswError::Corrupt(format!("entry point {durable} not among nodes"))
                })?)
            }
            _ => None,
        };

        {
            let inner = self.read();
            graph.validate(inner.options.m, inner.options.m0)?;
        }

        let loaded = graph.len();
        {
            let mut inner = self.write();
            inner.graph = graph;
            inner.state = if loaded == 0 {
                IndexState::Seeded
            } else {
                IndexState::Ready
            };
        }
        tracing::info!(nodes = loaded, "HNSW graph loaded");
        Ok(loaded > 0)
    }
}

/// Canonical checksum over the durable representation: node rows in id
/// order, then each node's live out-edges per level sorted by target.
fn durable_checksum(
    nodes: &[(u32, String, usize)],
    edges: &[(u32, u32, usize, f32)],
) -> String {
    let mut adjacency: HashMap<(u32, usize), Vec<u32>> = HashMap::new();
    for (from, to, level, _) in edges {
        adjacency.entry((*from, *level)).or_default().push(*to);
    }

    let mut hasher = blake3::Hasher::new();
    for (idx, vector_id, level) in nodes {
        hasher.update(&idx.to_le_bytes());
        hasher.update(vector_id.as_bytes());
        hasher.update(&(*level as u32).to_le_bytes());
        for l in 0..=*level {
            let mut targets = adjacency.remove(&(*idx, l)).unwrap_or_default();
            targets.sort_unstable();
            hasher.update(&(targets.len() as u32).to_le_bytes());
            for t in targets {
                hasher.update(&t.to_le_bytes());
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbOptions, HnswOptions};
    use crate::hnsw::make_test_embedding;
    use crate::metric::DistanceMetric;
    use crate::store::VectorRecord;

    fn options() -> HnswOptions {
        HnswOptions {
            m: 4,
            m0: 8,
            ef_construction: 32,
            ef_search: 16,
            min_vectors_for_index: 1,
            ..Default::default()
        }
    }

    fn store_with_records(n: u32) -> (Store, Vec<(String, Vec<f32>)>) {
        let store = Store::open(&DbOptions::new(16)).unwrap();
        let records: Vec<VectorRecord> = (0..n)
            .map(|i| {
                VectorRecord::new(make_test_embedding(16, i)).with_id(format!("v{i:04}"))
            })
            .collect();
        store.insert_many(&records, None).unwrap();
        let items = records
            .into_iter()
            .map(|r| (r.id.unwrap(), r.embedding))
            .collect();
        (store, items)
    }

    #[test]
    fn test_flush_and_load_round_trip() {
        let (store, items) = store_with_records(60);
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        index.build_from(items, None).unwrap();
        index.flush(&store).unwrap();

        let restored = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        assert!(restored.load(&store).unwrap());
        assert_eq!(restored.len(), 60);
        assert_eq!(restored.state(), IndexState::Ready);
        restored.debug_validate().unwrap();

        // Same nearest neighbor before and after the round trip
        let query = make_test_embedding(16, 30);
        let a = index.search(&query, 1).unwrap();
        let b = restored.search(&query, 1).unwrap();
        assert_eq!(a.neighbors[0].id, b.neighbors[0].id);
    }

    #[test]
    fn test_load_empty_store() {
        let store = Store::open(&DbOptions::new(16)).unwrap();
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        assert!(!index.load(&store).unwrap());
    }

    #[test]
    fn test_tombstones_compact_on_round_trip() {
        let (store, items) = store_with_records(40);
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        index.build_from(items, None).unwrap();
        index.remove("v0005");
        index.remove("v0006");
        index.flush(&store).unwrap();

        let restored = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        assert!(restored.load(&store).unwrap());
        // The durable image is compacted: tombstones are gone
        assert_eq!(restored.len(), 38);
        assert_eq!(restored.stats().tombstones, 0);
        restored.debug_validate().unwrap();
    }

    #[test]
    fn test_load_refuses_oversized_working_set() {
        let (store, items) = store_with_records(20);
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        index.build_from(items, None).unwrap();
        index.flush(&store).unwrap();

        // Reopen with a budget the persisted working set cannot fit
        let small = crate::config::HnswOptions {
            memory_budget_bytes: 64,
            ..options()
        };
        let restored = HnswIndex::new(small, DistanceMetric::Cosine, 16);
        assert!(!restored.load(&store).unwrap());
        assert_eq!(restored.state(), IndexState::Seeded);
        assert_eq!(restored.len(), 0);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let (store, items) = store_with_records(20);
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        index.build_from(items, None).unwrap();
        index.flush(&store).unwrap();

        store.put_index_meta("checksum", "deadbeef").unwrap();

        let restored = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        assert!(matches!(
            restored.load(&store),
            Err(HnswError::Corrupt(_))
        ));
    }

    #[test]
    fn test_missing_vector_is_corrupt() {
        let (store, items) = store_with_records(20);
        let index = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        index.build_from(items, None).unwrap();
        index.flush(&store).unwrap();

        // Delete a record out from under the persisted graph
        store.delete("v0000").unwrap();

        let restored = HnswIndex::new(options(), DistanceMetric::Cosine, 16);
        assert!(matches!(
            restored.load(&store),
            Err(HnswError::Corrupt(_))
        ));
    }
}
