//! Memory collapse: fold old experiences into centroid summary nodes
//!
//! Three strategies, one per run: graph clustering by cosine similarity,
//! calendar bucketing, and a sliding temporal window. All of them stream
//! history in bounded batches (1,000 rows per read) so large tables never
//! force the whole dataset into RAM, and the graph strategy finds cluster
//! candidates through a scratch HNSW graph per batch instead of an O(n²)
//! pairwise sweep.
//!
//! A memory node stores bounded metadata only: count, average quality,
//! domains, time range, and a capped origin-id list. Origin embeddings
//! are never copied into the node; the centroid row in `vectors`
//! (kind = memory_node) keeps the collapsed history searchable.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::tags_from_json;
use crate::cancel::{check_interrupt, CancellationToken, Deadline, Interrupt};
use crate::config::HnswOptions;
use crate::hnsw::HnswIndex;
use crate::metric::{cosine_similarity, DistanceMetric};
use crate::store::helpers::{bytes_to_embedding, embedding_to_bytes, KIND_MEMORY_NODE};
use crate::store::{Store, StoreError};
use crate::DbError;

/// Rows per streamed read.
const COLLAPSE_BATCH: usize = 1_000;

/// Cap on origin ids stored per node; the remainder sets the overflow
/// flag instead of growing the row.
const ORIGIN_ID_CAP: usize = 64;

/// Neighbor candidates requested per seed during graph clustering.
const CLUSTER_NEIGHBORS: usize = 16;

/// Which collapse algorithm to run.
#[derive(Debug, Clone)]
pub enum CollapseStrategy {
    /// Single-linkage clustering of rows older than `max_age_ms` by
    /// cosine similarity; every cluster with >= 2 members collapses.
    Graph {
        max_age_ms: i64,
        similarity_threshold: f32,
    },
    /// Bucket by wall-clock interval (e.g. day = 86_400_000); buckets
    /// older than `max_age_ms` with at least `min_bucket_size` rows
    /// collapse to one node each.
    Hierarchical {
        max_age_ms: i64,
        bucket_ms: i64,
        min_bucket_size: usize,
    },
    /// Slide a window over rows in time order, merging adjacent rows
    /// whose similarity to the running centroid stays above threshold.
    Temporal {
        max_age_ms: i64,
        window: usize,
        similarity_threshold: f32,
    },
}

impl CollapseStrategy {
    fn name(&self) -> &'static str {
        match self {
            CollapseStrategy::Graph { .. } => "graph",
            CollapseStrategy::Hierarchical { .. } => "hierarchical",
            CollapseStrategy::Temporal { .. } => "temporal",
        }
    }

    fn max_age_ms(&self) -> i64 {
        match self {
            CollapseStrategy::Graph { max_age_ms, .. }
            | CollapseStrategy::Hierarchical { max_age_ms, .. }
            | CollapseStrategy::Temporal { max_age_ms, .. } => *max_age_ms,
        }
    }
}

/// A collapsed summary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: String,
    /// Centroid row in `vectors`.
    pub vector_id: String,
    pub count: u64,
    pub avg_quality: f64,
    pub t_min_ms: i64,
    pub t_max_ms: i64,
    pub domains: Vec<String>,
    /// Capped at 64 entries; see `origins_truncated`.
    pub origin_ids: Vec<String>,
    pub origins_truncated: bool,
    pub strategy: String,
    pub created_at_ms: i64,
}

/// Outcome of one collapse run.
#[derive(Debug, Clone, Default)]
pub struct CollapseReport {
    pub nodes_created: usize,
    pub rows_collapsed: usize,
    pub rows_scanned: usize,
}

/// One old experience loaded for clustering.
struct OldRow {
    experience_id: String,
    vector_id: String,
    embedding: Vec<f32>,
    quality: f64,
    domain: Option<String>,
    created_at_ms: i64,
}

/// A cluster pending persistence.
struct PendingNode {
    centroid: Vec<f32>,
    members: Vec<OldRowMeta>,
}

struct OldRowMeta {
    experience_id: String,
    vector_id: String,
    quality: f64,
    domain: Option<String>,
    created_at_ms: i64,
}

/// Memory collapse handle. Cheap to construct from `Db::memory()`.
pub struct MemoryOptimizer {
    store: Arc<Store>,
}

impl MemoryOptimizer {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Run one collapse pass. `evict_originals` deletes the collapsed
    /// experience rows (and their embeddings); otherwise they are
    /// retained alongside the new summary nodes.
    pub fn collapse(
        &self,
        strategy: &CollapseStrategy,
        evict_originals: bool,
        cancel: Option<&CancellationToken>,
        deadline: Option<&Deadline>,
    ) -> Result<CollapseReport, DbError> {
        let cutoff = crate::now_ms() - strategy.max_age_ms();
        let mut report = CollapseReport::default();
        let mut cursor = String::new();
        // Temporal groups may span batch boundaries
        let mut carry: Option<PendingNode> = None;
        let temporal_window = match strategy {
            CollapseStrategy::Temporal { window, .. } => (*window).max(2),
            _ => 0,
        };

        loop {
            if let Some(stop) = check_interrupt(cancel, deadline) {
                return Err(match stop {
                    Interrupt::Cancelled => DbError::Cancelled,
                    Interrupt::TimedOut => DbError::Timeout,
                });
            }
            let batch = self.read_old_rows(cutoff, &cursor, COLLAPSE_BATCH)?;
            if batch.is_empty() {
                break;
            }
            cursor = batch.last().map(|r| r.experience_id.clone()).unwrap_or_default();
            report.rows_scanned += batch.len();

            let mut pending = match strategy {
                CollapseStrategy::Graph {
                    similarity_threshold,
                    ..
                } => cluster_graph(batch, *similarity_threshold, self.store.dimension()),
                CollapseStrategy::Hierarchical {
                    bucket_ms,
                    min_bucket_size,
                    ..
                } => cluster_buckets(batch, *bucket_ms, *min_bucket_size),
                CollapseStrategy::Temporal {
                    similarity_threshold,
                    ..
                } => cluster_temporal(batch, temporal_window, *similarity_threshold, &mut carry),
            };

            for node in pending.drain(..) {
                report.rows_collapsed += node.members.len();
                report.nodes_created += 1;
                self.persist_node(node, strategy.name(), evict_originals)?;
            }
        }

        // Flush a trailing temporal group
        if let Some(node) = carry.take() {
            if node.members.len() >= 2 {
                report.rows_collapsed += node.members.len();
                report.nodes_created += 1;
                self.persist_node(node, strategy.name(), evict_originals)?;
            }
        }

        tracing::info!(
            strategy = strategy.name(),
            nodes = report.nodes_created,
            collapsed = report.rows_collapsed,
            scanned = report.rows_scanned,
            "Memory collapse complete"
        );
        Ok(report)
    }

    /// List collapsed nodes, newest first.
    pub fn list_nodes(&self, limit: usize) -> Result<Vec<MemoryNode>, DbError> {
        use sqlx::Row;
        let rows = self.store.rt.block_on(async {
            sqlx::query(
                "SELECT id, vector_id, count, avg_quality, t_min, t_max, domains, \
                 origin_ids, origins_truncated, strategy, created_at \
                 FROM memory_nodes ORDER BY created_at DESC LIMIT ?1",
            )
            .bind(limit as i64)
            .fetch_all(&self.store.pool)
            .await
            .map_err(StoreError::from)
        })?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let domains_text: Option<String> = row.get(6);
                let origins_text: Option<String> = row.get(7);
                MemoryNode {
                    id: row.get(0),
                    vector_id: row.get(1),
                    count: row.get::<i64, _>(2).max(0) as u64,
                    avg_quality: row.get(3),
                    t_min_ms: row.get(4),
                    t_max_ms: row.get(5),
                    domains: tags_from_json(domains_text.as_deref()),
                    origin_ids: tags_from_json(origins_text.as_deref()),
                    origins_truncated: row.get::<i64, _>(8) != 0,
                    strategy: row.get(9),
                    created_at_ms: row.get(10),
                }
            })
            .collect())
    }

    /// Similarity search over collapsed memory (centroid rows).
    pub fn find_similar_nodes(
        &self,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(MemoryNode, f32)>, DbError> {
        let scored = self.store.brute_force_search(
            embedding,
            k,
            DistanceMetric::Cosine,
            None,
            KIND_MEMORY_NODE,
        )?;
        let mut out = Vec::with_capacity(scored.len());
        for hit in scored {
            let node = self.node_by_vector_id(&hit.id)?;
            if let Some(node) = node {
                out.push((node, hit.score));
            }
        }
        Ok(out)
    }

    fn node_by_vector_id(&self, vector_id: &str) -> Result<Option<MemoryNode>, DbError> {
        let nodes = self.list_nodes(10_000)?;
        Ok(nodes.into_iter().find(|n| n.vector_id == vector_id))
    }

    fn read_old_rows(
        &self,
        cutoff: i64,
        cursor: &str,
        limit: usize,
    ) -> Result<Vec<OldRow>, DbError> {
        let rows: Vec<(String, String, f64, Option<String>, i64, Vec<u8>)> =
            self.store.rt.block_on(async {
                sqlx::query_as(
                    "SELECT e.id, e.vector_id, e.quality, e.domain, e.created_at, v.embedding \
                     FROM reasoning_experiences e \
                     JOIN vectors v ON v.id = e.vector_id \
                     WHERE e.created_at < ?1 AND e.id > ?2 \
                     ORDER BY e.id LIMIT ?3",
                )
                .bind(cutoff)
                .bind(cursor)
                .bind(limit as i64)
                .fetch_all(&self.store.pool)
                .await
                .map_err(StoreError::from)
            })?;
        let dimension = self.store.dimension();
        rows.into_iter()
            .map(|(experience_id, vector_id, quality, domain, created_at_ms, bytes)| {
                Ok(OldRow {
                    experience_id,
                    vector_id,
                    embedding: bytes_to_embedding(&bytes, dimension)?,
                    quality,
                    domain,
                    created_at_ms,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()
            .map_err(DbError::from)
    }

    /// Write one memory node (vector row + metadata row) and optionally
    /// evict its origins, all in a single transaction.
    fn persist_node(
        &self,
        node: PendingNode,
        strategy: &'static str,
        evict_originals: bool,
    ) -> Result<(), DbError> {
        let node_id = crate::new_record_id();
        let vector_id = crate::new_record_id();
        let now = crate::now_ms();

        let count = node.members.len() as i64;
        let avg_quality =
            node.members.iter().map(|m| m.quality).sum::<f64>() / node.members.len() as f64;
        let t_min = node.members.iter().map(|m| m.created_at_ms).min().unwrap_or(now);
        let t_max = node.members.iter().map(|m| m.created_at_ms).max().unwrap_or(now);
        let mut domains: Vec<String> = node
            .members
            .iter()
            .filter_map(|m| m.domain.clone())
            .collect();
        domains.sort();
        domains.dedup();

        let origins_truncated = node.members.len() > ORIGIN_ID_CAP;
        let origin_ids: Vec<String> = node
            .members
            .iter()
            .take(ORIGIN_ID_CAP)
            .map(|m| m.experience_id.clone())
            .collect();
        let domains_json =
            serde_json::to_string(&domains).map_err(|e| DbError::Internal(e.to_string()))?;
        let origins_json =
            serde_json::to_string(&origin_ids).map_err(|e| DbError::Internal(e.to_string()))?;

        let bytes = embedding_to_bytes(&node.centroid);
        let norm = crate::metric::l2_norm(&node.centroid);

        self.store.with_retry("persist_memory_node", || {
            self.store.rt.block_on(async {
                let mut tx = self.store.pool.begin().await?;
                sqlx::query(
                    "INSERT INTO vectors (id, embedding, norm, metadata, ts, kind) \
                     VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
                )
                .bind(&vector_id)
                .bind(&bytes)
                .bind(norm)
                .bind(now)
                .bind(KIND_MEMORY_NODE)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO memory_nodes \
                     (id, vector_id, count, avg_quality, t_min, t_max, domains, origin_ids, \
                      origins_truncated, strategy, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .bind(&node_id)
                .bind(&vector_id)
                .bind(count)
                .bind(avg_quality)
                .bind(t_min)
                .bind(t_max)
                .bind(&domains_json)
                .bind(&origins_json)
                .bind(origins_truncated)
                .bind(strategy)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                if evict_originals {
                    for member in &node.members {
                        sqlx::query("DELETE FROM reasoning_experiences WHERE id = ?1")
                            .bind(&member.experience_id)
                            .execute(&mut *tx)
                            .await?;
                        sqlx::query("DELETE FROM vectors WHERE id = ?1")
                            .bind(&member.vector_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                }

                tx.commit().await?;
                Ok(())
            })
        })?;
        Ok(())
    }
}

fn meta_of(row: &OldRow) -> OldRowMeta {
    OldRowMeta {
        experience_id: row.experience_id.clone(),
        vector_id: row.vector_id.clone(),
        quality: row.quality,
        domain: row.domain.clone(),
        created_at_ms: row.created_at_ms,
    }
}

fn centroid_of(rows: &[&OldRow]) -> Vec<f32> {
    let dim = rows[0].embedding.len();
    let mut sums = vec![0.0f64; dim];
    for row in rows {
        for (i, &x) in row.embedding.iter().enumerate() {
            sums[i] += x as f64;
        }
    }
    sums.into_iter().map(|s| (s / rows.len() as f64) as f32).collect()
}

/// Graph strategy: single-linkage clusters via a scratch HNSW graph per
/// batch. Each unvisited seed queries its neighbors; hits above the
/// similarity threshold join the cluster and are expanded in turn.
fn cluster_graph(batch: Vec<OldRow>, similarity_threshold: f32, dimension: usize) -> Vec<PendingNode> {
    if batch.len() < 2 {
        return Vec::new();
    }

    let scratch = HnswIndex::new(
        HnswOptions {
            m: 8,
            m0: 16,
            ef_construction: 64,
            ef_search: CLUSTER_NEIGHBORS * 2,
            min_vectors_for_index: 1,
            ..Default::default()
        },
        DistanceMetric::Cosine,
        dimension,
    );
    let items: Vec<(String, Vec<f32>)> = batch
        .iter()
        .enumerate()
        .map(|(i, row)| (i.to_string(), row.embedding.clone()))
        .collect();
    if scratch.build_from(items, None).is_err() {
        return Vec::new();
    }

    let max_distance = 1.0 - similarity_threshold;
    let mut assigned = vec![false; batch.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for seed in 0..batch.len() {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut cluster = vec![seed];
        let mut frontier = vec![seed];
        while let Some(current) = frontier.pop() {
            let Ok(found) = scratch.search(&batch[current].embedding, CLUSTER_NEIGHBORS) else {
                continue;
            };
            for neighbor in found.neighbors {
                if neighbor.distance > max_distance {
                    continue;
                }
                let idx: usize = match neighbor.id.parse() {
                    Ok(idx) => idx,
                    Err(_) => continue,
                };
                if !assigned[idx] {
                    assigned[idx] = true;
                    cluster.push(idx);
                    frontier.push(idx);
                }
            }
        }
        if cluster.len() >= 2 {
            clusters.push(cluster);
        }
    }

    clusters
        .into_iter()
        .map(|members| {
            let rows: Vec<&OldRow> = members.iter().map(|&i| &batch[i]).collect();
            PendingNode {
                centroid: centroid_of(&rows),
                members: rows.iter().map(|r| meta_of(r)).collect(),
            }
        })
        .collect()
}

/// Hierarchical strategy: bucket by calendar interval, collapse buckets
/// that meet the size threshold.
fn cluster_buckets(batch: Vec<OldRow>, bucket_ms: i64, min_bucket_size: usize) -> Vec<PendingNode> {
    let bucket_ms = bucket_ms.max(1);
    let mut buckets: std::collections::BTreeMap<i64, Vec<usize>> = std::collections::BTreeMap::new();
    for (i, row) in batch.iter().enumerate() {
        buckets.entry(row.created_at_ms.div_euclid(bucket_ms)).or_default().push(i);
    }
    buckets
        .into_values()
        .filter(|members| members.len() >= min_bucket_size.max(2))
        .map(|members| {
            let rows: Vec<&OldRow> = members.iter().map(|&i| &batch[i]).collect();
            PendingNode {
                centroid: centroid_of(&rows),
                members: rows.iter().map(|r| meta_of(r)).collect(),
            }
        })
        .collect()
}

/// Temporal strategy: merge adjacent similar rows inside a sliding
/// window. The open group is carried across batch boundaries.
fn cluster_temporal(
    batch: Vec<OldRow>,
    window: usize,
    similarity_threshold: f32,
    carry: &mut Option<PendingNode>,
) -> Vec<PendingNode> {
    let mut done = Vec::new();
    for row in &batch {
        match carry {
            Some(open) => {
                let sim = cosine_similarity(&open.centroid, &row.embedding);
                if sim >= similarity_threshold && open.members.len() < window {
                    // Running mean keeps the centroid exact without
                    // holding member embeddings
                    let n = open.members.len() as f64;
                    for (c, &x) in open.centroid.iter_mut().zip(&row.embedding) {
                        *c = ((*c as f64 * n + x as f64) / (n + 1.0)) as f32;
                    }
                    open.members.push(meta_of(row));
                } else {
                    let finished = carry.take().expect("carry is Some");
                    if finished.members.len() >= 2 {
                        done.push(finished);
                    }
                    *carry = Some(PendingNode {
                        centroid: row.embedding.clone(),
                        members: vec![meta_of(row)],
                    });
                }
            }
            None => {
                *carry = Some(PendingNode {
                    centroid: row.embedding.clone(),
                    members: vec![meta_of(row)],
                });
            }
        }
    }
    done
}
