//! Typed reasoning patterns with incremental rolling statistics
//!
//! A pattern is a named, typed, reusable approach to a class of tasks.
//! Its metadata lives in `reasoning_patterns`; its embedding is a row in
//! `vectors` tagged kind=pattern. Rolling success rate and duration are
//! maintained by the incremental mean update under a write transaction,
//! so concurrent completions never lose updates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{tags_from_json, tags_to_json};
use crate::store::helpers::{embedding_to_bytes, KIND_PATTERN};
use crate::store::{Store, StoreError};
use crate::DbError;

/// A stored pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    /// Id of the embedding row in `vectors`.
    pub vector_id: String,
    pub task_type: String,
    pub approach: String,
    /// Rolling success rate in [0, 1].
    pub success_rate: f64,
    /// Rolling average duration in milliseconds.
    pub avg_duration_ms: f64,
    /// Completions folded into the rolling statistics.
    pub iterations: i64,
    pub tags: Vec<String>,
    pub domain: Option<String>,
    pub complexity: Option<String>,
    pub learning_source: Option<String>,
    pub created_at_ms: i64,
}

/// Input for `store_pattern`. Statistics start at zero and accumulate
/// through `update_pattern`.
#[derive(Debug, Clone, Default)]
pub struct NewPattern {
    pub task_type: String,
    pub approach: String,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
    pub domain: Option<String>,
    pub complexity: Option<String>,
    pub learning_source: Option<String>,
}

/// One completed use of a pattern.
#[derive(Debug, Clone, Copy)]
pub struct PatternUpdate {
    pub success: bool,
    pub duration_ms: f64,
}

/// Filters for `find_similar`.
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    pub domain: Option<String>,
    pub task_type: Option<String>,
    pub min_success_rate: Option<f64>,
}

impl PatternFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_min_success_rate(mut self, rate: f64) -> Self {
        self.min_success_rate = Some(rate);
        self
    }

    fn is_empty(&self) -> bool {
        self.domain.is_none() && self.task_type.is_none() && self.min_success_rate.is_none()
    }

    fn matches(&self, pattern: &Pattern) -> bool {
        if let Some(domain) = &self.domain {
            if pattern.domain.as_deref() != Some(domain.as_str()) {
                return false;
            }
        }
        if let Some(task_type) = &self.task_type {
            if &pattern.task_type != task_type {
                return false;
            }
        }
        if let Some(min) = self.min_success_rate {
            if pattern.success_rate < min {
                return false;
            }
        }
        true
    }
}

/// A ranked `find_similar` hit.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: Pattern,
    /// Cosine similarity of the stored embedding to the query.
    pub relevance: f32,
}

/// Aggregate statistics over all stored patterns.
#[derive(Debug, Clone)]
pub struct PatternStats {
    pub total: u64,
    pub avg_success_rate: f64,
    pub avg_duration_ms: f64,
    pub total_iterations: i64,
}

/// Pattern store handle. Cheap to construct from `Db::patterns()`.
pub struct PatternMatcher {
    store: Arc<Store>,
}

impl PatternMatcher {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Persist a new pattern: embedding row and metadata row in one
    /// transaction.
    pub fn store_pattern(&self, new: NewPattern) -> Result<Pattern, DbError> {
        if new.embedding.len() != self.store.dimension() {
            return Err(DbError::DimensionMismatch {
                expected: self.store.dimension(),
                actual: new.embedding.len(),
            });
        }
        let id = crate::new_record_id();
        let vector_id = crate::new_record_id();
        let now = crate::now_ms();
        let bytes = embedding_to_bytes(&new.embedding);
        let norm = crate::metric::l2_norm(&new.embedding);
        let tags_json = tags_to_json(&new.tags)?;

        self.store.with_retry("store_pattern", || {
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
                .bind(KIND_PATTERN)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO reasoning_patterns \
                     (id, vector_id, task_type, approach, success_rate, avg_duration_ms, \
                      iterations, tags, domain, complexity, learning_source, created_at) \
                     VALUES (?1, ?2, ?3, ?4, 0.0, 0.0, 0, ?5, ?6, ?7, ?8, ?9)",
                )
                .bind(&id)
                .bind(&vector_id)
                .bind(&new.task_type)
                .bind(&new.approach)
                .bind(&tags_json)
                .bind(&new.domain)
                .bind(&new.complexity)
                .bind(&new.learning_source)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(())
            })
        })?;

        tracing::debug!(pattern_id = %id, task_type = %new.task_type, "Pattern stored");
        Ok(Pattern {
            id,
            vector_id,
            task_type: new.task_type,
            approach: new.approach,
            success_rate: 0.0,
            avg_duration_ms: 0.0,
            iterations: 0,
            tags: new.tags,
            domain: new.domain,
            complexity: new.complexity,
            learning_source: new.learning_source,
            created_at_ms: now,
        })
    }

    /// Fetch one pattern by id.
    pub fn get_pattern(&self, id: &str) -> Result<Option<Pattern>, DbError> {
        let rows = self.hydrate("WHERE p.id = ?1", &[id.to_string()])?;
        Ok(rows.into_iter().next())
    }

    /// Similarity search restricted to pattern embeddings, then a single
    /// IN-clause query hydrates all metadata in one round trip.
    pub fn find_similar(
        &self,
        embedding: &[f32],
        k: usize,
        threshold: Option<f32>,
        filter: &PatternFilter,
    ) -> Result<Vec<PatternMatch>, DbError> {
        if embedding.len() != self.store.dimension() {
            return Err(DbError::DimensionMismatch {
                expected: self.store.dimension(),
                actual: embedding.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        // Over-fetch when filters will discard hits post-hydration
        let fetch_k = if filter.is_empty() { k } else { k * 4 };
        let scored = self.store.brute_force_search(
            embedding,
            fetch_k,
            crate::metric::DistanceMetric::Cosine,
            threshold,
            KIND_PATTERN,
        )?;
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        let vector_ids: Vec<String> = scored.iter().map(|s| s.id.clone()).collect();
        let placeholders: Vec<String> = (1..=vector_ids.len()).map(|i| format!("?{i}")).collect();
        let clause = format!("WHERE p.vector_id IN ({})", placeholders.join(","));
        let patterns = self.hydrate(&clause, &vector_ids)?;

        let by_vector: std::collections::HashMap<String, Pattern> = patterns
            .into_iter()
            .map(|p| (p.vector_id.clone(), p))
            .collect();

        let mut matches: Vec<PatternMatch> = scored
            .into_iter()
            .filter_map(|s| {
                let pattern = by_vector.get(&s.id)?.clone();
                if !filter.matches(&pattern) {
                    return None;
                }
                Some(PatternMatch {
                    pattern,
                    relevance: s.score,
                })
            })
            .collect();
        matches.truncate(k);
        Ok(matches)
    }

    /// Fold one completion into the rolling statistics.
    ///
    /// Runs read -> apply -> write inside one immediate transaction, so
    /// the row is write-locked for the whole span and concurrent updates
    /// serialize instead of losing increments:
    ///
    ///   iterations'   = iterations + 1
    ///   success_rate' = (success_rate * iterations + s) / iterations'
    ///   avg_duration' = (avg_duration * iterations + d) / iterations'
    pub fn update_pattern(&self, id: &str, update: PatternUpdate) -> Result<Pattern, DbError> {
        let id = id.to_string();
        self.store.with_retry("update_pattern", || {
            self.store.rt.block_on(async {
                let mut conn = self.store.pool.acquire().await?;
                // IMMEDIATE takes the write lock up front; the read below
                // cannot be invalidated by a concurrent writer.
                sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

                let result = async {
                    let row: Option<(f64, f64, i64)> = sqlx::query_as(
                        "SELECT success_rate, avg_duration_ms, iterations \
                         FROM reasoning_patterns WHERE id = ?1",
                    )
                    .bind(&id)
                    .fetch_optional(&mut *conn)
                    .await?;
                    let Some((success_rate, avg_duration_ms, iterations)) = row else {
                        return Err(StoreError::NotFound(id.clone()));
                    };

                    let next_iterations = iterations + 1;
                    let s = if update.success { 1.0 } else { 0.0 };
                    let next_success =
                        (success_rate * iterations as f64 + s) / next_iterations as f64;
                    let next_duration = (avg_duration_ms * iterations as f64
                        + update.duration_ms)
                        / next_iterations as f64;

                    sqlx::query(
                        "UPDATE reasoning_patterns \
                         SET success_rate = ?2, avg_duration_ms = ?3, iterations = ?4 \
                         WHERE id = ?1",
                    )
                    .bind(&id)
                    .bind(next_success)
                    .bind(next_duration)
                    .bind(next_iterations)
                    .execute(&mut *conn)
                    .await?;
                    Ok(())
                }
                .await;

                match result {
                    Ok(()) => {
                        sqlx::query("COMMIT").execute(&mut *conn).await?;
                        Ok(())
                    }
                    Err(e) => {
                        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                        Err(e)
                    }
                }
            })
        })?;

        self.get_pattern(&id)?
            .ok_or_else(|| DbError::NotFound(id.clone()))
    }

    /// Delete a pattern and its embedding row.
    pub fn delete_pattern(&self, id: &str) -> Result<bool, DbError> {
        let id = id.to_string();
        let removed = self.store.with_retry("delete_pattern", || {
            self.store.rt.block_on(async {
                let mut tx = self.store.pool.begin().await?;
                let row: Option<(String,)> =
                    sqlx::query_as("SELECT vector_id FROM reasoning_patterns WHERE id = ?1")
                        .bind(&id)
                        .fetch_optional(&mut *tx)
                        .await?;
                let Some((vector_id,)) = row else {
                    return Ok(false);
                };
                sqlx::query("DELETE FROM reasoning_patterns WHERE id = ?1")
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM vectors WHERE id = ?1")
                    .bind(&vector_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(true)
            })
        })?;
        Ok(removed)
    }

    /// Aggregate statistics across all patterns.
    pub fn stats(&self) -> Result<PatternStats, DbError> {
        let row: (i64, Option<f64>, Option<f64>, Option<i64>) =
            self.store.rt.block_on(async {
                sqlx::query_as(
                    "SELECT COUNT(*), AVG(success_rate), AVG(avg_duration_ms), SUM(iterations) \
                     FROM reasoning_patterns",
                )
                .fetch_one(&self.store.pool)
                .await
                .map_err(StoreError::from)
            })?;
        Ok(PatternStats {
            total: row.0 as u64,
            avg_success_rate: row.1.unwrap_or(0.0),
            avg_duration_ms: row.2.unwrap_or(0.0),
            total_iterations: row.3.unwrap_or(0),
        })
    }

    fn hydrate(&self, where_clause: &str, binds: &[String]) -> Result<Vec<Pattern>, DbError> {
        use sqlx::Row;
        let sql = format!(
            "SELECT p.id, p.vector_id, p.task_type, p.approach, p.success_rate, \
             p.avg_duration_ms, p.iterations, p.tags, p.domain, p.complexity, \
             p.learning_source, p.created_at \
             FROM reasoning_patterns p {where_clause}"
        );
        let rows = self.store.rt.block_on(async {
            let mut query = sqlx::query(&sql);
            for bind in binds {
                query = query.bind(bind);
            }
            query
                .fetch_all(&self.store.pool)
                .await
                .map_err(StoreError::from)
        })?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let tags_text: Option<String> = row.get(7);
                Pattern {
                    id: row.get(0),
                    vector_id: row.get(1),
                    task_type: row.get(2),
                    approach: row.get(3),
                    success_rate: row.get(4),
                    avg_duration_ms: row.get(5),
                    iterations: row.get(6),
                    tags: tags_from_json(tags_text.as_deref()),
                    domain: row.get(8),
                    complexity: row.get(9),
                    learning_source: row.get(10),
                    created_at_ms: row.get(11),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbOptions;

    fn matcher() -> PatternMatcher {
        let store = Arc::new(Store::open(&DbOptions::new(4)).unwrap());
        PatternMatcher::new(store)
    }

    fn new_pattern(task_type: &str, embedding: Vec<f32>) -> NewPattern {
        NewPattern {
            task_type: task_type.to_string(),
            approach: "divide and conquer".to_string(),
            embedding,
            tags: vec!["test".to_string()],
            domain: Some("coding".to_string()),
            complexity: None,
            learning_source: None,
        }
    }

    #[test]
    fn test_store_and_get() {
        let patterns = matcher();
        let stored = patterns
            .store_pattern(new_pattern("refactor", vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        assert_eq!(stored.iterations, 0);

        let fetched = patterns.get_pattern(&stored.id).unwrap().unwrap();
        assert_eq!(fetched.task_type, "refactor");
        assert_eq!(fetched.tags, vec!["test".to_string()]);
        assert_eq!(fetched.vector_id, stored.vector_id);
    }

    #[test]
    fn test_rolling_stats_update() {
        let patterns = matcher();
        let stored = patterns
            .store_pattern(new_pattern("debug", vec![0.0, 1.0, 0.0, 0.0]))
            .unwrap();

        let after_first = patterns
            .update_pattern(
                &stored.id,
                PatternUpdate {
                    success: true,
                    duration_ms: 1000.0,
                },
            )
            .unwrap();
        assert_eq!(after_first.iterations, 1);
        assert!((after_first.success_rate - 1.0).abs() < 1e-9);
        assert!((after_first.avg_duration_ms - 1000.0).abs() < 1e-9);

        let after_second = patterns
            .update_pattern(
                &stored.id,
                PatternUpdate {
                    success: false,
                    duration_ms: 3000.0,
                },
            )
            .unwrap();
        assert_eq!(after_second.iterations, 2);
        assert!((after_second.success_rate - 0.5).abs() < 1e-9);
        assert!((after_second.avg_duration_ms - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_missing_pattern() {
        let patterns = matcher();
        assert!(matches!(
            patterns.update_pattern(
                "missing",
                PatternUpdate {
                    success: true,
                    duration_ms: 1.0
                }
            ),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_find_similar_ranked_and_filtered() {
        let patterns = matcher();
        patterns
            .store_pattern(new_pattern("alpha", vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        patterns
            .store_pattern(new_pattern("beta", vec![0.0, 1.0, 0.0, 0.0]))
            .unwrap();
        let mut ops = new_pattern("gamma", vec![0.9, 0.1, 0.0, 0.0]);
        ops.domain = Some("ops".to_string());
        patterns.store_pattern(ops).unwrap();

        let hits = patterns
            .find_similar(&[1.0, 0.0, 0.0, 0.0], 3, None, &PatternFilter::new())
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].pattern.task_type, "alpha");
        assert!(hits[0].relevance > hits[1].relevance);

        let coding_only = patterns
            .find_similar(
                &[1.0, 0.0, 0.0, 0.0],
                3,
                None,
                &PatternFilter::new().with_domain("coding"),
            )
            .unwrap();
        assert!(coding_only.iter().all(|m| m.pattern.domain.as_deref() == Some("coding")));
    }

    #[test]
    fn test_delete_pattern_removes_embedding() {
        let patterns = matcher();
        let stored = patterns
            .store_pattern(new_pattern("cleanup", vec![0.5; 4]))
            .unwrap();
        assert!(patterns.delete_pattern(&stored.id).unwrap());
        assert!(patterns.get_pattern(&stored.id).unwrap().is_none());
        assert!(!patterns.delete_pattern(&stored.id).unwrap());

        let hits = patterns
            .find_similar(&[0.5, 0.5, 0.5, 0.5], 5, None, &PatternFilter::new())
            .unwrap();
        assert!(hits.is_empty(), "deleted pattern must not be searchable");
    }

    #[test]
    fn test_stats() {
        let patterns = matcher();
        patterns
            .store_pattern(new_pattern("a", vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        let b = patterns
            .store_pattern(new_pattern("b", vec![0.0, 1.0, 0.0, 0.0]))
            .unwrap();
        patterns
            .update_pattern(
                &b.id,
                PatternUpdate {
                    success: true,
                    duration_ms: 500.0,
                },
            )
            .unwrap();

        let stats = patterns.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.total_iterations, 1);
        assert!(stats.avg_success_rate > 0.0);
    }
}
