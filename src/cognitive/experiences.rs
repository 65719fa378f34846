//! Scored task executions
//!
//! Every execution is stored with a computed quality in [0, 1]:
//!
//!   quality = 0.6 * success_factor
//!           + 0.2 * max(0, 1 - duration_ms / 60_000)
//!           + 0.1 * max(0, 1 - tokens_used / 10_000)
//!           + 0.1 * max(0, 1 - iterations / 5)
//!
//! with success_factor 1.0 on success and 1/6 on failure (a 0.1 reward
//! floor after weighting). The formula is part of the contract; tests
//! pin the weights and the bounds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::helpers::{embedding_to_bytes, KIND_EXPERIENCE};
use crate::store::{Store, StoreError};
use crate::DbError;

/// Success factor for failed executions: 1/6, so the success term
/// contributes a 0.1 floor after the 0.6 weight.
const FAILURE_FACTOR: f64 = 1.0 / 6.0;

/// Compute the quality score for an execution. Always in [0, 1].
pub fn quality_score(success: bool, duration_ms: u64, tokens_used: u64, iterations: u32) -> f64 {
    let success_factor = if success { 1.0 } else { FAILURE_FACTOR };
    let duration_term = (1.0 - duration_ms as f64 / 60_000.0).max(0.0);
    let tokens_term = (1.0 - tokens_used as f64 / 10_000.0).max(0.0);
    let iterations_term = (1.0 - iterations as f64 / 5.0).max(0.0);
    0.6 * success_factor + 0.2 * duration_term + 0.1 * tokens_term + 0.1 * iterations_term
}

/// A stored execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    /// Id of the embedding row in `vectors`.
    pub vector_id: String,
    pub task: String,
    pub success: bool,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub iterations: u32,
    /// Computed at record time, never stored raw.
    pub quality: f64,
    pub approach: Option<String>,
    pub outcome: Option<String>,
    pub domain: Option<String>,
    pub agent_type: Option<String>,
    /// Groups rows belonging to one session for context synthesis.
    pub session_key: Option<String>,
    pub created_at_ms: i64,
}

/// Input for `record`.
#[derive(Debug, Clone, Default)]
pub struct NewExperience {
    pub task: String,
    pub success: bool,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub iterations: u32,
    pub embedding: Vec<f32>,
    pub approach: Option<String>,
    pub outcome: Option<String>,
    pub domain: Option<String>,
    pub agent_type: Option<String>,
    pub session_key: Option<String>,
}

/// Filters shared by `find_similar` and `list`.
#[derive(Debug, Clone, Default)]
pub struct ExperienceFilter {
    pub domain: Option<String>,
    pub min_quality: Option<f64>,
    /// Only rows younger than this many milliseconds.
    pub max_age_ms: Option<i64>,
    /// Substring match on the outcome text.
    pub outcome: Option<String>,
    pub session_key: Option<String>,
}

impl ExperienceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_min_quality(mut self, quality: f64) -> Self {
        self.min_quality = Some(quality);
        self
    }

    pub fn with_max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    /// SQL fragment + binds. Caller numbers placeholders after its own.
    fn sql_clauses(&self, first_placeholder: usize) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        let mut n = first_placeholder;
        if let Some(domain) = &self.domain {
            clauses.push(format!("e.domain = ?{n}"));
            binds.push(domain.clone());
            n += 1;
        }
        if let Some(min_quality) = self.min_quality {
            clauses.push(format!("e.quality >= ?{n}"));
            binds.push(min_quality.to_string());
            n += 1;
        }
        if let Some(max_age_ms) = self.max_age_ms {
            let cutoff = crate::now_ms() - max_age_ms;
            clauses.push(format!("e.created_at >= ?{n}"));
            binds.push(cutoff.to_string());
            n += 1;
        }
        if let Some(outcome) = &self.outcome {
            clauses.push(format!("e.outcome LIKE ?{n}"));
            binds.push(format!("%{outcome}%"));
            n += 1;
        }
        if let Some(session_key) = &self.session_key {
            clauses.push(format!("e.session_key = ?{n}"));
            binds.push(session_key.clone());
        }
        if clauses.is_empty() {
            (String::new(), binds)
        } else {
            (format!(" AND {}", clauses.join(" AND ")), binds)
        }
    }
}

/// A ranked `find_similar` hit.
#[derive(Debug, Clone)]
pub struct ExperienceMatch {
    pub experience: Experience,
    /// Cosine similarity of the stored embedding to the query.
    pub relevance: f32,
}

/// Experience store handle. Cheap to construct from `Db::experiences()`.
pub struct ExperienceCurator {
    store: Arc<Store>,
}

impl ExperienceCurator {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Persist an execution: embedding row plus experience row in one
    /// transaction. Quality is computed here.
    pub fn record(&self, new: NewExperience) -> Result<Experience, DbError> {
        if new.embedding.len() != self.store.dimension() {
            return Err(DbError::DimensionMismatch {
                expected: self.store.dimension(),
                actual: new.embedding.len(),
            });
        }
        let id = crate::new_record_id();
        let vector_id = crate::new_record_id();
        let now = crate::now_ms();
        let quality = quality_score(new.success, new.duration_ms, new.tokens_used, new.iterations);
        let bytes = embedding_to_bytes(&new.embedding);
        let norm = crate::metric::l2_norm(&new.embedding);

        self.store.with_retry("record_experience", || {
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
                .bind(KIND_EXPERIENCE)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO reasoning_experiences \
                     (id, vector_id, task, success, duration_ms, tokens_used, iterations, \
                      quality, approach, outcome, domain, agent_type, session_key, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .bind(&id)
                .bind(&vector_id)
                .bind(&new.task)
                .bind(new.success)
                .bind(new.duration_ms as i64)
                .bind(new.tokens_used as i64)
                .bind(new.iterations as i64)
                .bind(quality)
                .bind(&new.approach)
                .bind(&new.outcome)
                .bind(&new.domain)
                .bind(&new.agent_type)
                .bind(&new.session_key)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(())
            })
        })?;

        tracing::debug!(experience_id = %id, quality, "Experience recorded");
        Ok(Experience {
            id,
            vector_id,
            task: new.task,
            success: new.success,
            duration_ms: new.duration_ms,
            tokens_used: new.tokens_used,
            iterations: new.iterations,
            quality,
            approach: new.approach,
            outcome: new.outcome,
            domain: new.domain,
            agent_type: new.agent_type,
            session_key: new.session_key,
            created_at_ms: now,
        })
    }

    /// Fetch one experience by id.
    pub fn get(&self, id: &str) -> Result<Option<Experience>, DbError> {
        let rows = self.query("WHERE e.id = ?1", vec![id.to_string()], 1)?;
        Ok(rows.into_iter().next())
    }

    /// Similarity search restricted to experience embeddings, hydrated in
    /// one IN-clause round trip, with relevance = cosine similarity.
    pub fn find_similar(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &ExperienceFilter,
    ) -> Result<Vec<ExperienceMatch>, DbError> {
        if embedding.len() != self.store.dimension() {
            return Err(DbError::DimensionMismatch {
                expected: self.store.dimension(),
                actual: embedding.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let scored = self.store.brute_force_search(
            embedding,
            k * 4,
            crate::metric::DistanceMetric::Cosine,
            None,
            KIND_EXPERIENCE,
        )?;
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        let vector_ids: Vec<String> = scored.iter().map(|s| s.id.clone()).collect();
        let placeholders: Vec<String> = (1..=vector_ids.len()).map(|i| format!("?{i}")).collect();
        let (filter_sql, filter_binds) = filter.sql_clauses(vector_ids.len() + 1);
        let clause = format!(
            "WHERE e.vector_id IN ({}){filter_sql}",
            placeholders.join(",")
        );
        let mut binds = vector_ids;
        binds.extend(filter_binds);
        let experiences = self.query(&clause, binds, usize::MAX)?;

        let by_vector: std::collections::HashMap<String, Experience> = experiences
            .into_iter()
            .map(|e| (e.vector_id.clone(), e))
            .collect();

        let mut matches: Vec<ExperienceMatch> = scored
            .into_iter()
            .filter_map(|s| {
                let experience = by_vector.get(&s.id)?.clone();
                Some(ExperienceMatch {
                    experience,
                    relevance: s.score,
                })
            })
            .collect();
        matches.truncate(k);
        Ok(matches)
    }

    /// Filtered listing without a query vector, newest first.
    pub fn list(&self, filter: &ExperienceFilter, limit: usize) -> Result<Vec<Experience>, DbError> {
        let (filter_sql, binds) = filter.sql_clauses(1);
        let clause = format!("WHERE 1=1{filter_sql} ORDER BY e.created_at DESC");
        self.query(&clause, binds, limit)
    }

    fn query(
        &self,
        where_clause: &str,
        binds: Vec<String>,
        limit: usize,
    ) -> Result<Vec<Experience>, DbError> {
        use sqlx::Row;
        let limit_sql = if limit == usize::MAX {
            String::new()
        } else {
            format!(" LIMIT {limit}")
        };
        let sql = format!(
            "SELECT e.id, e.vector_id, e.task, e.success, e.duration_ms, e.tokens_used, \
             e.iterations, e.quality, e.approach, e.outcome, e.domain, e.agent_type, \
             e.session_key, e.created_at \
             FROM reasoning_experiences e {where_clause}{limit_sql}"
        );
        let rows = self.store.rt.block_on(async {
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind);
            }
            query
                .fetch_all(&self.store.pool)
                .await
                .map_err(StoreError::from)
        })?;
        Ok(rows
            .into_iter()
            .map(|row| Experience {
                id: row.get(0),
                vector_id: row.get(1),
                task: row.get(2),
                success: row.get::<i64, _>(3) != 0,
                duration_ms: row.get::<i64, _>(4).max(0) as u64,
                tokens_used: row.get::<i64, _>(5).max(0) as u64,
                iterations: row.get::<i64, _>(6).max(0) as u32,
                quality: row.get(7),
                approach: row.get(8),
                outcome: row.get(9),
                domain: row.get(10),
                agent_type: row.get(11),
                session_key: row.get(12),
                created_at_ms: row.get(13),
            })
            .collect())
    }
}
