//! Context synthesis: parallel multi-source retrieval
//!
//! Given a query embedding, four sources are queried in parallel —
//! patterns, experiences, recent experiences (24 h), and explicit session
//! rows — then merged into one `Context` with per-id deduplication (the
//! higher-relevance duplicate wins) and a confidence score:
//!
//!   confidence = 0.4 * pattern_component
//!              + 0.4 * experience_component
//!              + 0.2 * recency_component
//!
//! where each component is the mean relevance of its source, clamped to
//! [0, 1], and zero when the source returned nothing. Empty inputs yield
//! zero confidence; there is no division by zero anywhere.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::experiences::{Experience, ExperienceCurator, ExperienceFilter, ExperienceMatch};
use super::patterns::{PatternFilter, PatternMatch, PatternMatcher};
use crate::store::Store;
use crate::DbError;

/// Recent source horizon: 24 hours.
const RECENT_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// What to retrieve and how to filter each source.
#[derive(Debug, Clone)]
pub struct ContextQuery {
    pub embedding: Vec<f32>,
    /// Patterns: how many, and an optional success-rate floor.
    pub k_patterns: usize,
    pub min_success_rate: Option<f64>,
    /// Experiences: how many, plus the standard filters.
    pub k_experiences: usize,
    pub domain: Option<String>,
    pub min_quality: Option<f64>,
    pub max_age_ms: Option<i64>,
    /// Session rows under this key are always included.
    pub session_key: Option<String>,
}

impl ContextQuery {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            k_patterns: 5,
            min_success_rate: None,
            k_experiences: 5,
            domain: None,
            min_quality: None,
            max_age_ms: None,
            session_key: None,
        }
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// The synthesized context.
#[derive(Debug)]
pub struct Context {
    /// Deduplicated patterns, best relevance first.
    pub patterns: Vec<PatternMatch>,
    /// Deduplicated experiences (standard + recent sources merged),
    /// best relevance first.
    pub experiences: Vec<ExperienceMatch>,
    /// Explicit session rows, newest first.
    pub session: Vec<Experience>,
    /// One-line human-readable summary.
    pub summary: String,
    /// Blended confidence in [0, 1].
    pub confidence: f64,
}

/// Context synthesis handle. Cheap to construct from `Db::context()`.
pub struct ContextSynthesizer {
    store: Arc<Store>,
}

impl ContextSynthesizer {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Retrieve all sources in parallel and merge.
    ///
    /// Each source runs on its own scoped thread over the shared store;
    /// the store's pool serves the four queries concurrently.
    pub fn synthesize(&self, query: &ContextQuery) -> Result<Context, DbError> {
        if query.embedding.len() != self.store.dimension() {
            return Err(DbError::DimensionMismatch {
                expected: self.store.dimension(),
                actual: query.embedding.len(),
            });
        }

        let patterns_handle = PatternMatcher::new(Arc::clone(&self.store));
        let experiences_handle = ExperienceCurator::new(Arc::clone(&self.store));
        let recent_handle = ExperienceCurator::new(Arc::clone(&self.store));
        let session_handle = ExperienceCurator::new(Arc::clone(&self.store));

        let mut pattern_filter = PatternFilter::new();
        if let Some(min) = query.min_success_rate {
            pattern_filter = pattern_filter.with_min_success_rate(min);
        }
        let mut experience_filter = ExperienceFilter::new();
        if let Some(domain) = &query.domain {
            experience_filter = experience_filter.with_domain(domain.clone());
        }
        if let Some(min_quality) = query.min_quality {
            experience_filter = experience_filter.with_min_quality(min_quality);
        }
        if let Some(max_age_ms) = query.max_age_ms {
            experience_filter = experience_filter.with_max_age_ms(max_age_ms);
        }
        let recent_filter = ExperienceFilter::new().with_max_age_ms(RECENT_MAX_AGE_MS);
        let session_filter = query
            .session_key
            .as_ref()
            .map(|key| ExperienceFilter::new().with_session_key(key.clone()));

        // Issue in parallel, await all
        let (patterns, experiences, recent, session) = std::thread::scope(|scope| {
            let embedding = &query.embedding;
            let patterns = scope.spawn(|| {
                patterns_handle.find_similar(embedding, query.k_patterns, None, &pattern_filter)
            });
            let experiences = scope.spawn(|| {
                experiences_handle.find_similar(embedding, query.k_experiences, &experience_filter)
            });
            let recent = scope.spawn(|| {
                recent_handle.find_similar(embedding, query.k_experiences, &recent_filter)
            });
            let session = scope.spawn(|| match &session_filter {
                Some(filter) => session_handle.list(filter, 50),
                None => Ok(Vec::new()),
            });
            (
                patterns.join(),
                experiences.join(),
                recent.join(),
                session.join(),
            )
        });

        let patterns = flatten_join(patterns)?;
        let experiences = flatten_join(experiences)?;
        let recent = flatten_join(recent)?;
        let session = flatten_join(session)?;

        // Components are computed per source before the merge
        let pattern_component = mean_relevance(patterns.iter().map(|m| m.relevance));
        let experience_component = mean_relevance(experiences.iter().map(|m| m.relevance));
        let recency_component = mean_relevance(recent.iter().map(|m| m.relevance));
        let confidence =
            0.4 * pattern_component + 0.4 * experience_component + 0.2 * recency_component;

        // Dedup patterns by id (sources can't overlap today, but the
        // ordered map also gives a stable ordering)
        let mut pattern_map: BTreeMap<String, PatternMatch> = BTreeMap::new();
        for m in patterns {
            insert_better(&mut pattern_map, m.pattern.id.clone(), m, |m| m.relevance);
        }
        let mut merged_patterns: Vec<PatternMatch> = pattern_map.into_values().collect();
        merged_patterns.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

        // Dedup experiences across the standard and recent sources
        let mut experience_map: BTreeMap<String, ExperienceMatch> = BTreeMap::new();
        for m in experiences.into_iter().chain(recent) {
            insert_better(&mut experience_map, m.experience.id.clone(), m, |m| {
                m.relevance
            });
        }
        let mut merged_experiences: Vec<ExperienceMatch> = experience_map.into_values().collect();
        merged_experiences.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

        let summary = build_summary(&merged_patterns, &merged_experiences, &session, confidence);

        Ok(Context {
            patterns: merged_patterns,
            experiences: merged_experiences,
            session,
            summary,
            confidence,
        })
    }
}

/// Unwrap a scoped-thread join, converting panics to internal errors.
fn flatten_join<T>(
    joined: std::thread::Result<Result<T, DbError>>,
) -> Result<T, DbError> {
    match joined {
        Ok(result) => result,
        Err(_) => Err(DbError::Internal(
            "context retrieval thread panicked".to_string(),
        )),
    }
}

/// Mean relevance clamped to [0, 1]; zero for an empty source.
fn mean_relevance(scores: impl Iterator<Item = f32>) -> f64 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for score in scores {
        sum += score.clamp(0.0, 1.0) as f64;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Keep the higher-relevance entry on id collision.
fn insert_better<V>(
    map: &mut BTreeMap<String, V>,
    key: String,
    value: V,
    relevance: impl Fn(&V) -> f32,
) {
    match map.get(&key) {
        Some(existing) if relevance(existing) >= relevance(&value) => {}
        _ => {
            map.insert(key, value);
        }
    }
}

fn build_summary(
    patterns: &[PatternMatch],
    experiences: &[ExperienceMatch],
    session: &[Experience],
    confidence: f64,
) -> String {
    let best_success = patterns
        .iter()
        .map(|m| m.pattern.success_rate)
        .fold(0.0f64, f64::max);
    let avg_quality = if experiences.is_empty() {
        0.0
    } else {
        experiences.iter().map(|m| m.experience.quality).sum::<f64>() / experiences.len() as f64
    };
    format!(
        "{} patterns (best success {:.0}%), {} experiences (avg quality {:.2}), {} session rows; confidence {:.2}",
        patterns.len(),
        best_success * 100.0,
        experiences.len(),
        avg_quality,
        session.len(),
        confidence
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::experiences::NewExperience;
    use crate::cognitive::patterns::NewPattern;
    use crate::config::DbOptions;

    fn setup() -> (Arc<Store>, ContextSynthesizer) {
        let store = Arc::new(Store::open(&DbOptions::new(4)).unwrap());
        let synthesizer = ContextSynthesizer::new(Arc::clone(&store));
        (store, synthesizer)
    }

    fn seed(store: &Arc<Store>) {
        let patterns = PatternMatcher::new(Arc::clone(store));
        patterns
            .store_pattern(NewPattern {
                task_type: "refactor".to_string(),
                approach: "small steps".to_string(),
                embedding: vec![1.0, 0.0, 0.0, 0.0],
                ..Default::default()
            })
            .unwrap();

        let experiences = ExperienceCurator::new(Arc::clone(store));
        experiences
            .record(NewExperience {
                task: "refactor parser".to_string(),
                success: true,
                duration_ms: 2000,
                tokens_used: 300,
                iterations: 1,
                embedding: vec![0.9, 0.1, 0.0, 0.0],
                session_key: Some("s1".to_string()),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_empty_sources_zero_confidence() {
        let (_store, synthesizer) = setup();
        let context = synthesizer
            .synthesize(&ContextQuery::new(vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        assert!(context.patterns.is_empty());
        assert!(context.experiences.is_empty());
        assert!(context.session.is_empty());
        assert_eq!(context.confidence, 0.0);
    }

    #[test]
    fn test_synthesis_merges_sources() {
        let (store, synthesizer) = setup();
        seed(&store);

        let context = synthesizer
            .synthesize(
                &ContextQuery::new(vec![1.0, 0.0, 0.0, 0.0]).with_session_key("s1"),
            )
            .unwrap();

        assert_eq!(context.patterns.len(), 1);
        // The experience shows up once despite matching both the
        // standard and the recent source
        assert_eq!(context.experiences.len(), 1);
        assert_eq!(context.session.len(), 1);
        assert!(context.confidence > 0.0);
        assert!(context.summary.contains("1 patterns"));
    }

    #[test]
    fn test_confidence_weights() {
        // Perfect relevance in every source gives 0.4 + 0.4 + 0.2 = 1.0
        assert!((0.4 + 0.4 + 0.2 - 1.0f64).abs() < 1e-12);

        let (store, synthesizer) = setup();
        seed(&store);
        let context = synthesizer
            .synthesize(&ContextQuery::new(vec![1.0, 0.0, 0.0, 0.0]))
            .unwrap();
        assert!(context.confidence <= 1.0);
        assert!(context.confidence > 0.5, "near-exact matches in all sources");
    }

    #[test]
    fn test_dimension_mismatch() {
        let (_store, synthesizer) = setup();
        assert!(matches!(
            synthesizer.synthesize(&ContextQuery::new(vec![1.0, 0.0])),
            Err(DbError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_mean_relevance_edge_cases() {
        assert_eq!(mean_relevance(std::iter::empty()), 0.0);
        // Negative cosine clamps to zero instead of dragging the mean
        // below zero
        let mean = mean_relevance([0.5f32, -1.0].into_iter());
        assert!((mean - 0.25).abs() < 1e-9);
    }
}
