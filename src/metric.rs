//! Distance metrics and vector math primitives
//!
//! Shared by the brute-force search path, the HNSW index, and the quantizers.
//! Uses SIMD acceleration when available (2-4x faster on AVX2/NEON) with an
//! f64-accumulating scalar fallback for unsupported architectures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance metric used for similarity search.
///
/// The metric is fixed per database at init time and stored in `hnsw_meta`;
/// queries that request a different metric are answered from a fresh
/// computation (the cache fingerprint includes the metric byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine similarity (default). Scores in [-1, 1], higher is better.
    Cosine,
    /// Euclidean (L2) distance. Scores reported as 1 / (1 + distance).
    Euclidean,
    /// Raw dot product. Scores are the dot product itself.
    Dot,
}

impl DistanceMetric {
    /// Stable one-byte identifier, persisted in `hnsw_meta` and used in
    /// cache fingerprints. Never renumber.
    pub fn id(self) -> u8 {
        match self {
            DistanceMetric::Cosine => 0,
            DistanceMetric::Euclidean => 1,
            DistanceMetric::Dot => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(DistanceMetric::Cosine),
            1 => Some(DistanceMetric::Euclidean),
            2 => Some(DistanceMetric::Dot),
            _ => None,
        }
    }

    /// Distance between two vectors — lower is closer. This is the ordering
    /// the HNSW graph is built and searched with.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceMetric::Euclidean => l2_squared(a, b).max(0.0).sqrt(),
            DistanceMetric::Dot => -dot(a, b),
        }
    }

    /// Convert a distance back into the user-facing similarity score.
    pub fn score_from_distance(self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::Euclidean => 1.0 / (1.0 + distance.max(0.0)),
            DistanceMetric::Dot => -distance,
        }
    }

    /// User-facing similarity score — higher is better.
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        self.score_from_distance(self.distance(a, b))
    }
}

impl Default for DistanceMetric {
    fn default() -> Self {
        DistanceMetric::Cosine
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::Euclidean => write!(f, "euclidean"),
            DistanceMetric::Dot => write!(f, "dot"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "dot" | "ip" => Ok(DistanceMetric::Dot),
            other => Err(format!("unknown metric '{other}'")),
        }
    }
}

/// Dot product with SIMD acceleration.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    use simsimd::SpatialSimilarity;
    let score = f32::dot(a, b).unwrap_or_else(|| {
        // Fallback for unsupported architectures - accumulate in f64 for precision
        a.iter()
            .zip(b)
            .map(|(&x, &y)| (x as f64) * (y as f64))
            .sum::<f64>()
    }) as f32;
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Squared Euclidean distance with SIMD acceleration.
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    use simsimd::SpatialSimilarity;
    let d = f32::sqeuclidean(a, b).unwrap_or_else(|| {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| {
                let diff = (x as f64) - (y as f64);
                diff * diff
            })
            .sum::<f64>()
    }) as f32;
    if d.is_finite() {
        d
    } else {
        f32::INFINITY
    }
}

/// Full cosine similarity with norm computation.
///
/// Vectors in the store are not required to be pre-normalized, so this
/// always divides by both norms. Returns 0.0 for zero-norm inputs and for
/// mismatched lengths rather than NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let denom = l2_norm(a) * l2_norm(b);
    if denom == 0.0 {
        return 0.0;
    }
    let result = dot(a, b) / denom;
    if result.is_finite() {
        result
    } else {
        0.0
    }
}

/// L2 norm, accumulated in f64 so long vectors don't lose precision.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt() as f32
}
