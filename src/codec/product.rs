//! Product quantizer
//!
//! Splits each vector into `subvectors` contiguous subspaces and learns a
//! codebook of 2^bits centroids per subspace with k-means. A code stores
//! one centroid index per subspace (one byte each), giving compression up
//! to ~400x for large dimensions. Queries use asymmetric distance
//! computation: per-subspace distances from the query to every centroid
//! are tabulated once, then each code is scored by table lookups.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::CodecError;
use crate::metric::l2_squared;

/// k-means refinement passes per subspace.
const KMEANS_ITERATIONS: usize = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dimension: usize,
    subvectors: usize,
    bits: u8,
    /// `codebooks[s]` holds 2^bits centroids for subspace `s`, each of
    /// length `dimension / subvectors`, flattened row-major.
    codebooks: Vec<Vec<f32>>,
}

impl ProductQuantizer {
    /// Train per-subspace codebooks over the sample.
    ///
    /// Subspaces are independent, so training parallelizes across them.
    pub fn train(dimension: usize, subvectors: usize, bits: u8, sample: &[Vec<f32>]) -> Self {
        let sub_dim = dimension / subvectors;
        let k = 1usize << bits;

        let codebooks: Vec<Vec<f32>> = (0..subvectors)
            .into_par_iter()
            .map(|s| {
                let offset = s * sub_dim;
                let slices: Vec<&[f32]> = sample
                    .iter()
                    .map(|v| &v[offset..offset + sub_dim])
                    .collect();
                kmeans(&slices, k, sub_dim, s as u64)
            })
            .collect();

        tracing::debug!(
            subvectors,
            bits,
            centroids = k,
            "Product quantizer codebooks trained"
        );

        Self {
            dimension,
            subvectors,
            bits,
            codebooks,
        }
    }

    fn sub_dim(&self) -> usize {
        self.dimension / self.subvectors
    }

    fn centroids(&self) -> usize {
        1usize << self.bits
    }

    fn centroid(&self, subspace: usize, index: usize) -> &[f32] {
        let sub_dim = self.sub_dim();
        &self.codebooks[subspace][index * sub_dim..(index + 1) * sub_dim]
    }

    /// One byte per subspace: the nearest centroid's index.
    pub fn quantize(&self, embedding: &[f32]) -> Vec<u8> {
        let sub_dim = self.sub_dim();
        (0..self.subvectors)
            .map(|s| {
                let slice = &embedding[s * sub_dim..(s + 1) * sub_dim];
                let mut best = 0usize;
                let mut best_dist = f32::INFINITY;
                for c in 0..self.centroids() {
                    let d = l2_squared(slice, self.centroid(s, c));
                    if d < best_dist {
                        best_dist = d;
                        best = c;
                    }
                }
                best as u8
            })
            .collect()
    }

    /// Reconstruct the approximation: concatenated centroids.
    pub fn dequantize(&self, code: &[u8]) -> Result<Vec<f32>, CodecError> {
        if code.len() != self.subvectors {
            return Err(CodecError::InvalidBlob(format!(
                "product code is {} bytes, expected {}",
                code.len(),
                self.subvectors
            )));
        }
        let mut out = Vec::with_capacity(self.dimension);
        for (s, &c) in code.iter().enumerate() {
            let c = c as usize;
            if c >= self.centroids() {
                return Err(CodecError::InvalidBlob(format!(
                    "centroid index {c} out of range for {} bits",
                    self.bits
                )));
            }
            out.extend_from_slice(self.centroid(s, c));
        }
        Ok(out)
    }

    /// Precompute the asymmetric distance table for a query: squared
    /// distance from the query's subvector to every centroid, per
    /// subspace. Layout: `table[s * centroids + c]`.
    pub fn distance_table(&self, query: &[f32]) -> Result<Vec<f32>, CodecError> {
        if query.len() != self.dimension {
            return Err(CodecError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let sub_dim = self.sub_dim();
        let k = self.centroids();
        let mut table = vec![0.0f32; self.subvectors * k];
        for s in 0..self.subvectors {
            let slice = &query[s * sub_dim..(s + 1) * sub_dim];
            for c in 0..k {
                table[s * k + c] = l2_squared(slice, self.centroid(s, c));
            }
        }
        Ok(table)
    }

    /// Squared distance from the tabulated query to a code: one lookup
    /// per subspace.
    pub fn adc_distance(&self, table: &[f32], code: &[u8]) -> Result<f32, CodecError> {
        if code.len() != self.subvectors {
            return Err(CodecError::InvalidBlob(format!(
                "product code is {} bytes, expected {}",
                code.len(),
                self.subvectors
            )));
        }
        let k = self.centroids();
        Ok(code
            .iter()
            .enumerate()
            .map(|(s, &c)| table[s * k + c as usize])
            .sum())
    }
}

/// Lloyd's k-means over subvector slices, deterministic per subspace.
///
/// Initialization picks k distinct sample points; clusters that go empty
/// during refinement are re-seeded from a random sample point.
fn kmeans(points: &[&[f32]], k: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(0x5eed ^ seed);

    // Initial centroids: k distinct random points, repeating once the
    // sample is exhausted (callers guarantee sample >= k in practice).
    let mut chosen = std::collections::HashSet::new();
    let mut centroids: Vec<f32> = Vec::with_capacity(k * dim);
    while centroids.len() < k * dim {
        let idx = rng.random_range(0..points.len());
        if chosen.insert(idx) || chosen.len() >= points.len() {
            centroids.extend_from_slice(points[idx]);
        }
    }

    let mut assignment = vec![0usize; points.len()];
    for _ in 0..KMEANS_ITERATIONS {
        let mut moved = false;
        for (i, p) in points.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for c in 0..k {
                let d = l2_squared(p, &centroids[c * dim..(c + 1) * dim]);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            if assignment[i] != best {
                assignment[i] = best;
                moved = true;
            }
        }

        let mut sums = vec![0.0f64; k * dim];
        let mut counts = vec![0usize; k];
        for (i, p) in points.iter().enumerate() {
            let c = assignment[i];
            counts[c] += 1;
            for (j, &x) in p.iter().enumerate() {
                sums[c * dim + j] += x as f64;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed a dead centroid from a random point
                let idx = rng.random_range(0..points.len());
                centroids[c * dim..(c + 1) * dim].copy_from_slice(points[idx]);
                continue;
            }
            for j in 0..dim {
                centroids[c * dim + j] = (sums[c * dim + j] / counts[c] as f64) as f32;
            }
        }

        if !moved {
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::clustered_sample;

    #[test]
    fn test_quantize_code_width() {
        let sample = clustered_sample(16, 4, 50, 2);
        let pq = ProductQuantizer::train(16, 4, 8, &sample);
        assert_eq!(pq.quantize(&sample[0]).len(), 4);
    }

    #[test]
    fn test_adc_matches_reconstruction_distance() {
        let sample = clustered_sample(16, 4, 60, 9);
        let pq = ProductQuantizer::train(16, 4, 6, &sample);
        let query = &sample[10];
        let code = pq.quantize(&sample[200]);
        let table = pq.distance_table(query).unwrap();

        let adc = pq.adc_distance(&table, &code).unwrap();
        let reconstructed = pq.dequantize(&code).unwrap();
        let direct = l2_squared(query, &reconstructed);
        assert!(
            (adc - direct).abs() < 1e-3,
            "ADC {adc} should equal reconstruction distance {direct}"
        );
    }

    #[test]
    fn test_reconstruction_stays_near_own_cluster() {
        let sample = clustered_sample(16, 4, 60, 13);
        let pq = ProductQuantizer::train(16, 4, 4, &sample);
        // sample[0] and sample[1] share an anchor; sample[130] does not
        let a_hat = pq.dequantize(&pq.quantize(&sample[0])).unwrap();
        let near = l2_squared(&a_hat, &sample[1]);
        let far = l2_squared(&a_hat, &sample[130]);
        assert!(
            near < far,
            "reconstruction drifted out of its cluster: {near} vs {far}"
        );
    }

    #[test]
    fn test_dequantize_rejects_bad_code() {
        let sample = clustered_sample(16, 4, 60, 4);
        let pq = ProductQuantizer::train(16, 4, 4, &sample);
        assert!(pq.dequantize(&[0u8; 3]).is_err());
        // Index 200 is out of range for 4 bits (16 centroids)
        assert!(pq.dequantize(&[200u8, 0, 0, 0]).is_err());
    }
}
