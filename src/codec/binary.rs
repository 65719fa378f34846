//! Sign-bit binary quantizer
//!
//! One bit per dimension, packed LSB-first: 32x compression with
//! substantially lower fidelity than the other codecs. Intended for
//! coarse prefiltering only — callers re-rank candidates with full
//! vectors.

use serde::{Deserialize, Serialize};

use super::CodecError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryQuantizer {
    dimension: usize,
}

impl BinaryQuantizer {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn code_len(&self) -> usize {
        self.dimension.div_ceil(8)
    }

    /// Sign bits, LSB-first within each byte. Zero counts as positive.
    pub fn quantize(&self, embedding: &[f32]) -> Vec<u8> {
        let mut code = vec![0u8; self.code_len()];
        for (i, &x) in embedding.iter().enumerate() {
            if x >= 0.0 {
                code[i / 8] |= 1 << (i % 8);
            }
        }
        code
    }

    /// Reconstruct to +-1 per dimension.
    pub fn dequantize(&self, code: &[u8]) -> Result<Vec<f32>, CodecError> {
        if code.len() != self.code_len() {
            return Err(CodecError::InvalidBlob(format!(
                "binary code is {} bytes, expected {}",
                code.len(),
                self.code_len()
            )));
        }
        Ok((0..self.dimension)
            .map(|i| {
                if code[i / 8] & (1 << (i % 8)) != 0 {
                    1.0
                } else {
                    -1.0
                }
            })
            .collect())
    }

    /// Hamming distance between two codes (bit count of the xor).
    pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| (x ^ y).count_ones())
            .sum()
    }
}
