//! Vector codec: on-disk byte layout and optional quantization
//!
//! The store persists embeddings as packed little-endian IEEE-754 f32 with
//! a precomputed L2 norm. Quantized codes live on a separate column and
//! always start with a 1-byte codec tag; a decoded quantized vector is an
//! approximation and is never written back as if it were the original.
//!
//! Codec parameters are frozen at training time. Re-training requires a
//! full index rebuild, so trained state is immutable once installed.

mod binary;
mod product;
mod scalar;

pub use binary::BinaryQuantizer;
pub use product::ProductQuantizer;
pub use scalar::ScalarQuantizer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{QuantizationKind, QuantizationOptions};
use crate::metric::l2_norm;
use crate::store::helpers::{bytes_to_embedding, embedding_to_bytes};

/// Codec tags, the first byte of every quantized blob. Never renumber.
pub(crate) const TAG_SCALAR: u8 = 1;
pub(crate) const TAG_PRODUCT: u8 = 2;
pub(crate) const TAG_BINARY: u8 = 3;

/// Minimum training sample for the product quantizer's k-means.
pub const MIN_PQ_TRAINING_SAMPLE: usize = 800;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("dimension mismatch: codec expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid blob: {0}")]
    InvalidBlob(String),
    #[error("quantizer has not been trained")]
    NotTrained,
    #[error("training sample too small: need >= {needed}, got {got}")]
    InsufficientSample { needed: usize, got: usize },
}

/// Trained quantizer state, serializable for persistence in `hnsw_meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Quantizer {
    Scalar(ScalarQuantizer),
    Product(ProductQuantizer),
    Binary(BinaryQuantizer),
}

impl Quantizer {
    fn tag(&self) -> u8 {
        match self {
            Quantizer::Scalar(_) => TAG_SCALAR,
            Quantizer::Product(_) => TAG_PRODUCT,
            Quantizer::Binary(_) => TAG_BINARY,
        }
    }
}

/// Converts between in-memory embeddings and on-disk bytes, and owns the
/// optional trained quantizer.
#[derive(Debug, Clone)]
pub struct VectorCodec {
    dimension: usize,
    quantizer: Option<Quantizer>,
}

impl VectorCodec {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            quantizer: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn quantizer(&self) -> Option<&Quantizer> {
        self.quantizer.as_ref()
    }

    /// Stable id of the installed quantizer (0 = none), persisted in
    /// `hnsw_meta` so reopening validates codec compatibility.
    pub fn codec_id(&self) -> u8 {
        self.quantizer.as_ref().map_or(0, Quantizer::tag)
    }

    /// Pack an embedding for storage: LE f32 bytes plus the L2 norm.
    pub fn encode(&self, embedding: &[f32]) -> Result<(Vec<u8>, f32), CodecError> {
        if embedding.len() != self.dimension {
            return Err(CodecError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok((embedding_to_bytes(embedding), l2_norm(embedding)))
    }

    /// Unpack a stored embedding blob. Exact inverse of `encode`.
    pub fn decode(&self, blob: &[u8]) -> Result<Vec<f32>, CodecError> {
        bytes_to_embedding(blob, self.dimension)
            .map_err(|e| CodecError::InvalidBlob(e.to_string()))
    }

    /// Train the configured quantizer on a sample and install it.
    ///
    /// Scalar needs any non-empty sample; product needs at least
    /// [`MIN_PQ_TRAINING_SAMPLE`] vectors; binary has no trained state.
    pub fn train(
        &mut self,
        options: &QuantizationOptions,
        sample: &[Vec<f32>],
    ) -> Result<(), CodecError> {
        let kind = options.kind.ok_or(CodecError::NotTrained)?;
        for v in sample {
            if v.len() != self.dimension {
                return Err(CodecError::DimensionMismatch {
                    expected: self.dimension,
                    actual: v.len(),
                });
            }
        }
        let quantizer = match kind {
            QuantizationKind::Scalar => {
                if sample.is_empty() {
                    return Err(CodecError::InsufficientSample { needed: 1, got: 0 });
                }
                Quantizer::Scalar(ScalarQuantizer::train(self.dimension, sample))
            }
            QuantizationKind::Product => {
                if sample.len() < MIN_PQ_TRAINING_SAMPLE {
                    return Err(CodecError::InsufficientSample {
                        needed: MIN_PQ_TRAINING_SAMPLE,
                        got: sample.len(),
                    });
                }
                Quantizer::Product(ProductQuantizer::train(
                    self.dimension,
                    options.subvectors,
                    options.bits,
                    sample,
                ))
            }
            QuantizationKind::Binary => Quantizer::Binary(BinaryQuantizer::new(self.dimension)),
        };
        tracing::info!(
            kind = ?kind,
            sample = sample.len(),
            "Quantizer trained"
        );
        self.quantizer = Some(quantizer);
        Ok(())
    }

    /// Install a previously trained quantizer (load path).
    pub fn install(&mut self, quantizer: Quantizer) {
        self.quantizer = Some(quantizer);
    }

    /// Quantize an embedding: tag byte followed by the code.
    pub fn quantize(&self, embedding: &[f32]) -> Result<Vec<u8>, CodecError> {
        if embedding.len() != self.dimension {
            return Err(CodecError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        let quantizer = self.quantizer.as_ref().ok_or(CodecError::NotTrained)?;
        let mut blob = vec![quantizer.tag()];
        match quantizer {
            Quantizer::Scalar(q) => blob.extend(q.quantize(embedding)),
            Quantizer::Product(q) => blob.extend(q.quantize(embedding)),
            Quantizer::Binary(q) => blob.extend(q.quantize(embedding)),
        }
        Ok(blob)
    }

    /// Reconstruct an approximate embedding from a quantized blob.
    pub fn dequantize(&self, blob: &[u8]) -> Result<Vec<f32>, CodecError> {
        let quantizer = self.quantizer.as_ref().ok_or(CodecError::NotTrained)?;
        let (tag, code) = blob
            .split_first()
            .ok_or_else(|| CodecError::InvalidBlob("empty quantized blob".to_string()))?;
        if *tag != quantizer.tag() {
            return Err(CodecError::InvalidBlob(format!(
                "blob tag {tag} does not match installed codec {}",
                quantizer.tag()
            )));
        }
        match quantizer {
            Quantizer::Scalar(q) => q.dequantize(code),
            Quantizer::Product(q) => q.dequantize(code),
            Quantizer::Binary(q) => q.dequantize(code),
        }
    }

    /// Serialize trained state for persistence.
    pub fn quantizer_to_json(&self) -> Result<Option<String>, CodecError> {
        self.quantizer
            .as_ref()
            .map(|q| {
                serde_json::to_string(q).map_err(|e| CodecError::InvalidBlob(e.to_string()))
            })
            .transpose()
    }

    /// Restore trained state persisted by `quantizer_to_json`.
    pub fn quantizer_from_json(&mut self, json: &str) -> Result<(), CodecError> {
        let quantizer: Quantizer =
            serde_json::from_str(json).map_err(|e| CodecError::InvalidBlob(e.to_string()))?;
        self.quantizer = Some(quantizer);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn clustered_sample(
    dimension: usize,
    anchors: usize,
    per_anchor: usize,
    seed: u64,
) -> Vec<Vec<f32>> {
    // Structured embeddings: points scattered tightly around a few anchor
    // directions. PQ behaves like production data on these, unlike uniform
    // noise.
    use rand::rngs::StdRng;
    use rand::{RngExt, SeedableRng};
    let mut rng = StdRng::seed_from_u64(seed);
    let anchor_vecs: Vec<Vec<f32>> = (0..anchors)
        .map(|_| (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();
    let mut out = Vec::with_capacity(anchors * per_anchor);
    for anchor in &anchor_vecs {
        for _ in 0..per_anchor {
            let v: Vec<f32> = anchor
                .iter()
                .map(|&a| a + rng.random_range(-0.05..0.05))
                .collect();
            out.push(v);
        }
    }
    out
}
