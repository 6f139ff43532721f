//! Caller-owned key/value cache threaded through forward calls.
//!
//! A forward call never mutates the cache it is given; it returns a new one
//! extended with the positions it processed. Tensors share storage, so
//! keeping an older cache around (to retry a failed step, say) is cheap.

use crate::tensor::Tensor;
use crate::{Error, Result};

/// Keys and values of one attention layer, each
/// `(batch, local_heads, seq, head_dim)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerKv {
    pub key: Tensor,
    pub value: Tensor,
}

impl LayerKv {
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] unless key and value are 4-D with the
    /// same shape.
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        if key.ndim() != 4 || key.shape() != value.shape() {
            return Err(Error::shape_mismatch(
                "cached value (expected the key's 4-D shape)",
                key.shape(),
                value.shape(),
            ));
        }
        Ok(Self { key, value })
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.key.shape()[0]
    }

    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.key.shape()[2]
    }

    /// Append new positions along the sequence dimension.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if batch, heads or head size differ.
    pub fn append(&self, key: &Tensor, value: &Tensor) -> Result<Self> {
        Self::new(
            Tensor::cat(&[self.key.clone(), key.clone()], 2)?,
            Tensor::cat(&[self.value.clone(), value.clone()], 2)?,
        )
    }
}

/// Ordered per-layer attention context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvCache {
    layers: Vec<LayerKv>,
}

impl KvCache {
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if layers disagree on batch size or
    /// sequence length.
    pub fn from_layers(layers: Vec<LayerKv>) -> Result<Self> {
        if let Some(first) = layers.first() {
            let expected = [first.batch_size(), first.seq_len()];
            for layer in &layers[1..] {
                let got = [layer.batch_size(), layer.seq_len()];
                if got != expected {
                    return Err(Error::shape_mismatch(
                        "cache layer (batch, seq)",
                        &expected,
                        &got,
                    ));
                }
            }
        }
        Ok(Self { layers })
    }

    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Batch size, or `None` for a cache without layers.
    #[must_use]
    pub fn batch_size(&self) -> Option<usize> {
        self.layers.first().map(LayerKv::batch_size)
    }

    /// Number of cached positions (0 for a cache without layers).
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.layers.first().map_or(0, LayerKv::seq_len)
    }

    #[must_use]
    pub fn layer(&self, idx: usize) -> Option<&LayerKv> {
        self.layers.get(idx)
    }

    #[must_use]
    pub fn layers(&self) -> &[LayerKv] {
        &self.layers
    }
}
