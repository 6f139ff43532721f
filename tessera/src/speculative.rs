//! Medusa-style speculator head
//!
//! Each head is a stack of residual SiLU blocks followed by an output
//! projection to the vocabulary; head `i` proposes the token `i + 1` steps
//! ahead. Weights are replicated on every rank.
//!
//! Tensor names inside the speculator checkpoint:
//! `{head}.{block}.linear.weight`, `{head}.{block}.linear.bias` and
//! `{head}.{num_layers}.weight` for the output projection.

use tracing::info;

use crate::hub;
use crate::model::SpeculatorConfig;
use crate::ops::{self, Activation, DenseWeight};
use crate::tensor::Tensor;
use crate::weights::{LinearWeight, WeightStore};
use crate::{Error, Result};

struct ResBlock {
    weight: DenseWeight,
    bias: Vec<f32>,
}

struct MedusaHead {
    blocks: Vec<ResBlock>,
    out: DenseWeight,
}

/// Speculative heads applied to the model's final hidden state.
pub struct MedusaSpeculator {
    heads: Vec<MedusaHead>,
    hidden_size: usize,
    vocab_size: usize,
}

impl MedusaSpeculator {
    /// Open the speculator's weight files next to the model's store and load
    /// every head.
    ///
    /// # Errors
    /// Returns [`Error::Assembly`] if a head is missing or shaped
    /// inconsistently.
    pub fn open(config: &SpeculatorConfig, model_weights: &WeightStore) -> Result<Self> {
        let files = hub::weight_files(&config.path, ".safetensors")?;
        let weights = model_weights.sibling(&files)?;
        Self::load(config, &weights)
    }

    /// # Errors
    /// Returns [`Error::Assembly`] if a head is missing or shaped
    /// inconsistently.
    pub fn load(config: &SpeculatorConfig, weights: &WeightStore) -> Result<Self> {
        let assembly = |e: Error| match e {
            Error::MissingWeight(name) => {
                Error::Assembly(format!("speculator {} lacks {name}", config.model_id))
            }
            other => other,
        };

        let mut heads = Vec::with_capacity(config.num_heads);
        for h in 0..config.num_heads {
            let mut blocks = Vec::with_capacity(config.num_layers);
            for b in 0..config.num_layers {
                let prefix = format!("{h}.{b}.linear");
                let weight = weights.get(&format!("{prefix}.weight")).map_err(assembly)?;
                let bias = weights.get(&format!("{prefix}.bias")).map_err(assembly)?;
                blocks.push(ResBlock {
                    weight: DenseWeight::from_linear(&LinearWeight::Unquantized(weight))?,
                    bias: bias.to_f32_vec(),
                });
            }
            let out = weights
                .get(&format!("{h}.{}.weight", config.num_layers))
                .map_err(assembly)?;
            heads.push(MedusaHead {
                blocks,
                out: DenseWeight::from_linear(&LinearWeight::Unquantized(out))?,
            });
        }

        let first = heads
            .first()
            .ok_or_else(|| Error::Assembly("speculator has no heads".into()))?;
        let (vocab_size, hidden_size) = (first.out.out_features(), first.out.in_features());
        for head in &heads {
            let square = head
                .blocks
                .iter()
                .all(|b| b.weight.out_features() == hidden_size && b.weight.in_features() == hidden_size);
            if !square || head.out.out_features() != vocab_size || head.out.in_features() != hidden_size {
                return Err(Error::Assembly(format!(
                    "speculator {} heads disagree on hidden size {hidden_size} / vocab {vocab_size}",
                    config.model_id
                )));
            }
        }

        info!(
            speculator = %config.model_id,
            heads = heads.len(),
            layers = config.num_layers,
            vocab_size,
            "Loaded speculator"
        );
        Ok(Self {
            heads,
            hidden_size,
            vocab_size,
        })
    }

    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Score `rows` hidden states; returns `(rows, num_heads * vocab)`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if `hidden` is not `rows x hidden_size`.
    pub fn forward(&self, hidden: &[f32], rows: usize) -> Result<Tensor> {
        let width = self.heads.len() * self.vocab_size;
        let mut out = vec![0.0f32; rows * width];
        for (h, head) in self.heads.iter().enumerate() {
            let mut x = hidden.to_vec();
            for block in &head.blocks {
                let mut y = ops::linear(&x, rows, &block.weight, Some(&block.bias))?;
                Activation::Silu.apply(&mut y);
                ops::add_inplace(&mut x, &y);
            }
            let logits = ops::linear(&x, rows, &head.out, None)?;
            for r in 0..rows {
                let dst = r * width + h * self.vocab_size;
                out[dst..dst + self.vocab_size]
                    .copy_from_slice(&logits[r * self.vocab_size..(r + 1) * self.vocab_size]);
            }
        }
        Ok(Tensor::from_f32(&[rows, width], &out))
    }
}
