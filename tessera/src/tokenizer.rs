//! Tokenizer padding and truncation policy
//!
//! Batches are padded and truncated on the left so the newest position of
//! every sequence sits in the last column; decoding then appends one column
//! per step for the whole batch.

use std::path::Path;

use tokenizers::{
    PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationDirection,
    TruncationParams,
};

use crate::tensor::Tensor;
use crate::{Error, Result};

/// Left-padded model inputs for a batch of prompts.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, seq)` token ids
    pub input_ids: Tensor,
    /// `(batch, seq)` 1 for real tokens, 0 for padding
    pub attention_mask: Tensor,
    /// `(batch, seq)` absolute positions; padding positions are 1
    pub position_ids: Tensor,
}

impl Batch {
    /// Build model inputs from left-padded rows of equal length.
    ///
    /// # Panics
    /// Panics if rows differ in length.
    #[must_use]
    pub fn from_rows(ids: &[Vec<u32>], masks: &[Vec<u32>]) -> Self {
        let batch = ids.len();
        let seq = ids.first().map_or(0, Vec::len);
        let mut positions = Vec::with_capacity(batch * seq);
        for mask in masks {
            assert_eq!(mask.len(), seq, "rows must be padded to equal length");
            let mut seen = 0u32;
            for &m in mask {
                seen += m;
                positions.push(if m == 0 { 1 } else { seen - 1 });
            }
        }
        Self {
            input_ids: Tensor::from_u32(&[batch, seq], &ids.concat()),
            attention_mask: Tensor::from_u32(&[batch, seq], &masks.concat()),
            position_ids: Tensor::from_u32(&[batch, seq], &positions),
        }
    }
}

/// Tokenizer configured for left padding and left truncation.
pub struct TokenizerPolicy {
    tokenizer: Tokenizer,
    pad_token_id: u32,
}

impl TokenizerPolicy {
    /// Load `tokenizer.json` from a model directory.
    ///
    /// `pad_token_id` comes from the model configuration; some checkpoints
    /// only declare it there. Without one, the tokenizer's own pad token (or
    /// id 0) is used.
    ///
    /// # Errors
    /// Returns an error if the tokenizer cannot be loaded.
    pub fn from_pretrained(
        model_path: impl AsRef<Path>,
        pad_token_id: Option<u32>,
        max_length: Option<usize>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let tokenizer_path = model_path.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(Error::Tokenizer(format!(
                "No tokenizer.json found in {}",
                model_path.display()
            )));
        }
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Self::new(tokenizer, pad_token_id, max_length)
    }

    /// Apply the padding/truncation policy to an existing tokenizer.
    ///
    /// # Errors
    /// Returns an error if the truncation parameters are rejected.
    pub fn new(
        mut tokenizer: Tokenizer,
        pad_token_id: Option<u32>,
        max_length: Option<usize>,
    ) -> Result<Self> {
        let pad_token_id = pad_token_id
            .or_else(|| tokenizer.get_padding().map(|p| p.pad_id))
            .unwrap_or(0);
        let pad_token = tokenizer
            .id_to_token(pad_token_id)
            .unwrap_or_else(|| "<pad>".to_string());

        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Left,
            pad_id: pad_token_id,
            pad_token,
            ..PaddingParams::default()
        }));
        if let Some(max_length) = max_length {
            tokenizer
                .with_truncation(Some(TruncationParams {
                    direction: TruncationDirection::Left,
                    max_length,
                    ..TruncationParams::default()
                }))
                .map_err(|e| Error::Tokenizer(e.to_string()))?;
        }

        Ok(Self {
            tokenizer,
            pad_token_id,
        })
    }

    #[must_use]
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    #[must_use]
    pub fn padding_direction(&self) -> Option<PaddingDirection> {
        self.tokenizer.get_padding().map(|p| p.direction)
    }

    #[must_use]
    pub fn truncation_direction(&self) -> Option<TruncationDirection> {
        self.tokenizer.get_truncation().map(|t| t.direction)
    }

    #[must_use]
    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Encode prompts into a left-padded batch.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn encode_batch(&self, texts: &[&str]) -> Result<Batch> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        let ids: Vec<Vec<u32>> = encodings.iter().map(|e| e.get_ids().to_vec()).collect();
        let masks: Vec<Vec<u32>> = encodings
            .iter()
            .map(|e| e.get_attention_mask().to_vec())
            .collect();
        Ok(Batch::from_rows(&ids, &masks))
    }

    /// Decode token IDs to text
    ///
    /// # Errors
    /// Returns an error if decoding fails
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }
}
