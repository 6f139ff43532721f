//! How each OPT parameter is split across a tensor-parallel group
//!
//! Attention heads and feed-forward columns are partitioned; the projections
//! that merge them back (`out_proj`, `fc2`) are row-parallel and followed by
//! an all-reduce. The token embedding is split by vocabulary row and doubles
//! as the output head. Everything else is replicated.

use tessera::{Result, ShardConfig, ShardStrategy};

use crate::config::OptConfig;

/// Parameter kinds inside an OPT decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptParam {
    TokenEmbedding,
    PositionEmbedding,
    LayerNorm,
    /// `project_in` / `project_out`
    Projection,
    /// `q_proj`, `k_proj`, `v_proj`
    AttentionInput,
    OutProj,
    Fc1,
    Fc2,
}

impl OptParam {
    #[must_use]
    pub fn strategy(self) -> ShardStrategy {
        match self {
            Self::TokenEmbedding | Self::AttentionInput | Self::Fc1 => ShardStrategy::Column,
            Self::OutProj | Self::Fc2 => ShardStrategy::Row,
            Self::PositionEmbedding | Self::LayerNorm | Self::Projection => {
                ShardStrategy::Replicate
            }
        }
    }

    /// Biases of column-parallel layers follow their weights; biases of
    /// row-parallel layers are replicated and added once after the reduce.
    #[must_use]
    pub fn bias_strategy(self) -> ShardStrategy {
        match self.strategy() {
            ShardStrategy::Column => ShardStrategy::Column,
            ShardStrategy::Row | ShardStrategy::Replicate => ShardStrategy::Replicate,
        }
    }
}

/// Per-rank sizes of the partitioned dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSizes {
    pub heads: usize,
    pub ffn_dim: usize,
    pub vocab: usize,
    /// First vocabulary id held by this rank
    pub vocab_start: usize,
}

impl LocalSizes {
    /// # Errors
    /// Returns [`Error::ShardAlignment`] if heads, feed-forward width or
    /// vocabulary do not divide by the world size.
    pub fn new(config: &OptConfig, shard: ShardConfig) -> Result<Self> {
        let (_, heads) =
            shard.shard_range("num_attention_heads", 0, config.num_attention_heads)?;
        let (_, ffn_dim) = shard.shard_range("ffn_dim", 0, config.ffn_dim)?;
        let (vocab_start, vocab) = shard.shard_range("vocab_size", 0, config.vocab_size)?;
        Ok(Self {
            heads,
            ffn_dim,
            vocab,
            vocab_start,
        })
    }
}
