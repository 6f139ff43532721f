//! Tensor parallelism configuration types
//!
//! Describes how a model is sharded across the ranks of a process group.
//! Which parameters are split, and along which dimension, is decided by each
//! architecture crate; this module only provides the vocabulary and the
//! slice arithmetic.

use crate::{Error, Result};

/// Describes this rank's position in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// This process's rank (`0..world_size`)
    pub rank: usize,
    /// Total number of processes in the tensor-parallel group
    pub world_size: usize,
}

impl ShardConfig {
    /// Single-rank configuration.
    pub const SINGLE: Self = Self {
        rank: 0,
        world_size: 1,
    };

    /// Compute the shard range for a dimension of size `size`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`. `name` and `dim` only label the error.
    ///
    /// # Errors
    /// Returns [`Error::ShardAlignment`] if `size` is not evenly divisible by
    /// `world_size`.
    pub fn shard_range(&self, name: &str, dim: usize, size: usize) -> Result<(usize, usize)> {
        if size % self.world_size != 0 {
            return Err(Error::ShardAlignment {
                name: name.to_string(),
                dim,
                size,
                world_size: self.world_size,
            });
        }
        let shard_size = size / self.world_size;
        Ok((self.rank * shard_size, shard_size))
    }

    /// Whether more than one rank participates.
    #[must_use]
    pub fn is_sharded(&self) -> bool {
        self.world_size > 1
    }
}

/// How a specific weight tensor should be sliced during loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// Replicate the full tensor on every rank (norms, positional tables).
    Replicate,
    /// Column-parallel: split along the output dimension (rows of the
    /// `(out, in)` weight matrix, or the vocabulary of an embedding).
    /// Each rank gets rows `[rank*N/tp .. (rank+1)*N/tp]`.
    Column,
    /// Row-parallel: split along the input dimension (columns of the weight
    /// matrix). Requires an all-reduce after the matmul.
    Row,
}

impl ShardStrategy {
    /// Dimension of an `(out, in)` weight split by this strategy.
    #[must_use]
    pub fn dim(self) -> Option<usize> {
        match self {
            Self::Replicate => None,
            Self::Column => Some(0),
            Self::Row => Some(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_range() {
        let shard = ShardConfig {
            rank: 0,
            world_size: 4,
        };
        assert_eq!(shard.shard_range("w", 0, 128).unwrap(), (0, 32));

        let shard = ShardConfig {
            rank: 3,
            world_size: 4,
        };
        assert_eq!(shard.shard_range("w", 0, 128).unwrap(), (96, 32));
    }

    #[test]
    fn test_shard_range_indivisible() {
        let shard = ShardConfig {
            rank: 0,
            world_size: 3,
        };
        let err = shard.shard_range("hidden", 1, 100).unwrap_err();
        assert!(matches!(
            err,
            Error::ShardAlignment {
                dim: 1,
                size: 100,
                world_size: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_single_never_fails() {
        assert_eq!(ShardConfig::SINGLE.shard_range("w", 0, 7).unwrap(), (0, 7));
        assert!(!ShardConfig::SINGLE.is_sharded());
    }

    #[test]
    fn test_strategy_dim() {
        assert_eq!(ShardStrategy::Replicate.dim(), None);
        assert_eq!(ShardStrategy::Column.dim(), Some(0));
        assert_eq!(ShardStrategy::Row.dim(), Some(1));
    }
}
