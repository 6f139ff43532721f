//! Process groups for tensor-parallel execution
//!
//! A [`ProcessGroup`] is an explicitly passed handle: every component that
//! needs cross-rank coordination takes one as an argument. Three transports
//! back it:
//!
//! - a single-rank group whose collectives are no-ops,
//! - an in-process group with one handle per thread ([`ProcessGroup::local`]),
//! - a TCP star group for one process per rank ([`initialize`]).
//!
//! All transports reduce contributions in rank order, so every rank observes
//! bit-identical results.

mod env;
mod local;
mod tcp;

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::shard::ShardConfig;
use crate::{Error, Result};

pub use env::TopologyEnv;

/// Collective operations shared by all ranks of a group.
///
/// Every rank must issue the same sequence of calls with buffers of the same
/// length; a rank that never arrives blocks the others indefinitely.
pub trait Communicator: Send + Sync {
    /// Block until every rank has reached the barrier.
    ///
    /// # Errors
    /// Returns an error if the transport fails.
    fn barrier(&self) -> Result<()>;

    /// Sum `buf` element-wise across ranks, in place.
    ///
    /// # Errors
    /// Returns an error if the transport fails or lengths disagree.
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;

    /// Concatenate every rank's `local` buffer in rank order.
    ///
    /// # Errors
    /// Returns an error if the transport fails or lengths disagree.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>>;
}

/// Handle to the group of processes that jointly hold one model.
#[derive(Clone)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    comm: Arc<dyn Communicator>,
}

impl ProcessGroup {
    /// A group containing only this process.
    #[must_use]
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            comm: Arc::new(SingleRank),
        }
    }

    /// Wrap an externally provided communicator.
    ///
    /// # Panics
    /// Panics if `rank >= world_size`.
    #[must_use]
    pub fn from_communicator(
        rank: usize,
        world_size: usize,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        assert!(
            rank < world_size,
            "rank {rank} out of range for world_size {world_size}"
        );
        Self {
            rank,
            world_size,
            comm,
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank 0 is responsible for user-facing output.
    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    #[must_use]
    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            rank: self.rank,
            world_size: self.world_size,
        }
    }

    /// # Errors
    /// Returns an error if the transport fails.
    pub fn barrier(&self) -> Result<()> {
        self.comm.barrier()
    }

    /// # Errors
    /// Returns an error if the transport fails or lengths disagree.
    pub fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        self.comm.all_reduce_sum(buf)
    }

    /// # Errors
    /// Returns an error if the transport fails or lengths disagree.
    pub fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        if self.world_size == 1 {
            return Ok(local.to_vec());
        }
        self.comm.all_gather(local)
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

/// Join the process group described by the environment.
///
/// Must be called once per process. Does not return until every rank has
/// joined.
///
/// # Errors
/// Returns [`Error::Topology`] if the environment is inconsistent or the
/// join fails.
pub fn initialize() -> Result<ProcessGroup> {
    let env = TopologyEnv::from_env()?;
    initialize_with(&env)
}

/// Join the process group described by `env`.
///
/// # Errors
/// Returns [`Error::Topology`] if the join fails.
pub fn initialize_with(env: &TopologyEnv) -> Result<ProcessGroup> {
    let group = if env.world_size == 1 {
        ProcessGroup::single()
    } else {
        tcp::join(env)?
    };
    info!(
        rank = group.rank(),
        world_size = group.world_size(),
        "Process group ready"
    );
    Ok(group)
}

struct SingleRank;

impl Communicator for SingleRank {
    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_reduce_sum(&self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        Ok(local.to_vec())
    }
}

/// Sum per-rank contributions into `out`, starting from rank 0.
fn reduce_in_rank_order(parts: &[Vec<f32>], out: &mut [f32]) -> Result<()> {
    check_lengths(parts, out.len())?;
    out.fill(0.0);
    for part in parts {
        for (o, v) in out.iter_mut().zip(part) {
            *o += v;
        }
    }
    Ok(())
}

fn concat_in_rank_order(parts: &[Vec<f32>], local_len: usize) -> Result<Vec<f32>> {
    check_lengths(parts, local_len)?;
    Ok(parts.concat())
}

fn check_lengths(parts: &[Vec<f32>], expected: usize) -> Result<()> {
    if let Some((rank, part)) = parts.iter().enumerate().find(|(_, p)| p.len() != expected) {
        return Err(Error::Communication(format!(
            "rank {rank} contributed {} elements, expected {expected}",
            part.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_rank_collectives_are_identity() {
        let group = ProcessGroup::single();
        assert_eq!(group.rank(), 0);
        assert_eq!(group.world_size(), 1);
        assert!(group.is_coordinator());

        let mut buf = vec![1.0, 2.0];
        group.all_reduce_sum(&mut buf).unwrap();
        assert_eq!(buf, vec![1.0, 2.0]);
        assert_eq!(group.all_gather(&buf).unwrap(), vec![1.0, 2.0]);
        group.barrier().unwrap();
    }

    #[test]
    fn test_reduce_in_rank_order() {
        let parts = vec![vec![1.0, 2.0], vec![10.0, 20.0], vec![100.0, 200.0]];
        let mut out = vec![0.0; 2];
        reduce_in_rank_order(&parts, &mut out).unwrap();
        assert_eq!(out, vec![111.0, 222.0]);
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let parts = vec![vec![1.0, 2.0], vec![1.0]];
        let err = concat_in_rank_order(&parts, 2).unwrap_err();
        assert!(err.to_string().contains("rank 1"));
    }

    #[test]
    fn test_initialize_single_rank() {
        let env = TopologyEnv::single();
        let group = initialize_with(&env).unwrap();
        assert_eq!(group.world_size(), 1);
    }
}
