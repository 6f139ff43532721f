//! In-process group: one handle per thread, sharing memory.

use std::sync::{Arc, Barrier, Mutex};

use super::{concat_in_rank_order, reduce_in_rank_order, Communicator, ProcessGroup};
use crate::{Error, Result};

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

struct LocalCommunicator {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalCommunicator {
    /// Publish `local`, then read every rank's contribution.
    ///
    /// The second barrier keeps a fast rank from overwriting its slot before
    /// slower ranks have read it.
    fn exchange(&self, local: &[f32]) -> Result<Vec<Vec<f32>>> {
        self.lock()?[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        let parts = self.lock()?.clone();
        self.shared.barrier.wait();
        Ok(parts)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<f32>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| Error::Communication("a peer thread panicked mid-collective".into()))
    }
}

impl Communicator for LocalCommunicator {
    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        let parts = self.exchange(buf)?;
        reduce_in_rank_order(&parts, buf)
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        let parts = self.exchange(local)?;
        concat_in_rank_order(&parts, local.len())
    }
}

impl ProcessGroup {
    /// Build an in-process group of `world_size` ranks.
    ///
    /// Returns one handle per rank, in rank order. Each handle is meant to be
    /// moved to its own thread.
    ///
    /// # Panics
    /// Panics if `world_size` is zero.
    #[must_use]
    pub fn local(world_size: usize) -> Vec<Self> {
        assert!(world_size > 0, "world_size must be at least 1");
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        (0..world_size)
            .map(|rank| {
                Self::from_communicator(
                    rank,
                    world_size,
                    Arc::new(LocalCommunicator {
                        rank,
                        shared: Arc::clone(&shared),
                    }),
                )
            })
            .collect()
    }
}
