//! Model parallelism.
//!
//! This module contains:
//! - ProcessGroup, the collective operations layers rely on
//! - LocalProcessGroup, an in-process implementation staging through host memory
//! - ParallelArgs, the per-worker context threaded from the engine down to layers

pub mod process_group;

use std::sync::Arc;

use candle_core::{Device, Tensor};

pub use process_group::{LocalProcessGroup, ProcessGroup};

use crate::error::Result;

/// Create one connected process group per device.
///
/// Rank `i` is bound to `devices[i]`.
pub fn create_process_groups(devices: &[Device]) -> Vec<Arc<dyn ProcessGroup>> {
    LocalProcessGroup::new_group(devices)
        .into_iter()
        .map(|group| Arc::new(group) as Arc<dyn ProcessGroup>)
        .collect()
}

/// Where a worker sits in its model-parallel group.
///
/// Fixed for the lifetime of the engine. `process_group` is `None` when the
/// model runs on a single device.
#[derive(Debug, Clone)]
pub struct ParallelArgs {
    /// Rank of this worker.
    pub rank: usize,
    /// Number of workers sharing the model.
    pub world_size: usize,
    /// Collectives for this rank.
    pub process_group: Option<Arc<dyn ProcessGroup>>,
}

impl ParallelArgs {
    /// Create parallel args for one rank of a group.
    pub fn new(rank: usize, world_size: usize, process_group: Option<Arc<dyn ProcessGroup>>) -> Self {
        Self {
            rank,
            world_size,
            process_group,
        }
    }

    /// Parallel args for a model that is not split.
    pub fn single() -> Self {
        Self::new(0, 1, None)
    }

    /// Sum `tensor` across ranks. Identity when not split.
    pub fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        match &self.process_group {
            Some(group) if self.world_size > 1 => group.all_reduce(tensor),
            _ => Ok(tensor.clone()),
        }
    }

    /// Gather every rank's `tensor` and concatenate along `dim`, in rank order.
    pub fn all_gather_cat(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        match &self.process_group {
            Some(group) if self.world_size > 1 => {
                let parts = group.all_gather(tensor)?;
                Ok(Tensor::cat(&parts, dim)?)
            }
            _ => Ok(tensor.clone()),
        }
    }

    /// `root`'s `tensor` on every rank. Identity when not split.
    pub fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        match &self.process_group {
            Some(group) if self.world_size > 1 => group.broadcast(tensor, root),
            _ => Ok(tensor.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_is_identity() {
        let args = ParallelArgs::single();
        let t = Tensor::new(&[[1f32, 2.0]], &Device::Cpu).unwrap();
        assert_eq!(
            args.all_gather_cat(&t, 1).unwrap().dims(),
            t.dims()
        );
        assert_eq!(args.all_reduce(&t).unwrap().to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn test_create_process_groups_ranks() {
        let groups = create_process_groups(&[Device::Cpu, Device::Cpu]);
        assert_eq!(groups.len(), 2);
        for (rank, group) in groups.iter().enumerate() {
            assert_eq!(group.rank(), rank);
            assert_eq!(group.world_size(), 2);
        }
    }
}
