//! Process groups for data-parallel runs.
//!
//! Ranks only meet in `all_reduce_average`, which every rank must call the
//! same number of times with identically shaped parameters.

mod local;
mod tcp;

pub use local::LocalProcessGroup;
pub use tcp::TcpProcessGroup;

use candle_core::{DType, Tensor, Var};

use crate::{TrainingConfig, TrainingError};

pub trait DistributedCoordinator: Send {
    /// `-1` outside a process group.
    fn rank(&self) -> i64;

    fn world_size(&self) -> usize;

    /// Element-wise sum of `buffer` across all ranks. Collective.
    fn all_reduce_sum(&self, buffer: Vec<f32>) -> Result<Vec<f32>, TrainingError>;

    fn is_distributed(&self) -> bool {
        self.rank() >= 0
    }

    /// Rank 0, or the only process.
    fn is_primary(&self) -> bool {
        self.rank() < 1
    }

    /// Replaces every parameter with its mean across the group. Collective.
    fn all_reduce_average(&self, params: &[Var]) -> Result<(), TrainingError> {
        if !self.is_distributed() {
            return Ok(());
        }

        let mut flat = Vec::new();
        for var in params {
            let values = var
                .as_tensor()
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(to_runtime_error)?;
            flat.extend(values);
        }

        let expected = flat.len();
        let summed = self.all_reduce_sum(flat)?;
        if summed.len() != expected {
            return Err(TrainingError::distributed(format!(
                "all-reduce returned {} values, expected {}",
                summed.len(),
                expected
            )));
        }

        let inv_world = 1.0 / self.world_size() as f32;
        let mut offset = 0;
        for var in params {
            let tensor = var.as_tensor();
            let count = tensor.elem_count();
            let averaged: Vec<f32> = summed[offset..offset + count]
                .iter()
                .map(|value| value * inv_world)
                .collect();
            offset += count;
            let next = Tensor::from_vec(averaged, tensor.dims(), tensor.device())
                .and_then(|t| t.to_dtype(tensor.dtype()))
                .map_err(to_runtime_error)?;
            var.set(&next).map_err(to_runtime_error)?;
        }

        Ok(())
    }
}

/// Coordinator for a run that is not part of a process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl DistributedCoordinator for SingleProcess {
    fn rank(&self) -> i64 {
        -1
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, buffer: Vec<f32>) -> Result<Vec<f32>, TrainingError> {
        Ok(buffer)
    }
}

/// `SingleProcess` when `local_rank == -1`, otherwise joins the TCP group
/// described by `MASTER_ADDR`, `MASTER_PORT` and `WORLD_SIZE`.
pub fn init_process_group(
    config: &TrainingConfig,
) -> Result<Box<dyn DistributedCoordinator>, TrainingError> {
    if !config.is_distributed() {
        return Ok(Box::new(SingleProcess));
    }
    let rank = usize::try_from(config.local_rank).map_err(|_| {
        TrainingError::distributed(format!("invalid local_rank {}", config.local_rank))
    })?;
    let group = TcpProcessGroup::from_env(rank)?;
    log::info!(
        "joined process group as rank {} of {}",
        group.rank(),
        group.world_size()
    );
    Ok(Box::new(group))
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn single_process_averaging_is_a_no_op() {
        let var = Var::from_slice(&[1f32, 2.0], (2,), &Device::Cpu).unwrap();
        let coordinator = SingleProcess;
        assert!(!coordinator.is_distributed());
        assert!(coordinator.is_primary());
        coordinator.all_reduce_average(&[var.clone()]).unwrap();
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
    }
}
