use std::sync::{Arc, Condvar, Mutex};

use crate::TrainingError;

use super::DistributedCoordinator;

/// In-process group whose ranks are threads sharing one rendezvous.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Rendezvous>,
}

#[derive(Debug)]
struct Rendezvous {
    round: Mutex<Round>,
    completed: Condvar,
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    sum: Vec<f32>,
    mismatch: bool,
    result: Option<Arc<Result<Vec<f32>, String>>>,
}

impl LocalProcessGroup {
    /// One handle per rank, in rank order.
    pub fn new(world_size: usize) -> Result<Vec<Self>, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::distributed(
                "process group needs at least one rank",
            ));
        }
        let shared = Arc::new(Rendezvous {
            round: Mutex::new(Round::default()),
            completed: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

impl DistributedCoordinator for LocalProcessGroup {
    fn rank(&self) -> i64 {
        self.rank as i64
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buffer: Vec<f32>) -> Result<Vec<f32>, TrainingError> {
        let poisoned = || TrainingError::distributed("process group rendezvous is poisoned");
        let mut round = self.shared.round.lock().map_err(|_| poisoned())?;

        let generation = round.generation;
        if round.arrived == 0 {
            round.sum = buffer;
            round.mismatch = false;
        } else if round.sum.len() != buffer.len() {
            round.mismatch = true;
        } else {
            for (acc, value) in round.sum.iter_mut().zip(buffer) {
                *acc += value;
            }
        }
        round.arrived += 1;

        let result = if round.arrived == self.world_size {
            let outcome = if round.mismatch {
                Err("ranks contributed buffers of different lengths".to_string())
            } else {
                Ok(std::mem::take(&mut round.sum))
            };
            let outcome = Arc::new(outcome);
            round.result = Some(Arc::clone(&outcome));
            round.arrived = 0;
            round.generation = round.generation.wrapping_add(1);
            self.shared.completed.notify_all();
            outcome
        } else {
            while round.generation == generation {
                round = self.shared.completed.wait(round).map_err(|_| poisoned())?;
            }
            // the next round cannot complete before this rank joins it
            round
                .result
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| TrainingError::distributed("all-reduce finished without a result"))?
        };

        match result.as_ref() {
            Ok(values) => Ok(values.clone()),
            Err(message) => Err(TrainingError::distributed(message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use std::thread;

    #[test]
    fn replicated_values_stay_put_across_four_ranks() {
        let group = LocalProcessGroup::new(4).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|coordinator| {
                thread::spawn(move || {
                    let var = Var::from_slice(&[8f32, 8.0], (2,), &Device::Cpu).unwrap();
                    coordinator.all_reduce_average(&[var.clone()]).unwrap();
                    // a second round is idempotent on replicated values
                    coordinator.all_reduce_average(&[var.clone()]).unwrap();
                    var.as_tensor().to_vec1::<f32>().unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![8.0, 8.0]);
        }
    }

    #[test]
    fn ranks_converge_to_the_mean() {
        let group = LocalProcessGroup::new(3).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|coordinator| {
                thread::spawn(move || {
                    let value = coordinator.rank() as f32 * 3.0;
                    let var = Var::from_slice(&[value], (1,), &Device::Cpu).unwrap();
                    coordinator.all_reduce_average(&[var.clone()]).unwrap();
                    var.as_tensor().to_vec1::<f32>().unwrap()[0]
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 3.0);
        }
    }

    #[test]
    fn mismatched_buffers_fail_on_every_rank() {
        let group = LocalProcessGroup::new(2).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|coordinator| {
                thread::spawn(move || {
                    let buffer = vec![1.0; coordinator.rank() as usize + 1];
                    coordinator.all_reduce_sum(buffer).is_err()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
