use std::path::PathBuf;

use candle_core::Device;
use chrono::Local;

use crate::{config::DatasetTag, TrainingConfig, TrainingError};

pub const TASK_NAME: &str = "role_prediction";
const RUN_ID_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Identity of one orchestrator invocation.
///
/// The run id is fixed at construction and names both the checkpoint and
/// the log directory of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    run_id: String,
    dataset_tag: DatasetTag,
    checkpoint_root: PathBuf,
    log_root: PathBuf,
}

impl RunContext {
    pub fn new(config: &TrainingConfig) -> Self {
        Self::with_run_id(config, Local::now().format(RUN_ID_FORMAT).to_string())
    }

    pub fn with_run_id(config: &TrainingConfig, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            dataset_tag: config.dataset_tag,
            checkpoint_root: config.checkpoint_root.clone(),
            log_root: config.log_root.clone(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dataset_tag(&self) -> DatasetTag {
        self.dataset_tag
    }

    /// `<checkpoint_root>/<dataset_tag>/role_prediction/<run_id>`
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_root
            .join(self.dataset_tag.as_str())
            .join(TASK_NAME)
            .join(&self.run_id)
    }

    /// `<log_root>/<dataset_tag>/role_prediction/<run_id>`
    pub fn log_dir(&self) -> PathBuf {
        self.log_root
            .join(self.dataset_tag.as_str())
            .join(TASK_NAME)
            .join(&self.run_id)
    }
}

/// Picks the compute device for this rank.
///
/// Distributed ranks bind to CUDA device `local_rank`. Otherwise Metal, then
/// CUDA, then CPU; `CANDLE_FORCE_CPU` skips the accelerators.
pub fn select_device(local_rank: i64) -> Result<Device, TrainingError> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }

    if local_rank >= 0 {
        let ordinal = local_rank as usize;
        return match Device::cuda_if_available(ordinal) {
            Ok(device) if device.is_cuda() => {
                log::info!("rank {local_rank} bound to CUDA device {ordinal}");
                Ok(device)
            }
            Ok(_) | Err(_) => {
                log::warn!("rank {local_rank}: CUDA device {ordinal} unavailable, using CPU");
                Ok(Device::Cpu)
            }
        };
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("Metal device selected");
                return Ok(device);
            }
            Err(err) => log::info!("Metal unavailable ({err}), falling back"),
        }
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected");
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Seeds the device generator. Data order is seeded separately by the loaders.
pub fn seed_everything(device: &Device, seed: u64) {
    if let Err(err) = device.set_seed(seed) {
        log::warn!("device does not support seeding ({err}); dropout masks are unseeded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn directories_share_the_run_id() {
        let mut config = TrainingConfig::new(DatasetTag::Conll2009, "train.json");
        config.checkpoint_root = "/ckpt".into();
        config.log_root = "/logs".into();
        let run = RunContext::with_run_id(&config, "2024_01_02_03_04_05");

        assert_eq!(
            run.checkpoint_dir(),
            Path::new("/ckpt/conll2009/role_prediction/2024_01_02_03_04_05")
        );
        assert_eq!(
            run.log_dir(),
            Path::new("/logs/conll2009/role_prediction/2024_01_02_03_04_05")
        );
    }

    #[test]
    fn generated_run_id_is_a_timestamp() {
        let config = TrainingConfig::new(DatasetTag::Conll2012, "train.json");
        let run = RunContext::new(&config);
        let parts: Vec<&str> = run.run_id().split('_').collect();
        assert_eq!(parts.len(), 6);
        assert!(parts.iter().all(|part| part.chars().all(|c| c.is_ascii_digit())));
    }
}
