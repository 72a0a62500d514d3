use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use tempfile::NamedTempFile;

use crate::{
    model::RoleModel,
    optimizer::{
        GradientScaler, GradientScalerState, OptimizerSnapshot, OptimizerState, ParameterMoments,
        TrainerOptimizer,
    },
    run::RunContext,
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const ARGS_FILENAME: &str = "args";
const CHECKPOINT_EXTENSION: &str = "cpt";

const META_VERSION: &str = "format_version";
const META_EPOCH: &str = "epoch";
const META_CONFIG: &str = "config_sha256";
const META_OPTIMIZER: &str = "optimizer";
const META_SCHEDULER: &str = "scheduler";
const META_SCALER: &str = "scaler";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const EXP_AVG_SUFFIX: &str = ".exp_avg";
const EXP_AVG_SQ_SUFFIX: &str = ".exp_avg_sq";

/// Everything needed to resume training after an epoch.
#[derive(Debug, Clone)]
pub struct CheckpointPayload {
    pub epoch: usize,
    pub config_sha256: String,
    pub model: Vec<(String, Tensor)>,
    pub optimizer: OptimizerSnapshot,
    pub scheduler: Option<SchedulerState>,
    pub scaler: Option<GradientScalerState>,
}

impl CheckpointPayload {
    pub fn capture<M: RoleModel + ?Sized>(
        epoch: usize,
        config: &TrainingConfig,
        model: &M,
        optimizer: &TrainerOptimizer,
        scheduler: &dyn LRScheduler,
        scaler: &GradientScaler,
    ) -> Result<Self, TrainingError> {
        let model_tensors: Vec<(String, Tensor)> = model
            .named_parameters()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        if model_tensors.is_empty() {
            return Err(TrainingError::persistence(
                "model contains no parameters to checkpoint",
            ));
        }

        Ok(Self {
            epoch,
            config_sha256: config.fingerprint()?,
            model: model_tensors,
            optimizer: optimizer.snapshot(),
            scheduler: scheduler.state(),
            scaler: scaler.state(),
        })
    }

    /// Copies the saved weights into `model`'s parameters.
    pub fn restore_model<M: RoleModel + ?Sized>(&self, model: &M) -> Result<(), TrainingError> {
        let mut saved: HashMap<&str, &Tensor> = self
            .model
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect();

        for (name, var) in model.named_parameters() {
            let tensor = saved.remove(name.as_str()).ok_or_else(|| {
                TrainingError::persistence(format!("checkpoint missing parameter {name}"))
            })?;
            let target = var.as_tensor();
            if tensor.dims() != target.dims() {
                return Err(TrainingError::persistence(format!(
                    "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                    tensor.dims(),
                    target.dims()
                )));
            }
            let tensor = tensor
                .to_dtype(target.dtype())
                .and_then(|t| t.to_device(target.device()))
                .map_err(to_persistence_error)?;
            var.set(&tensor).map_err(to_persistence_error)?;
        }

        if !saved.is_empty() {
            let mut extra: Vec<&str> = saved.into_keys().collect();
            extra.sort_unstable();
            return Err(TrainingError::persistence(format!(
                "checkpoint contains unused parameters: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }

    /// Restores model, optimizer, scheduler and scaler state.
    pub fn restore<M: RoleModel + ?Sized>(
        self,
        model: &M,
        optimizer: &mut TrainerOptimizer,
        scheduler: &mut dyn LRScheduler,
        scaler: &mut GradientScaler,
    ) -> Result<(), TrainingError> {
        self.restore_model(model)?;
        optimizer.load_snapshot(self.optimizer)?;
        if let Some(state) = &self.scheduler {
            scheduler.load_state(state)?;
            optimizer.set_learning_rate(scheduler.learning_rate());
        }
        if let Some(state) = &self.scaler {
            scaler.load_state(state)?;
        }
        Ok(())
    }
}

/// Writes one immutable checkpoint file per epoch under the run directory.
#[derive(Debug)]
pub struct CheckpointStore {
    directory: PathBuf,
    args: TrainingConfig,
    initialized: bool,
}

impl CheckpointStore {
    pub fn new(run: &RunContext, config: &TrainingConfig) -> Self {
        Self {
            directory: run.checkpoint_dir(),
            args: config.clone(),
            initialized: false,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.directory
            .join(format!("checkpoint_{epoch}.{CHECKPOINT_EXTENSION}"))
    }

    /// Persists `payload` as `checkpoint_<epoch>.cpt`. Refuses to replace an
    /// existing file. The first save of a run also writes the `args` file.
    pub fn save(&mut self, payload: &CheckpointPayload) -> Result<PathBuf, TrainingError> {
        if !self.initialized {
            fs::create_dir_all(&self.directory).map_err(|err| {
                TrainingError::persistence(format!(
                    "failed to create checkpoint directory {}: {err}",
                    self.directory.display()
                ))
            })?;
            let args_path = self.directory.join(ARGS_FILENAME);
            if !args_path.exists() {
                let args = serde_json::to_vec_pretty(&self.args).map_err(|err| {
                    TrainingError::persistence(format!("failed to serialize args: {err}"))
                })?;
                write_new_file(&self.directory, &args_path, &args)?;
            }
            self.initialized = true;
        }

        let path = self.checkpoint_path(payload.epoch);
        if path.exists() {
            return Err(TrainingError::persistence(format!(
                "checkpoint {} already exists",
                path.display()
            )));
        }

        let bytes = encode(payload)?;
        write_new_file(&self.directory, &path, &bytes)?;
        log::info!("saved checkpoint for epoch {} to {}", payload.epoch, path.display());
        Ok(path)
    }

    /// Reads a checkpoint file back, with tensors on `device`.
    pub fn load(path: &Path, device: &Device) -> Result<CheckpointPayload, TrainingError> {
        let bytes = fs::read(path).map_err(|err| {
            TrainingError::persistence(format!("failed to read {}: {err}", path.display()))
        })?;
        decode(&bytes, device).map_err(|err| match err {
            TrainingError::Persistence(message) => {
                TrainingError::persistence(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }
}

fn encode(payload: &CheckpointPayload) -> Result<Vec<u8>, TrainingError> {
    let mut tensors: Vec<(String, Tensor)> =
        Vec::with_capacity(payload.model.len() + 2 * payload.optimizer.moments.len());
    for (name, tensor) in &payload.model {
        tensors.push((format!("{MODEL_PREFIX}{name}"), tensor.clone()));
    }
    for moments in &payload.optimizer.moments {
        tensors.push((
            format!("{OPTIMIZER_PREFIX}{}{EXP_AVG_SUFFIX}", moments.name),
            moments.exp_avg.clone(),
        ));
        tensors.push((
            format!("{OPTIMIZER_PREFIX}{}{EXP_AVG_SQ_SUFFIX}", moments.name),
            moments.exp_avg_sq.clone(),
        ));
    }

    let mut metadata = HashMap::new();
    metadata.insert(META_VERSION.to_string(), CHECKPOINT_VERSION.to_string());
    metadata.insert(META_EPOCH.to_string(), payload.epoch.to_string());
    metadata.insert(META_CONFIG.to_string(), payload.config_sha256.clone());
    metadata.insert(
        META_OPTIMIZER.to_string(),
        to_json(&payload.optimizer.state)?,
    );
    if let Some(scheduler) = &payload.scheduler {
        metadata.insert(META_SCHEDULER.to_string(), to_json(scheduler)?);
    }
    if let Some(scaler) = &payload.scaler {
        metadata.insert(META_SCALER.to_string(), to_json(scaler)?);
    }

    safetensors::serialize(tensors, &Some(metadata))
        .map_err(|err| TrainingError::persistence(format!("failed to serialize checkpoint: {err}")))
}

fn decode(bytes: &[u8], device: &Device) -> Result<CheckpointPayload, TrainingError> {
    let (_, header) = SafeTensors::read_metadata(bytes)
        .map_err(|err| TrainingError::persistence(format!("invalid checkpoint header: {err}")))?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| TrainingError::persistence("checkpoint has no metadata"))?;
    let field = |key: &str| {
        metadata
            .get(key)
            .ok_or_else(|| TrainingError::persistence(format!("checkpoint metadata missing {key}")))
    };

    let version: u32 = field(META_VERSION)?
        .parse()
        .map_err(|err| TrainingError::persistence(format!("invalid format_version: {err}")))?;
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::persistence(format!(
            "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
        )));
    }
    let epoch: usize = field(META_EPOCH)?
        .parse()
        .map_err(|err| TrainingError::persistence(format!("invalid epoch: {err}")))?;
    let config_sha256 = field(META_CONFIG)?.clone();
    let optimizer_state: OptimizerState = from_json(field(META_OPTIMIZER)?)?;
    let scheduler = metadata
        .get(META_SCHEDULER)
        .map(|value| from_json::<SchedulerState>(value))
        .transpose()?;
    let scaler = metadata
        .get(META_SCALER)
        .map(|value| from_json::<GradientScalerState>(value))
        .transpose()?;

    let mut tensors =
        candle_core::safetensors::load_buffer(bytes, device).map_err(to_persistence_error)?;

    let mut moments = Vec::new();
    for name in optimizer_state
        .groups
        .iter()
        .flat_map(|group| group.params.iter())
    {
        let mut take = |suffix: &str| {
            let key = format!("{OPTIMIZER_PREFIX}{name}{suffix}");
            tensors.remove(&key).ok_or_else(|| {
                TrainingError::persistence(format!("checkpoint missing tensor {key}"))
            })
        };
        let exp_avg = take(EXP_AVG_SUFFIX)?;
        let exp_avg_sq = take(EXP_AVG_SQ_SUFFIX)?;
        moments.push(ParameterMoments {
            name: name.clone(),
            exp_avg,
            exp_avg_sq,
        });
    }

    let mut model = Vec::with_capacity(tensors.len());
    for (key, tensor) in tensors {
        match key.strip_prefix(MODEL_PREFIX) {
            Some(name) => model.push((name.to_string(), tensor)),
            None => {
                return Err(TrainingError::persistence(format!(
                    "unexpected tensor {key} in checkpoint"
                )))
            }
        }
    }
    model.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(CheckpointPayload {
        epoch,
        config_sha256,
        model,
        optimizer: OptimizerSnapshot {
            state: optimizer_state,
            moments,
        },
        scheduler,
        scaler,
    })
}

/// Temp file in the target directory, fsync, then a rename that fails
/// instead of replacing an existing file.
fn write_new_file(directory: &Path, target: &Path, bytes: &[u8]) -> Result<(), TrainingError> {
    let mut file = NamedTempFile::new_in(directory).map_err(|err| {
        TrainingError::persistence(format!(
            "failed to create temporary file in {}: {err}",
            directory.display()
        ))
    })?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|err| {
            TrainingError::persistence(format!(
                "failed to write {}: {err}",
                file.path().display()
            ))
        })?;
    file.persist_noclobber(target).map_err(|err| {
        TrainingError::persistence(format!(
            "failed to move checkpoint into {}: {}",
            target.display(),
            err.error
        ))
    })?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, TrainingError> {
    serde_json::to_string(value)
        .map_err(|err| TrainingError::persistence(format!("failed to serialize state: {err}")))
}

fn from_json<T: for<'de> serde::Deserialize<'de>>(value: &str) -> Result<T, TrainingError> {
    serde_json::from_str(value)
        .map_err(|err| TrainingError::persistence(format!("invalid checkpoint metadata: {err}")))
}

fn to_persistence_error(err: candle_core::Error) -> TrainingError {
    TrainingError::persistence(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DatasetTag, Precision},
        model::{TaggerConfig, TokenRoleTagger},
        optimizer::AdamWConfig,
        scheduler::LinearWarmupDecay,
    };
    use tempfile::tempdir;

    struct Fixture {
        config: TrainingConfig,
        model: TokenRoleTagger,
        optimizer: TrainerOptimizer,
        scheduler: LinearWarmupDecay,
        scaler: GradientScaler,
    }

    fn fixture(root: &Path) -> Fixture {
        let mut config = TrainingConfig::new(DatasetTag::Conll2012, "train.json");
        config.checkpoint_root = root.to_path_buf();
        config.amp = true;
        let model = tagger();
        let optimizer =
            TrainerOptimizer::new(model.named_parameters(), AdamWConfig::from(&config)).unwrap();
        Fixture {
            model,
            optimizer,
            scheduler: LinearWarmupDecay::new(config.lr, 10, 0.5).unwrap(),
            scaler: GradientScaler::new(Precision::Scaled),
            config,
        }
    }

    fn tagger() -> TokenRoleTagger {
        TokenRoleTagger::new(
            TaggerConfig {
                vocab_size: 6,
                hidden_size: 4,
                num_labels: 3,
                dropout: 0.0,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    fn capture(fixture: &Fixture, epoch: usize) -> CheckpointPayload {
        CheckpointPayload::capture(
            epoch,
            &fixture.config,
            &fixture.model,
            &fixture.optimizer,
            &fixture.scheduler,
            &fixture.scaler,
        )
        .unwrap()
    }

    #[test]
    fn earlier_epochs_are_never_rewritten() {
        let tmp = tempdir().unwrap();
        let fixture = fixture(tmp.path());
        let run = RunContext::with_run_id(&fixture.config, "run");
        let mut store = CheckpointStore::new(&run, &fixture.config);

        let first = store.save(&capture(&fixture, 0)).unwrap();
        assert_eq!(
            first,
            tmp.path()
                .join("conll2012/role_prediction/run/checkpoint_0.cpt")
        );
        let before = fs::read(&first).unwrap();

        store.save(&capture(&fixture, 1)).unwrap();
        assert_eq!(fs::read(&first).unwrap(), before);

        let err = store.save(&capture(&fixture, 0)).unwrap_err();
        assert!(matches!(err, TrainingError::Persistence(_)));
        assert_eq!(fs::read(&first).unwrap(), before);

        let args = TrainingConfig::load(store.directory().join(ARGS_FILENAME)).unwrap();
        assert_eq!(args, fixture.config);
    }

    #[test]
    fn saved_state_restores_into_a_fresh_run() {
        let tmp = tempdir().unwrap();
        let mut source = fixture(tmp.path());
        for _ in 0..3 {
            source.scheduler.step();
        }
        let run = RunContext::with_run_id(&source.config, "run");
        let mut store = CheckpointStore::new(&run, &source.config);
        let path = store.save(&capture(&source, 2)).unwrap();

        let payload = CheckpointStore::load(&path, &Device::Cpu).unwrap();
        assert_eq!(payload.epoch, 2);
        assert_eq!(payload.config_sha256, source.config.fingerprint().unwrap());
        assert_eq!(payload.scheduler.as_ref().unwrap().step, 3);
        assert_eq!(payload.scaler.as_ref().unwrap().scale, 65_536.0);

        let mut target = fixture(tmp.path());
        payload
            .restore(
                &target.model,
                &mut target.optimizer,
                &mut target.scheduler,
                &mut target.scaler,
            )
            .unwrap();

        assert_eq!(target.scheduler.steps_taken(), 3);
        for ((name, expected), (_, actual)) in source
            .model
            .named_parameters()
            .into_iter()
            .zip(target.model.named_parameters())
        {
            let expected = expected.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let actual = actual.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(expected, actual, "parameter {name}");
        }
    }

    #[test]
    fn foreign_files_are_rejected() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("checkpoint_0.cpt");
        fs::write(&path, b"not a checkpoint").unwrap();
        assert!(matches!(
            CheckpointStore::load(&path, &Device::Cpu),
            Err(TrainingError::Persistence(_))
        ));
    }
}
