use std::path::PathBuf;

use candle_core::{DType, Var};

use crate::{
    checkpoint::{CheckpointPayload, CheckpointStore},
    config::Precision,
    data::{Batch, DataLoader},
    distributed::{DistributedCoordinator, SingleProcess},
    evaluation::{Evaluator, LossEvaluator},
    logging::{Logger, LoggingSettings},
    metrics::{ScoreRecord, StepState},
    model::RoleModel,
    optimizer::{clip_grad_norm, AdamWConfig, GradientScaler, TrainerOptimizer},
    run::RunContext,
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Batches whose token dimension exceeds this are dropped without training.
pub const MAX_TOKEN_DIM: usize = 512;

/// What a finished (or interrupted) run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    pub processed_batches: usize,
    pub skipped_batches: usize,
    /// Optimizer updates actually applied; scaled runs may skip some.
    pub optimizer_steps: usize,
    pub scheduler_steps: usize,
    pub checkpoints: Vec<PathBuf>,
    /// Baseline record first when evaluation is enabled, then one per epoch.
    pub evaluations: Vec<ScoreRecord>,
    pub never_updated: Vec<String>,
    pub interrupted: bool,
}

type StepObserver = Box<dyn FnMut(&StepState)>;

/// Epoch/step driver for a `RoleModel`.
///
/// Owns optimizer, scheduler, scaler and checkpoint store for the duration
/// of `run`; the model stays with the trainer afterwards.
pub struct Trainer<M: RoleModel> {
    config: TrainingConfig,
    run: RunContext,
    model: M,
    coordinator: Box<dyn DistributedCoordinator>,
    evaluator: Box<dyn Evaluator>,
    logging: Option<LoggingSettings>,
    observer: Option<StepObserver>,
}

struct TrainingState {
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    scaler: GradientScaler,
    store: CheckpointStore,
    params: Vec<Var>,
    logger: Logger,
}

impl<M: RoleModel> Trainer<M> {
    pub fn new(config: TrainingConfig, model: M) -> Result<Self, TrainingError> {
        config.validate()?;
        Ok(Self {
            run: RunContext::new(&config),
            config,
            model,
            coordinator: Box::new(SingleProcess),
            evaluator: Box::new(LossEvaluator::new()),
            logging: None,
            observer: None,
        })
    }

    pub fn with_coordinator(mut self, coordinator: Box<dyn DistributedCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_run_context(mut self, run: RunContext) -> Self {
        self.run = run;
        self
    }

    /// Overrides the sinks derived from the config and rank.
    pub fn with_logging(mut self, settings: LoggingSettings) -> Self {
        self.logging = Some(settings);
        self
    }

    /// Called with every `StepState` after the corresponding update.
    pub fn with_step_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&StepState) + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn run(
        &mut self,
        train: &mut dyn DataLoader,
        dev: Option<&mut dyn DataLoader>,
    ) -> Result<TrainingSummary, TrainingError> {
        self.run_with_shutdown(train, dev, || false)
    }

    /// Like `run`, but checks `should_stop` before every batch. A stop
    /// abandons the current epoch without saving or evaluating it.
    pub fn run_with_shutdown<F>(
        &mut self,
        train: &mut dyn DataLoader,
        mut dev: Option<&mut dyn DataLoader>,
        mut should_stop: F,
    ) -> Result<TrainingSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let primary = self.coordinator.is_primary();
        let prepared = if self.config.eval && primary && dev.is_none() {
            Err(TrainingError::initialization(
                "evaluation is enabled but no dev stream was provided",
            ))
        } else {
            self.prepare(train.num_batches(), primary)
        };
        let mut state = self.settle(prepared, "startup")?;
        let mut summary = TrainingSummary::default();
        let hparams = self.config.numeric_hparams();

        log::info!(
            "run {}: {} epochs x {} batches on rank {} of {} ({:?} precision)",
            self.run.run_id(),
            self.config.max_epochs,
            train.num_batches(),
            self.coordinator.rank(),
            self.coordinator.world_size(),
            self.config.precision()
        );

        self.model.set_training(true);
        if self.config.eval && primary {
            if let Some(dev) = dev.as_mut().map(|d| &mut **d as &mut dyn DataLoader) {
                let record = self.evaluate(dev)?;
                state.logger.log_evaluation(0, &record, &hparams);
                summary.evaluations.push(record);
            }
        }

        'epochs: for epoch in 0..self.config.max_epochs {
            train.set_epoch(epoch);
            let batches_per_epoch = train.num_batches();
            state.logger.start_epoch(epoch, batches_per_epoch);
            let mut epoch_loss = 0.0;
            let mut epoch_batches = 0usize;
            let mut batch_index = 0usize;

            loop {
                if should_stop() {
                    log::info!("stop requested during epoch {epoch}; abandoning it");
                    summary.interrupted = true;
                    state.logger.finish_epoch();
                    break 'epochs;
                }
                let Some(batch) = train.next_batch()? else {
                    break;
                };
                let global_step = epoch * batches_per_epoch + batch_index;
                batch_index += 1;

                let token_dim = batch.token_dim();
                if token_dim > MAX_TOKEN_DIM {
                    log::warn!(
                        "skipping batch with token dimension {token_dim} (limit {MAX_TOKEN_DIM})"
                    );
                    summary.skipped_batches += 1;
                    state.logger.log_skipped_batch();
                    continue;
                }

                let step = self.train_step(&mut state, epoch, global_step, &batch)?;
                summary.processed_batches += 1;
                if step.applied {
                    summary.optimizer_steps += 1;
                }
                epoch_loss += step.loss;
                epoch_batches += 1;

                state.logger.log_step(&step);
                if let Some(observer) = self.observer.as_mut() {
                    observer(&step);
                }
            }

            state.logger.finish_epoch();
            if epoch_batches > 0 {
                log::info!(
                    "epoch {epoch} done: {epoch_batches} batches, mean loss {:.4}",
                    epoch_loss / epoch_batches as f64
                );
            }

            let epoch_dev = dev.as_mut().map(|d| &mut **d as &mut dyn DataLoader);
            self.end_of_epoch(&mut state, epoch, epoch_dev, &hparams, &mut summary)?;
        }

        state.logger.flush();
        summary.scheduler_steps = state.scheduler.steps_taken();
        summary.never_updated = state
            .optimizer
            .never_updated()
            .into_iter()
            .map(str::to_string)
            .collect();
        if !summary.never_updated.is_empty() && summary.processed_batches > 0 {
            log::warn!(
                "parameters never received a gradient: {}",
                summary.never_updated.join(", ")
            );
        }
        Ok(summary)
    }

    fn prepare(&self, steps_per_epoch: usize, primary: bool) -> Result<TrainingState, TrainingError> {
        let named = self.model.named_parameters();
        let params: Vec<Var> = named.iter().map(|(_, var)| var.clone()).collect();
        let mut optimizer = TrainerOptimizer::new(named, AdamWConfig::from(&self.config))?;
        let scheduler =
            SchedulerConfig::from_training_config(&self.config, steps_per_epoch).build()?;
        optimizer.set_learning_rate(scheduler.learning_rate());

        let settings = self
            .logging
            .clone()
            .unwrap_or_else(|| LoggingSettings::for_run(&self.config, &self.run, primary));
        let logger = Logger::new(settings)?;
        if let Some(dir) = logger.tensorboard_dir() {
            log::info!("writing tensorboard events to {}", dir.display());
        }

        Ok(TrainingState {
            optimizer,
            scheduler,
            scaler: GradientScaler::new(self.config.precision()),
            store: CheckpointStore::new(&self.run, &self.config),
            params,
            logger,
        })
    }

    fn train_step(
        &self,
        state: &mut TrainingState,
        epoch: usize,
        global_step: usize,
        batch: &Batch,
    ) -> Result<StepState, TrainingError> {
        let precision = self.config.precision();
        let loss = self.model.forward_loss(batch, precision)?;
        let loss_value = loss
            .to_dtype(DType::F64)
            .and_then(|loss| loss.to_vec0::<f64>())
            .map_err(to_runtime_error)?;

        let scaled = state.scaler.scale(&loss)?;
        let mut grads = scaled.backward().map_err(to_runtime_error)?;

        if precision == Precision::Scaled {
            state.scaler.unscale(&state.optimizer, &mut grads)?;
        }
        let grad_norm = clip_grad_norm(
            state.optimizer.parameters(),
            &mut grads,
            self.config.max_grad_norm,
        )?
        .unwrap_or(0.0);

        let learning_rate = state.optimizer.learning_rate();
        let applied = state.scaler.step(&mut state.optimizer, &mut grads)?;
        state.scaler.update();

        let next_lr = state.scheduler.step();
        state.optimizer.set_learning_rate(next_lr);

        Ok(StepState {
            epoch,
            global_step,
            loss: loss_value,
            grad_norm,
            learning_rate,
            applied,
        })
    }

    fn end_of_epoch(
        &mut self,
        state: &mut TrainingState,
        epoch: usize,
        dev: Option<&mut dyn DataLoader>,
        hparams: &[(&str, f64)],
        summary: &mut TrainingSummary,
    ) -> Result<(), TrainingError> {
        let primary = self.coordinator.is_primary();

        let saved = if primary && self.config.save {
            CheckpointPayload::capture(
                epoch,
                &self.config,
                &self.model,
                &state.optimizer,
                state.scheduler.as_ref(),
                &state.scaler,
            )
            .and_then(|payload| state.store.save(&payload))
            .map(Some)
        } else {
            Ok(None)
        };

        if !self.config.eval {
            summary.checkpoints.extend(saved?);
            return Ok(());
        }

        // every rank joins the collective, only the primary evaluates
        if self.coordinator.is_distributed() {
            self.coordinator.all_reduce_average(&state.params)?;
        }
        let evaluated = match dev {
            Some(dev) if primary => self.evaluate(dev).map(Some),
            _ => Ok(None),
        };

        let (saved, evaluated) = self.settle(
            saved.and_then(|path| evaluated.map(|record| (path, record))),
            "end of epoch",
        )?;
        summary.checkpoints.extend(saved);
        if let Some(record) = evaluated {
            state.logger.log_evaluation(epoch + 1, &record, hparams);
            summary.evaluations.push(record);
        }
        Ok(())
    }

    /// Makes a local failure fatal on every rank. Ranks only meet when
    /// evaluation is enabled, so single-sided errors elsewhere need no vote.
    fn settle<T>(
        &self,
        local: Result<T, TrainingError>,
        stage: &str,
    ) -> Result<T, TrainingError> {
        if !(self.config.eval && self.coordinator.is_distributed()) {
            return local;
        }
        let vote = if local.is_ok() { 0.0 } else { 1.0 };
        let failures = self.coordinator.all_reduce_sum(vec![vote])?;
        let value = local?;
        match failures.first() {
            Some(failed) if *failed > 0.0 => Err(TrainingError::distributed(format!(
                "{failed} rank(s) failed at {stage}"
            ))),
            _ => Ok(value),
        }
    }

    fn evaluate(&mut self, dev: &mut dyn DataLoader) -> Result<ScoreRecord, TrainingError> {
        let result = self.evaluator.evaluate(&self.model, dev);
        self.model.set_training(true);
        result
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
