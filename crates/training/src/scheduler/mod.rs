use serde::{Deserialize, Serialize};

use crate::{TrainingConfig, TrainingError};

/// Learning-rate policy advanced once per applied training step.
pub trait LRScheduler: Send {
    /// Advances the step counter and returns the learning rate to use next.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn steps_taken(&self) -> usize;
    /// `None` for schedulers without persistent state.
    fn state(&self) -> Option<SchedulerState>;
    fn load_state(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub base_lr: f64,
    pub warmup_steps: f64,
    pub total_steps: usize,
    pub step: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerConfig {
    Constant {
        base_lr: f64,
    },
    LinearWarmupDecay {
        base_lr: f64,
        total_steps: usize,
        warmup_ratio: f64,
    },
}

impl SchedulerConfig {
    /// Linear warmup/decay when `warmup_ratio > 0`, a constant rate otherwise.
    pub fn from_training_config(config: &TrainingConfig, steps_per_epoch: usize) -> Self {
        if config.scheduler_enabled() {
            SchedulerConfig::LinearWarmupDecay {
                base_lr: config.lr,
                total_steps: config.max_epochs * steps_per_epoch,
                warmup_ratio: config.warmup_ratio,
            }
        } else {
            SchedulerConfig::Constant { base_lr: config.lr }
        }
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        match self {
            SchedulerConfig::Constant { base_lr } => Ok(Box::new(NoScheduler::new(base_lr))),
            SchedulerConfig::LinearWarmupDecay {
                base_lr,
                total_steps,
                warmup_ratio,
            } => Ok(Box::new(LinearWarmupDecay::new(
                base_lr,
                total_steps,
                warmup_ratio,
            )?)),
        }
    }
}

/// Linear ramp from 0 to `base_lr` over the warmup, then linear decay to 0
/// at `total_steps`. The warmup length is real-valued.
#[derive(Debug, Clone)]
pub struct LinearWarmupDecay {
    base_lr: f64,
    warmup_steps: f64,
    total_steps: usize,
    step: usize,
}

impl LinearWarmupDecay {
    pub fn new(base_lr: f64, total_steps: usize, warmup_ratio: f64) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if !(warmup_ratio > 0.0 && warmup_ratio <= 1.0) {
            return Err(TrainingError::initialization(format!(
                "warmup_ratio must be in (0, 1] (got {})",
                warmup_ratio
            )));
        }

        Ok(Self {
            base_lr,
            warmup_steps: warmup_ratio * total_steps as f64,
            total_steps,
            step: 0,
        })
    }

    pub fn warmup_steps(&self) -> f64 {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Multiplier applied to the base rate at `step`.
    pub fn lambda(&self, step: usize) -> f64 {
        let step = step as f64;
        if step < self.warmup_steps {
            return step / self.warmup_steps.max(1.0);
        }
        let total = self.total_steps as f64;
        ((total - step) / (total - self.warmup_steps).max(1.0)).max(0.0)
    }
}

impl LRScheduler for LinearWarmupDecay {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr * self.lambda(self.step)
    }

    fn steps_taken(&self) -> usize {
        self.step
    }

    fn state(&self) -> Option<SchedulerState> {
        Some(SchedulerState {
            base_lr: self.base_lr,
            warmup_steps: self.warmup_steps,
            total_steps: self.total_steps,
            step: self.step,
        })
    }

    fn load_state(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.total_steps != self.total_steps {
            return Err(TrainingError::runtime(format!(
                "scheduler total_steps mismatch: checkpoint has {}, run has {}",
                state.total_steps, self.total_steps
            )));
        }
        self.base_lr = state.base_lr;
        self.warmup_steps = state.warmup_steps;
        self.step = state.step;
        Ok(())
    }
}

/// Keeps the base learning rate; stepping it does nothing.
#[derive(Debug, Clone)]
pub struct NoScheduler {
    base_lr: f64,
}

impl NoScheduler {
    pub fn new(base_lr: f64) -> Self {
        Self { base_lr }
    }
}

impl LRScheduler for NoScheduler {
    fn step(&mut self) -> f64 {
        self.base_lr
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr
    }

    fn steps_taken(&self) -> usize {
        0
    }

    fn state(&self) -> Option<SchedulerState> {
        None
    }

    fn load_state(&mut self, _state: &SchedulerState) -> Result<(), TrainingError> {
        Err(TrainingError::runtime(
            "checkpoint carries scheduler state but no scheduler is configured",
        ))
    }
}
