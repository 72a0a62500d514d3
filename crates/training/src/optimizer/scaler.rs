use candle_core::{backprop::GradStore, DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, TrainingError};

use super::TrainerOptimizer;

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f64.powi(16),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2_000,
        }
    }
}

/// Dynamic loss scaling for reduced-precision training.
///
/// One iteration is `scale` → backward → optional `unscale` → `step` →
/// `update`. In exact precision the scaler is `Disabled` and every call
/// passes through.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f64,
    growth_tracker: usize,
    config: LossScaleConfig,
    phase: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Unscaled { found_inf: bool },
}

/// Serializable scaler state stored alongside checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradientScalerState {
    pub scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
    pub growth_tracker: usize,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn disabled() -> Self {
        Self {
            state: ScalerState::Disabled,
        }
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if precision == Precision::Exact {
            return Self::disabled();
        }

        let config = sanitize_config(config);
        Self {
            state: ScalerState::Enabled(EnabledState {
                loss_scale: config.initial_scale,
                growth_tracker: 0,
                config,
                phase: Phase::Ready,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f64 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(loss.clone()),
            ScalerState::Enabled(state) => loss
                .affine(state.loss_scale, 0.0)
                .map_err(to_runtime_error),
        }
    }

    /// Divides every gradient owned by `optimizer` by the current scale, in
    /// place, and reports whether any of them is non-finite.
    ///
    /// Calling it twice before `update` is an error.
    pub fn unscale(
        &mut self,
        optimizer: &TrainerOptimizer,
        grads: &mut GradStore,
    ) -> Result<bool, TrainingError> {
        let state = match &mut self.state {
            ScalerState::Disabled => return Ok(false),
            ScalerState::Enabled(state) => state,
        };
        if let Phase::Unscaled { .. } = state.phase {
            return Err(TrainingError::runtime(
                "unscale was already called for this iteration",
            ));
        }

        let inv_scale = 1.0 / state.loss_scale;
        let mut found_inf = false;
        for var in optimizer.parameters() {
            let tensor = var.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
                .affine(inv_scale, 0.0)
                .map_err(to_runtime_error)?;
            if !found_inf && contains_non_finite(&grad)? {
                found_inf = true;
            }
            grads.insert(tensor, grad);
        }

        state.phase = Phase::Unscaled { found_inf };
        Ok(found_inf)
    }

    /// Applies the optimizer update unless the unscaled gradients overflowed.
    /// Returns whether the update was applied.
    pub fn step(
        &mut self,
        optimizer: &mut TrainerOptimizer,
        grads: &mut GradStore,
    ) -> Result<bool, TrainingError> {
        let phase = match &self.state {
            ScalerState::Disabled => {
                optimizer.step(grads)?;
                return Ok(true);
            }
            ScalerState::Enabled(state) => state.phase,
        };
        let found_inf = match phase {
            Phase::Unscaled { found_inf } => found_inf,
            Phase::Ready => self.unscale(optimizer, grads)?,
        };

        if found_inf {
            log::debug!(
                "skipping optimizer step: non-finite gradients at loss scale {}",
                self.loss_scale()
            );
            return Ok(false);
        }

        optimizer.step(grads)?;
        Ok(true)
    }

    /// Adjusts the scale from the outcome of the current iteration and
    /// starts the next one.
    pub fn update(&mut self) {
        if let ScalerState::Enabled(state) = &mut self.state {
            match state.phase {
                Phase::Unscaled { found_inf: true } => {
                    state.loss_scale *= state.config.backoff_factor;
                    state.growth_tracker = 0;
                }
                Phase::Unscaled { found_inf: false } => {
                    state.growth_tracker += 1;
                    if state.growth_tracker >= state.config.growth_interval {
                        state.loss_scale *= state.config.growth_factor;
                        state.growth_tracker = 0;
                    }
                }
                Phase::Ready => {}
            }
            state.phase = Phase::Ready;
        }
    }

    pub fn state(&self) -> Option<GradientScalerState> {
        match &self.state {
            ScalerState::Disabled => None,
            ScalerState::Enabled(state) => Some(GradientScalerState {
                scale: state.loss_scale,
                growth_factor: state.config.growth_factor,
                backoff_factor: state.config.backoff_factor,
                growth_interval: state.config.growth_interval,
                growth_tracker: state.growth_tracker,
            }),
        }
    }

    pub fn load_state(&mut self, saved: &GradientScalerState) -> Result<(), TrainingError> {
        match &mut self.state {
            ScalerState::Disabled => Err(TrainingError::runtime(
                "cannot restore loss-scale state into a disabled scaler",
            )),
            ScalerState::Enabled(state) => {
                state.config = sanitize_config(LossScaleConfig {
                    initial_scale: saved.scale,
                    growth_factor: saved.growth_factor,
                    backoff_factor: saved.backoff_factor,
                    growth_interval: saved.growth_interval,
                });
                state.loss_scale = state.config.initial_scale;
                state.growth_tracker = saved.growth_tracker;
                state.phase = Phase::Ready;
                Ok(())
            }
        }
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    // inf and nan both survive the reduction
    let sum = tensor
        .abs()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) || config.backoff_factor == 0.0 {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if !(config.initial_scale.is_finite() && config.initial_scale > 0.0) {
        config.initial_scale = LossScaleConfig::default().initial_scale;
    }
    config
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{AdamWConfig, TrainerOptimizer};
    use candle_core::{Device, Var};

    fn optimizer_with(values: &[f32]) -> (TrainerOptimizer, Var) {
        let var = Var::from_slice(values, (values.len(),), &Device::Cpu).unwrap();
        let optimizer = TrainerOptimizer::new(
            vec![("classifier.weight".to_string(), var.clone())],
            AdamWConfig::new(1e-1, 0.0),
        )
        .unwrap();
        (optimizer, var)
    }

    fn grads_for(var: &Var, values: &[f32]) -> GradStore {
        let target = Tensor::from_slice(values, (values.len(),), &Device::Cpu).unwrap();
        // d/dw sum(w * g) = g
        var.as_tensor()
            .mul(&target)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap()
    }

    #[test]
    fn grows_after_interval() {
        let (mut optimizer, var) = optimizer_with(&[1.0, 2.0]);
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            Precision::Scaled,
        );

        for expected in [512.0, 1024.0] {
            let mut grads = grads_for(&var, &[1.0, 1.0]);
            assert!(scaler.step(&mut optimizer, &mut grads).unwrap());
            scaler.update();
            assert_eq!(scaler.loss_scale(), expected);
        }
    }

    #[test]
    fn overflow_halves_scale_and_skips_step() {
        let (mut optimizer, var) = optimizer_with(&[1.0, 2.0]);
        let mut scaler = GradientScaler::new(Precision::Scaled);
        assert_eq!(scaler.loss_scale(), 65_536.0);

        let mut grads = grads_for(&var, &[f32::INFINITY, 1.0]);
        assert!(scaler.unscale(&optimizer, &mut grads).unwrap());
        assert!(!scaler.step(&mut optimizer, &mut grads).unwrap());
        scaler.update();

        assert_eq!(scaler.loss_scale(), 32_768.0);
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(optimizer.step_count(), 0);
    }

    #[test]
    fn double_unscale_is_rejected() {
        let (optimizer, var) = optimizer_with(&[1.0]);
        let mut scaler = GradientScaler::new(Precision::Scaled);
        let mut grads = grads_for(&var, &[4.0]);

        scaler.unscale(&optimizer, &mut grads).unwrap();
        assert!(scaler.unscale(&optimizer, &mut grads).is_err());

        scaler.update();
        let mut grads = grads_for(&var, &[4.0]);
        assert!(scaler.unscale(&optimizer, &mut grads).is_ok());
    }

    #[test]
    fn unscale_divides_gradients_in_place() {
        let (optimizer, var) = optimizer_with(&[0.0, 0.0]);
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 4.0,
                ..LossScaleConfig::default()
            },
            Precision::Scaled,
        );
        let mut grads = grads_for(&var, &[8.0, -4.0]);
        assert!(!scaler.unscale(&optimizer, &mut grads).unwrap());
        let grad = grads.get(var.as_tensor()).unwrap();
        assert_eq!(grad.to_vec1::<f32>().unwrap(), vec![2.0, -1.0]);
    }

    #[test]
    fn disabled_scaler_passes_through() {
        let (mut optimizer, var) = optimizer_with(&[1.0]);
        let mut scaler = GradientScaler::new(Precision::Exact);
        assert!(!scaler.is_enabled());
        assert!(scaler.state().is_none());

        let loss = Tensor::new(3.0f32, &Device::Cpu).unwrap();
        assert_eq!(scaler.scale(&loss).unwrap().to_vec0::<f32>().unwrap(), 3.0);

        let mut grads = grads_for(&var, &[f32::NAN]);
        assert!(!scaler.unscale(&optimizer, &mut grads).unwrap());
        assert!(scaler.step(&mut optimizer, &mut grads).unwrap());
        scaler.update();
        assert_eq!(scaler.loss_scale(), 1.0);
    }

    #[test]
    fn state_restores_scale_and_tracker() {
        let mut scaler = GradientScaler::new(Precision::Scaled);
        let saved = GradientScalerState {
            scale: 128.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2_000,
            growth_tracker: 17,
        };
        scaler.load_state(&saved).unwrap();
        assert_eq!(scaler.state().unwrap(), saved);
        assert!(GradientScaler::disabled().load_state(&saved).is_err());
    }
}
