use std::collections::{HashMap, HashSet};

pub mod clip;
pub mod scaler;

pub use clip::{clip_grad_norm, global_grad_norm};
pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{TrainingConfig, TrainingError};

const EPS: f64 = 1e-12;

/// Parameter names matching any of these never receive weight decay.
pub const NO_DECAY_PATTERNS: [&str; 2] = ["bias", "LayerNorm.weight"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl AdamWConfig {
    /// AdamW with the usual betas and epsilon.
    pub fn new(learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
        }
    }
}

impl From<&TrainingConfig> for AdamWConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self::new(config.lr, config.weight_decay)
    }
}

/// Which parameters share a weight-decay setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub weight_decay: f64,
    pub params: Vec<String>,
}

/// AdamW over two parameter groups: decayed, and `bias`/`LayerNorm.weight`
/// parameters without decay.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    updated: HashSet<String>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        let mut seen = HashSet::new();
        for (name, var) in named_parameters {
            if !seen.insert(name.clone()) {
                return Err(TrainingError::initialization(format!(
                    "duplicate parameter name '{}'",
                    name
                )));
            }
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            params.push(ParameterSlot {
                apply_weight_decay: applies_weight_decay(&name),
                dtype: tensor.dtype(),
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            updated: HashSet::new(),
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Var> + Clone + '_ {
        self.params.iter().map(|slot| &slot.param)
    }

    pub fn param_groups(&self) -> Vec<ParamGroup> {
        let (decay, no_decay): (Vec<_>, Vec<_>) =
            self.params.iter().partition(|slot| slot.apply_weight_decay);
        vec![
            ParamGroup {
                weight_decay: self.config.weight_decay,
                params: decay.into_iter().map(|slot| slot.name.clone()).collect(),
            },
            ParamGroup {
                weight_decay: 0.0,
                params: no_decay.into_iter().map(|slot| slot.name.clone()).collect(),
            },
        ]
    }

    /// Names of parameters that have not received a gradient in any step yet.
    pub fn never_updated(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|slot| !self.updated.contains(&slot.name))
            .map(|slot| slot.name.as_str())
            .collect()
    }

    /// One AdamW update from the gradients in `grads`. Parameters without a
    /// gradient keep their value and moments. Consumed gradients are
    /// removed from the store.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
                processed.push((index, grad));
            }
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];
            self.updated.insert(slot.name.clone());

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - cfg.beta2, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed
                .sub(&update)
                .map_err(to_runtime_error)?
                .to_dtype(slot.dtype)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Optimizer state split into a JSON-friendly header and the moment tensors.
    pub fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot {
            state: OptimizerState {
                step: self.step,
                config: self.config,
                groups: self.param_groups(),
            },
            moments: self
                .params
                .iter()
                .map(|slot| ParameterMoments {
                    name: slot.name.clone(),
                    exp_avg: slot.first_moment.clone(),
                    exp_avg_sq: slot.second_moment.clone(),
                })
                .collect(),
        }
    }

    pub fn load_snapshot(&mut self, snapshot: OptimizerSnapshot) -> Result<(), TrainingError> {
        let mut by_name: HashMap<String, ParameterMoments> = snapshot
            .moments
            .into_iter()
            .map(|moments| (moments.name.clone(), moments))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let moments = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;
            let dims = slot.param.as_tensor().dims();
            if moments.exp_avg.dims() != dims || moments.exp_avg_sq.dims() != dims {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let device = slot.param.as_tensor().device();
            let exp_avg = moments
                .exp_avg
                .to_dtype(DType::F32)
                .and_then(|t| t.to_device(device))
                .map_err(to_runtime_error)?;
            let exp_avg_sq = moments
                .exp_avg_sq
                .to_dtype(DType::F32)
                .and_then(|t| t.to_device(device))
                .map_err(to_runtime_error)?;
            restored.push((exp_avg, exp_avg_sq));
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        for (slot, (exp_avg, exp_avg_sq)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = exp_avg;
            slot.second_moment = exp_avg_sq;
        }
        self.step = snapshot.state.step;
        self.config = snapshot.state.config;
        Ok(())
    }
}

fn applies_weight_decay(name: &str) -> bool {
    !NO_DECAY_PATTERNS
        .iter()
        .any(|pattern| name.contains(pattern))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub config: AdamWConfig,
    pub groups: Vec<ParamGroup>,
}

#[derive(Debug, Clone)]
pub struct ParameterMoments {
    pub name: String,
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
}

#[derive(Debug, Clone)]
pub struct OptimizerSnapshot {
    pub state: OptimizerState,
    pub moments: Vec<ParameterMoments>,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_slice(values, (values.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn groups_split_bias_and_layer_norm_weight() {
        let optimizer = TrainerOptimizer::new(
            vec![
                ("classifier.weight".into(), var(&[1.0])),
                ("classifier.bias".into(), var(&[1.0])),
                ("LayerNorm.weight".into(), var(&[1.0])),
                ("LayerNorm.bias".into(), var(&[1.0])),
                ("embeddings.weight".into(), var(&[1.0])),
            ],
            AdamWConfig::new(1e-3, 0.01),
        )
        .unwrap();

        let groups = optimizer.param_groups();
        assert_eq!(groups[0].weight_decay, 0.01);
        assert_eq!(
            groups[0].params,
            vec!["classifier.weight", "embeddings.weight"]
        );
        assert_eq!(groups[1].weight_decay, 0.0);
        assert_eq!(
            groups[1].params,
            vec!["classifier.bias", "LayerNorm.weight", "LayerNorm.bias"]
        );
    }

    #[test]
    fn step_moves_against_gradient_and_leaves_untouched_params() {
        let w = var(&[1.0, -1.0]);
        let frozen = var(&[5.0]);
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".into(), w.clone()), ("frozen".into(), frozen.clone())],
            AdamWConfig::new(0.1, 0.0),
        )
        .unwrap();

        // loss = sum(w^2), gradient 2w
        let mut grads = w.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let updated = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!(updated[0] < 1.0 && updated[1] > -1.0);
        assert_eq!(frozen.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0]);
        assert_eq!(optimizer.step_count(), 1);
        assert_eq!(optimizer.never_updated(), vec!["frozen"]);
    }

    #[test]
    fn empty_gradient_store_is_not_a_step() {
        let w = var(&[1.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".into(), w.clone())], AdamWConfig::new(0.1, 0.0))
                .unwrap();
        let mut grads = w.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        grads.remove(w.as_tensor());
        optimizer.step(&mut grads).unwrap();
        assert_eq!(optimizer.step_count(), 0);
    }

    #[test]
    fn snapshot_restores_moments_into_fresh_optimizer() {
        let w = var(&[1.0, 2.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".into(), w.clone())], AdamWConfig::new(0.1, 0.0))
                .unwrap();
        let mut grads = w.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let snapshot = optimizer.snapshot();

        let mut fresh =
            TrainerOptimizer::new(vec![("w".into(), var(&[0.0, 0.0]))], AdamWConfig::new(0.5, 0.0))
                .unwrap();
        fresh.load_snapshot(snapshot.clone()).unwrap();
        assert_eq!(fresh.step_count(), 1);
        assert_eq!(fresh.learning_rate(), 0.1);
        assert_eq!(
            fresh.snapshot().moments[0]
                .exp_avg
                .to_vec1::<f32>()
                .unwrap(),
            snapshot.moments[0].exp_avg.to_vec1::<f32>().unwrap()
        );

        let mut mismatched =
            TrainerOptimizer::new(vec![("v".into(), var(&[0.0, 0.0]))], AdamWConfig::new(0.5, 0.0))
                .unwrap();
        assert!(mismatched.load_snapshot(snapshot).is_err());
    }
}
