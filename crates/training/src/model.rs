use std::{cell::Cell, path::Path};

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder, VarMap};

use crate::{config::Precision, data::Batch, loss::MaskedCrossEntropy, TrainingError};

/// Anything the orchestrator can train.
///
/// The loop only needs a scalar loss per batch and the named parameter
/// handles; architecture and loss are the model's business.
pub trait RoleModel {
    /// Scalar loss for `batch`. In `Precision::Scaled` the model may run
    /// its reduced-precision path but must return an f32 scalar.
    fn forward_loss(&self, batch: &Batch, precision: Precision) -> Result<Tensor, TrainingError>;

    /// Trainable parameters in a stable order.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    /// Per-token label predictions `[batch, seq]`, when the model can produce them.
    fn predict(&self, _batch: &Batch) -> Result<Option<Tensor>, TrainingError> {
        Ok(None)
    }
}

/// Classifier dtype in `Precision::Scaled`. f16 has matmul kernels on every backend.
const REDUCED_DTYPE: DType = DType::F16;
const LAYER_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone)]
pub struct TaggerConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_labels: usize,
    pub dropout: f32,
}

/// Baseline tagger: token embedding, LayerNorm, dropout, linear role classifier.
pub struct TokenRoleTagger {
    config: TaggerConfig,
    varmap: VarMap,
    parameters: Vec<(String, Var)>,
    embeddings: Embedding,
    layer_norm: TokenLayerNorm,
    classifier: Linear,
    loss: MaskedCrossEntropy,
    training: Cell<bool>,
}

impl TokenRoleTagger {
    pub fn new(config: TaggerConfig, device: &Device) -> Result<Self, TrainingError> {
        if config.vocab_size == 0 || config.hidden_size == 0 || config.num_labels == 0 {
            return Err(TrainingError::initialization(format!(
                "tagger dimensions must be non-zero: {:?}",
                config
            )));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(TrainingError::initialization(format!(
                "tagger dropout must be in [0, 1) (got {})",
                config.dropout
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let embeddings =
            candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("embeddings"))
                .map_err(to_runtime_error)?;
        let layer_norm = TokenLayerNorm::new(config.hidden_size, vb.pp("LayerNorm"))?;
        let classifier =
            candle_nn::linear(config.hidden_size, config.num_labels, vb.pp("classifier"))
                .map_err(to_runtime_error)?;

        let parameters = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| TrainingError::initialization("tagger parameter map is poisoned"))?;
            let mut named: Vec<(String, Var)> = data
                .iter()
                .map(|(name, var)| (name.clone(), var.clone()))
                .collect();
            named.sort_by(|a, b| a.0.cmp(&b.0));
            named
        };

        Ok(Self {
            config,
            varmap,
            parameters,
            embeddings,
            layer_norm,
            classifier,
            loss: MaskedCrossEntropy::new(),
            training: Cell::new(true),
        })
    }

    pub fn config(&self) -> &TaggerConfig {
        &self.config
    }

    /// Overwrites the freshly initialized weights from a safetensors file.
    pub fn load_pretrained(&mut self, path: &Path) -> Result<(), TrainingError> {
        if !path.is_file() {
            return Err(TrainingError::initialization(format!(
                "pretrained weights not found at {}",
                path.display()
            )));
        }
        self.varmap.load(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load pretrained weights {}: {err}",
                path.display()
            ))
        })?;
        log::info!("initialized tagger from {}", path.display());
        Ok(())
    }

    fn logits(&self, batch: &Batch, precision: Precision) -> Result<Tensor, TrainingError> {
        let hidden = self
            .embeddings
            .forward(&batch.input_ids)
            .map_err(to_runtime_error)?;
        let mut hidden = self.layer_norm.forward(&hidden)?;
        if self.training.get() && self.config.dropout > 0.0 {
            hidden = candle_nn::ops::dropout(&hidden, self.config.dropout)
                .map_err(to_runtime_error)?;
        }

        match precision {
            Precision::Exact => self.classifier.forward(&hidden).map_err(to_runtime_error),
            Precision::Scaled => {
                let dtype = REDUCED_DTYPE;
                let weight = self
                    .classifier
                    .weight()
                    .to_dtype(dtype)
                    .map_err(to_runtime_error)?;
                let logits = hidden
                    .to_dtype(dtype)
                    .map_err(to_runtime_error)?
                    .broadcast_matmul(&weight.t().map_err(to_runtime_error)?)
                    .map_err(to_runtime_error)?;
                let logits = match self.classifier.bias() {
                    Some(bias) => logits
                        .broadcast_add(&bias.to_dtype(dtype).map_err(to_runtime_error)?)
                        .map_err(to_runtime_error)?,
                    None => logits,
                };
                logits.to_dtype(DType::F32).map_err(to_runtime_error)
            }
        }
    }
}

/// LayerNorm over the hidden dimension built from differentiable tensor ops,
/// so gradients reach its parameters and everything upstream of it.
struct TokenLayerNorm {
    weight: Tensor,
    bias: Tensor,
    hidden_size: f64,
}

impl TokenLayerNorm {
    fn new(hidden_size: usize, vb: VarBuilder) -> Result<Self, TrainingError> {
        let weight = vb
            .get_with_hints(hidden_size, "weight", Init::Const(1.0))
            .map_err(to_runtime_error)?;
        let bias = vb
            .get_with_hints(hidden_size, "bias", Init::Const(0.0))
            .map_err(to_runtime_error)?;
        Ok(Self {
            weight,
            bias,
            hidden_size: hidden_size as f64,
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor, TrainingError> {
        let normalize = || -> candle_core::Result<Tensor> {
            let mean = (hidden.sum_keepdim(D::Minus1)? / self.hidden_size)?;
            let centered = hidden.broadcast_sub(&mean)?;
            let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / self.hidden_size)?;
            let denom = (variance + LAYER_NORM_EPS)?.sqrt()?;
            centered
                .broadcast_div(&denom)?
                .broadcast_mul(&self.weight)?
                .broadcast_add(&self.bias)
        };
        normalize().map_err(to_runtime_error)
    }
}

impl RoleModel for TokenRoleTagger {
    fn forward_loss(&self, batch: &Batch, precision: Precision) -> Result<Tensor, TrainingError> {
        let logits = self.logits(batch, precision)?;
        let output = self
            .loss
            .compute(&logits, &batch.target, &batch.attention_mask)?;
        Ok(output.loss)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.parameters.clone()
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn is_training(&self) -> bool {
        self.training.get()
    }

    fn predict(&self, batch: &Batch) -> Result<Option<Tensor>, TrainingError> {
        let logits = self.logits(batch, Precision::Exact)?;
        logits
            .argmax(D::Minus1)
            .map(Some)
            .map_err(to_runtime_error)
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Example;

    fn tagger() -> TokenRoleTagger {
        TokenRoleTagger::new(
            TaggerConfig {
                vocab_size: 10,
                hidden_size: 8,
                num_labels: 3,
                dropout: 0.0,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn exposes_bias_and_layer_norm_names() {
        let names: Vec<String> = tagger()
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec![
                "LayerNorm.bias",
                "LayerNorm.weight",
                "classifier.bias",
                "classifier.weight",
                "embeddings.weight",
            ]
        );
    }

    #[test]
    fn loss_is_a_finite_scalar_in_both_modes() {
        let model = tagger();
        let example = Example {
            input_ids: vec![1, 2, 3],
            target: vec![0, 1, 2],
        };
        let batch = Batch::from_examples(&[&example], &Device::Cpu).unwrap();
        for precision in [Precision::Exact, Precision::Scaled] {
            let loss = model.forward_loss(&batch, precision).unwrap();
            assert!(loss.dims().is_empty());
            assert!(loss.to_vec0::<f32>().unwrap().is_finite());
        }
    }

    #[test]
    fn every_parameter_receives_a_gradient() {
        let model = tagger();
        let example = Example {
            input_ids: vec![4, 5, 6, 7],
            target: vec![2, 1, 0, 1],
        };
        let batch = Batch::from_examples(&[&example], &Device::Cpu).unwrap();
        for precision in [Precision::Exact, Precision::Scaled] {
            let grads = model.forward_loss(&batch, precision).unwrap().backward().unwrap();
            for (name, var) in model.named_parameters() {
                let grad = grads
                    .get(var.as_tensor())
                    .unwrap_or_else(|| panic!("{name} has no gradient in {precision:?}"));
                let norm = grad.sqr().unwrap().sum_all().unwrap().to_vec0::<f32>().unwrap();
                assert!(norm.is_finite());
            }
        }
    }

    #[test]
    fn layer_norm_normalizes_each_token() {
        let model = tagger();
        let hidden = Tensor::from_slice(&[1f32, 2., 3., 4., 5., 6., 7., 8.], (1, 1, 8), &Device::Cpu)
            .unwrap();
        let out = model.layer_norm.forward(&hidden).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let mean: f32 = values.iter().sum::<f32>() / 8.0;
        let variance: f32 = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 8.0;
        assert!(mean.abs() < 1e-5);
        assert!((variance - 1.0).abs() < 1e-3);
    }
}
