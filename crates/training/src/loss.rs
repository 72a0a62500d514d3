use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Token-level cross entropy that only counts positions where the attention mask is set.
#[derive(Debug, Clone, Default)]
pub struct MaskedCrossEntropy;

impl MaskedCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        mask: &Tensor,
    ) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let num_labels = *dims
            .last()
            .ok_or_else(|| TrainingError::runtime("logits tensor missing label dimension"))?;
        if num_labels == 0 {
            return Err(TrainingError::runtime(
                "logits label dimension must be greater than zero",
            ));
        }

        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims || mask.dims() != token_dims {
            return Err(TrainingError::runtime(format!(
                "targets {:?} and mask {:?} must match logits batch/sequence dimensions {:?}",
                targets.dims(),
                mask.dims(),
                token_dims
            )));
        }

        let token_count: usize = token_dims.iter().copied().product();
        if token_count == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .reshape((token_count, num_labels))
            .map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_flat = targets
            .to_device(device)
            .map_err(to_runtime_error)?
            .reshape((token_count,))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let valid_mask = mask
            .to_device(device)
            .map_err(to_runtime_error)?
            .reshape((token_count,))
            .map_err(to_runtime_error)?
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;

        let total_tokens = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?
            .round() as usize;
        if total_tokens == 0 {
            return Err(TrainingError::runtime(
                "attention mask leaves no tokens for loss computation",
            ));
        }

        let target_indices = targets_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let weighted_loss = (&nll * &valid_mask).map_err(to_runtime_error)?;
        let loss = weighted_loss
            .sum_all()
            .map_err(to_runtime_error)?
            .affine(1f64 / total_tokens as f64, 0.0)
            .map_err(to_runtime_error)?;

        Ok(LossOutput { loss, total_tokens })
    }
}

/// Mean loss over unmasked tokens and how many tokens it averaged.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub total_tokens: usize,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
