use candle_core::{DType, Tensor};

use crate::{
    config::Precision,
    data::{Batch, DataLoader},
    metrics::{EvaluationMetrics, ScoreRecord},
    model::RoleModel,
    TrainingError,
};

/// Scores a model against a dev stream.
///
/// Implementations may switch the model to inference mode; the caller
/// restores training mode.
pub trait Evaluator {
    fn evaluate(
        &mut self,
        model: &dyn RoleModel,
        dev: &mut dyn DataLoader,
    ) -> Result<ScoreRecord, TrainingError>;
}

/// Reports mean masked loss over the dev stream, plus token accuracy when
/// the model can predict labels.
#[derive(Debug, Default, Clone, Copy)]
pub struct LossEvaluator;

impl LossEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for LossEvaluator {
    fn evaluate(
        &mut self,
        model: &dyn RoleModel,
        dev: &mut dyn DataLoader,
    ) -> Result<ScoreRecord, TrainingError> {
        model.set_training(false);
        dev.set_epoch(0);

        let mut metrics = EvaluationMetrics::default();
        while let Some(batch) = dev.next_batch()? {
            let tokens = scalar_sum(&batch.attention_mask)?;
            let loss = model
                .forward_loss(&batch, Precision::Exact)?
                .to_dtype(DType::F64)
                .and_then(|loss| loss.to_vec0::<f64>())
                .map_err(to_runtime_error)?;
            metrics.update(loss, tokens);

            if let Some(predictions) = model.predict(&batch)? {
                let correct = correct_tokens(&predictions, &batch)?;
                metrics.update_accuracy(correct, tokens);
            }
        }

        Ok(metrics.finalize())
    }
}

fn correct_tokens(predictions: &Tensor, batch: &Batch) -> Result<u64, TrainingError> {
    let hits = predictions
        .to_dtype(DType::U32)
        .and_then(|p| p.eq(&batch.target))
        .and_then(|eq| eq.to_dtype(DType::U32))
        .and_then(|eq| eq.mul(&batch.attention_mask))
        .map_err(to_runtime_error)?;
    scalar_sum(&hits)
}

fn scalar_sum(tensor: &Tensor) -> Result<u64, TrainingError> {
    tensor
        .to_dtype(DType::F64)
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f64>())
        .map(|value| value.round() as u64)
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{BatchList, Example},
        model::{TaggerConfig, TokenRoleTagger},
    };
    use candle_core::Device;

    #[test]
    fn reports_loss_accuracy_and_batch_count() {
        let device = Device::Cpu;
        let model = TokenRoleTagger::new(
            TaggerConfig {
                vocab_size: 8,
                hidden_size: 4,
                num_labels: 2,
                dropout: 0.0,
            },
            &device,
        )
        .unwrap();
        let short = Example {
            input_ids: vec![1, 2],
            target: vec![0, 1],
        };
        let long = Example {
            input_ids: vec![3, 4, 5],
            target: vec![1, 1, 0],
        };
        let batches = vec![
            Batch::from_examples(&[&short, &long], &device).unwrap(),
            Batch::from_examples(&[&long], &device).unwrap(),
        ];
        let mut dev = BatchList::new(batches);

        let record = LossEvaluator::new().evaluate(&model, &mut dev).unwrap();
        assert!(!model.is_training());
        assert_eq!(record.get("batches"), Some(2.0));
        assert_eq!(record.get("tokens"), Some(8.0));
        assert!(record.get("loss").unwrap().is_finite());
        let accuracy = record.get("accuracy").unwrap();
        assert!((0.0..=1.0).contains(&accuracy));
    }
}
