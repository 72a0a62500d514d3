use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// What one processed batch reports to the sinks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepState {
    pub epoch: usize,
    /// `epoch * batches_per_epoch + index`; skipped batches keep their slot.
    pub global_step: usize,
    pub loss: f64,
    /// Pre-clip gradient norm; `0.0` when no parameter received a gradient.
    pub grad_norm: f64,
    /// Rate the optimizer step used.
    pub learning_rate: f64,
    pub applied: bool,
}

/// Evaluation scores keyed by metric name, ordered for stable output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord(BTreeMap<String, f64>);

impl ScoreRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: impl Into<String>, value: f64) {
        self.0.insert(metric.into(), value);
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for ScoreRecord {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ScoreRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value:.4}")?;
            first = false;
        }
        Ok(())
    }
}

/// Token-weighted loss and accuracy accumulated over a dev stream.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    token_count: u64,
    correct_tokens: u64,
    scored_tokens: u64,
    batches: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, tokens: u64) {
        self.loss_sum += loss * tokens as f64;
        self.token_count += tokens;
        self.batches += 1;
    }

    pub fn update_accuracy(&mut self, correct: u64, tokens: u64) {
        self.correct_tokens += correct;
        self.scored_tokens += tokens;
    }

    pub fn finalize(self) -> ScoreRecord {
        let mut record = ScoreRecord::new();
        record.insert("batches", self.batches as f64);
        if self.token_count > 0 {
            record.insert("loss", self.loss_sum / self.token_count as f64);
            record.insert("tokens", self.token_count as f64);
        }
        if self.scored_tokens > 0 {
            record.insert(
                "accuracy",
                self.correct_tokens as f64 / self.scored_tokens as f64,
            );
        }
        record
    }
}
