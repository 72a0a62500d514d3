use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

const CACHED_EXAMPLES_FILENAME: &str = "examples.jsonl";
const PAD_TOKEN_ID: u32 = 0;
const PAD_LABEL_ID: u32 = 0;

/// One padded step worth of examples.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub target: Tensor,
}

impl Batch {
    /// Builds a batch, rejecting tensors whose batch dimensions disagree.
    pub fn new(input_ids: Tensor, attention_mask: Tensor, target: Tensor) -> Result<Self> {
        let ids = input_ids.dims();
        if ids.len() != 2 {
            return Err(TrainingError::runtime(format!(
                "input_ids must be [batch, seq], got {:?}",
                ids
            )));
        }
        for (name, tensor) in [("attention_mask", &attention_mask), ("target", &target)] {
            if tensor.dims().first() != ids.first() {
                return Err(TrainingError::runtime(format!(
                    "{} leading dimension {:?} does not match input_ids {:?}",
                    name,
                    tensor.dims(),
                    ids
                )));
            }
        }
        Ok(Self {
            input_ids,
            attention_mask,
            target,
        })
    }

    /// Pads `examples` to the longest sequence and materializes the tensors.
    pub fn from_examples(examples: &[&Example], device: &Device) -> Result<Self> {
        if examples.is_empty() {
            return Err(TrainingError::runtime("cannot build an empty batch"));
        }
        let seq_len = examples.iter().map(|ex| ex.len()).max().unwrap_or(0).max(1);
        let rows = examples.len();

        let mut ids = Vec::with_capacity(rows * seq_len);
        let mut mask = Vec::with_capacity(rows * seq_len);
        let mut labels = Vec::with_capacity(rows * seq_len);
        for example in examples {
            for idx in 0..seq_len {
                match (example.input_ids.get(idx), example.target.get(idx)) {
                    (Some(&token), Some(&label)) => {
                        ids.push(token);
                        mask.push(1u32);
                        labels.push(label);
                    }
                    _ => {
                        ids.push(PAD_TOKEN_ID);
                        mask.push(0u32);
                        labels.push(PAD_LABEL_ID);
                    }
                }
            }
        }

        let shape = (rows, seq_len);
        let input_ids = Tensor::from_vec(ids, shape, device).map_err(to_runtime_error)?;
        let attention_mask = Tensor::from_vec(mask, shape, device).map_err(to_runtime_error)?;
        let target = Tensor::from_vec(labels, shape, device).map_err(to_runtime_error)?;
        Self::new(input_ids, attention_mask, target)
    }

    /// Length of the token dimension (last axis of `input_ids`).
    pub fn token_dim(&self) -> usize {
        self.input_ids.dims().last().copied().unwrap_or(0)
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

/// Finite, epoch-restartable batch source.
pub trait DataLoader: Send {
    /// Number of batches one epoch yields on this rank.
    fn num_batches(&self) -> usize;

    /// Restarts iteration for `epoch`; orderings are deterministic per epoch.
    fn set_epoch(&mut self, epoch: usize);

    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// Pre-built batches replayed in order every epoch.
#[derive(Debug, Clone)]
pub struct BatchList {
    batches: Vec<Batch>,
    cursor: usize,
}

impl BatchList {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl DataLoader for BatchList {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn set_epoch(&mut self, _epoch: usize) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }
}

/// A pre-tokenized sentence with one gold role label per token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub input_ids: Vec<u32>,
    pub target: Vec<u32>,
}

impl Example {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Cached role-prediction examples, one JSON object per line.
#[derive(Debug, Clone, Default)]
pub struct RoleDataset {
    examples: Vec<Example>,
}

impl RoleDataset {
    pub fn new(examples: Vec<Example>) -> Result<Self> {
        for (idx, example) in examples.iter().enumerate() {
            if example.is_empty() {
                return Err(TrainingError::initialization(format!(
                    "example {} has no tokens",
                    idx
                )));
            }
            if example.input_ids.len() != example.target.len() {
                return Err(TrainingError::initialization(format!(
                    "example {} has {} tokens but {} labels",
                    idx,
                    example.input_ids.len(),
                    example.target.len()
                )));
            }
        }
        Ok(Self { examples })
    }

    /// Reads a cached JSON-lines file, or `examples.jsonl` inside a cache directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = resolve_cache_path(path.as_ref());
        let file = File::open(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to open dataset {}: {err}",
                path.display()
            ))
        })?;

        let mut examples = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(&line).map_err(|err| {
                TrainingError::initialization(format!(
                    "{}:{}: invalid example: {err}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            examples.push(example);
        }

        if examples.is_empty() {
            return Err(TrainingError::initialization(format!(
                "dataset {} contains no examples",
                path.display()
            )));
        }

        Self::new(examples)
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    /// Largest token id + 1, the minimum vocabulary a model needs.
    pub fn vocab_size(&self) -> usize {
        self.max_id(|ex| &ex.input_ids)
    }

    /// Largest role label + 1.
    pub fn num_labels(&self) -> usize {
        self.max_id(|ex| &ex.target)
    }

    fn max_id(&self, field: impl Fn(&Example) -> &Vec<u32>) -> usize {
        self.examples
            .iter()
            .flat_map(|ex| field(ex).iter().copied())
            .max()
            .map_or(1, |id| id as usize + 1)
    }
}

fn resolve_cache_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CACHED_EXAMPLES_FILENAME)
    } else {
        path.to_path_buf()
    }
}

/// Rank slice of a distributed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub world_size: usize,
}

/// Groups examples of similar length so that `rows * longest <= max_tokens`.
pub struct TokenBudgetLoader {
    dataset: RoleDataset,
    device: Device,
    batches: Vec<Vec<usize>>,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    seed: u64,
    shard: Option<ShardSpec>,
}

impl TokenBudgetLoader {
    pub fn new(
        dataset: RoleDataset,
        max_tokens: usize,
        shuffle: bool,
        seed: u64,
        shard: Option<ShardSpec>,
        device: Device,
    ) -> Result<Self> {
        if max_tokens == 0 {
            return Err(TrainingError::initialization(
                "max_tokens must be greater than zero",
            ));
        }
        if let Some(spec) = shard {
            if spec.world_size == 0 || spec.rank >= spec.world_size {
                return Err(TrainingError::initialization(format!(
                    "invalid shard rank {} for world size {}",
                    spec.rank, spec.world_size
                )));
            }
        }

        let batches = pack_by_token_budget(dataset.examples(), max_tokens);
        let mut loader = Self {
            dataset,
            device,
            batches,
            order: Vec::new(),
            cursor: 0,
            shuffle,
            seed,
            shard,
        };
        loader.set_epoch(0);
        Ok(loader)
    }

    fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.batches.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        let Some(spec) = self.shard else {
            return order;
        };
        if order.is_empty() {
            return order;
        }

        // every rank must see the same number of batches, so wrap around
        let per_rank = order.len().div_ceil(spec.world_size);
        let total = per_rank * spec.world_size;
        let padded: Vec<usize> = order.iter().copied().cycle().take(total).collect();
        padded
            .into_iter()
            .skip(spec.rank)
            .step_by(spec.world_size)
            .collect()
    }
}

impl DataLoader for TokenBudgetLoader {
    fn num_batches(&self) -> usize {
        self.order.len()
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.order = self.epoch_order(epoch);
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let Some(&batch_idx) = self.order.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;

        let examples: Vec<&Example> = self.batches[batch_idx]
            .iter()
            .map(|&idx| &self.dataset.examples()[idx])
            .collect();
        Batch::from_examples(&examples, &self.device).map(Some)
    }
}

fn pack_by_token_budget(examples: &[Example], max_tokens: usize) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..examples.len()).collect();
    indices.sort_by_key(|&idx| examples[idx].len());

    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut longest = 0usize;
    for idx in indices {
        let len = examples[idx].len();
        let next_longest = longest.max(len);
        if !current.is_empty() && next_longest * (current.len() + 1) > max_tokens {
            batches.push(std::mem::take(&mut current));
            longest = 0;
        }
        longest = longest.max(len);
        current.push(idx);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn example(len: usize) -> Example {
        Example {
            input_ids: (1..=len as u32).collect(),
            target: vec![1; len],
        }
    }

    fn dataset(lengths: &[usize]) -> RoleDataset {
        RoleDataset::new(lengths.iter().map(|&len| example(len)).collect()).unwrap()
    }

    fn drain(loader: &mut impl DataLoader) -> Vec<Batch> {
        let mut out = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            out.push(batch);
        }
        out
    }

    #[test]
    fn batch_rejects_mismatched_leading_dimension() {
        let device = Device::Cpu;
        let ids = Tensor::zeros((2, 4), candle_core::DType::U32, &device).unwrap();
        let mask = Tensor::zeros((3, 4), candle_core::DType::U32, &device).unwrap();
        let target = Tensor::zeros((2, 4), candle_core::DType::U32, &device).unwrap();
        assert!(Batch::new(ids, mask, target).is_err());
    }

    #[test]
    fn from_examples_pads_and_masks() {
        let a = example(3);
        let b = example(1);
        let batch = Batch::from_examples(&[&a, &b], &Device::Cpu).unwrap();
        assert_eq!(batch.token_dim(), 3);
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>().unwrap(),
            vec![vec![1, 1, 1], vec![1, 0, 0]]
        );
        assert_eq!(
            batch.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![1, 2, 3], vec![1, 0, 0]]
        );
    }

    #[test]
    fn packing_respects_token_budget() {
        let examples: Vec<Example> = [2, 2, 3, 3, 8].iter().map(|&len| example(len)).collect();
        let batches = pack_by_token_budget(&examples, 8);
        for batch in &batches {
            let longest = batch.iter().map(|&idx| examples[idx].len()).max().unwrap();
            assert!(longest * batch.len() <= 8 || batch.len() == 1);
        }
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, examples.len());
    }

    #[test]
    fn set_epoch_restarts_with_a_deterministic_order() {
        let data = dataset(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut loader = TokenBudgetLoader::new(data, 4, true, 7, None, Device::Cpu).unwrap();

        loader.set_epoch(3);
        let first: Vec<usize> = drain(&mut loader).iter().map(Batch::token_dim).collect();
        loader.set_epoch(3);
        let again: Vec<usize> = drain(&mut loader).iter().map(Batch::token_dim).collect();
        assert_eq!(first, again);
        assert_eq!(first.len(), loader.num_batches());
    }

    #[test]
    fn shards_have_equal_length_and_cover_every_batch() {
        let data = dataset(&[5, 5, 5, 5, 5]);
        let mut seen = Vec::new();
        let mut counts = Vec::new();
        for rank in 0..2 {
            let shard = ShardSpec {
                rank,
                world_size: 2,
            };
            let mut loader =
                TokenBudgetLoader::new(data.clone(), 5, false, 0, Some(shard), Device::Cpu)
                    .unwrap();
            counts.push(loader.num_batches());
            seen.extend(loader.order.clone());
            drain(&mut loader);
        }
        assert_eq!(counts, vec![3, 3]);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn loads_cached_directory() {
        let tmp = tempdir().unwrap();
        let lines = [example(2), example(4)]
            .iter()
            .map(|ex| serde_json::to_string(ex).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(tmp.path().join(CACHED_EXAMPLES_FILENAME), lines).unwrap();

        let data = RoleDataset::load(tmp.path()).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.vocab_size(), 5);
        assert_eq!(data.num_labels(), 2);
    }

    #[test]
    fn rejects_label_count_mismatch() {
        let bad = Example {
            input_ids: vec![1, 2],
            target: vec![1],
        };
        assert!(RoleDataset::new(vec![bad]).is_err());
    }
}
