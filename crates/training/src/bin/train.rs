use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use role_training::{
    data::DataLoader, init_process_group, select_device, seed_everything, DatasetTag,
    RoleDataset, ShardSpec, TaggerConfig, TokenBudgetLoader, TokenRoleTagger, Trainer,
    TrainingConfig, TrainingError,
};

const PRETRAINED_WEIGHTS_FILENAME: &str = "model.safetensors";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Semantic-role prediction training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Base configuration (TOML or JSON); flags below override it"
    )]
    config: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_name = "TAG", help = "conll2005, conll2009 or conll2012")]
    dataset_tag: Option<DatasetTag>,

    #[arg(long, value_name = "PATH")]
    train_path: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    dev_path: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pretrained_model_name_or_path: Option<String>,

    #[arg(long, help = "Token budget per batch")]
    max_tokens: Option<usize>,

    #[arg(long)]
    max_epochs: Option<usize>,

    #[arg(long, help = "Fraction of total steps used for warmup; 0 disables the scheduler")]
    warmup_ratio: Option<f64>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    dropout: Option<f32>,

    #[arg(long)]
    weight_decay: Option<f64>,

    #[arg(long)]
    max_grad_norm: Option<f64>,

    #[arg(long, help = "Train with dynamic loss scaling in reduced precision")]
    amp: bool,

    #[arg(long, allow_hyphen_values = true, help = "-1 for a single-process run")]
    local_rank: Option<i64>,

    #[arg(long, help = "Evaluate on the dev set before training and after every epoch")]
    eval: bool,

    #[arg(long)]
    tensorboard: bool,

    #[arg(long, help = "Write a checkpoint after every epoch")]
    save: bool,

    #[arg(long, value_name = "SECONDS")]
    tqdm_mininterval: Option<f64>,

    #[arg(long, value_name = "DIR")]
    checkpoint_root: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    log_root: Option<PathBuf>,

    #[arg(long, default_value_t = 256, help = "Hidden size of the baseline tagger")]
    hidden_size: usize,
}

impl Args {
    fn into_config(self) -> Result<(TrainingConfig, usize), TrainingError> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => {
                let (Some(tag), Some(train_path)) = (self.dataset_tag, self.train_path.clone())
                else {
                    return Err(TrainingError::validation(vec![
                        "--dataset-tag and --train-path are required without --config"
                            .to_string(),
                    ]));
                };
                TrainingConfig::new(tag, train_path)
            }
        };

        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(tag) = self.dataset_tag {
            config.dataset_tag = tag;
        }
        if let Some(path) = self.train_path {
            config.train_path = path;
        }
        if self.dev_path.is_some() {
            config.dev_path = self.dev_path;
        }
        if self.pretrained_model_name_or_path.is_some() {
            config.pretrained_model_name_or_path = self.pretrained_model_name_or_path;
        }
        if let Some(value) = self.max_tokens {
            config.max_tokens = value;
        }
        if let Some(value) = self.max_epochs {
            config.max_epochs = value;
        }
        if let Some(value) = self.warmup_ratio {
            config.warmup_ratio = value;
        }
        if let Some(value) = self.lr {
            config.lr = value;
        }
        if let Some(value) = self.dropout {
            config.dropout = value;
        }
        if let Some(value) = self.weight_decay {
            config.weight_decay = value;
        }
        if let Some(value) = self.max_grad_norm {
            config.max_grad_norm = value;
        }
        if let Some(value) = self.local_rank {
            config.local_rank = value;
        }
        if let Some(value) = self.tqdm_mininterval {
            config.tqdm_mininterval = value;
        }
        if let Some(dir) = self.checkpoint_root {
            config.checkpoint_root = dir;
        }
        if let Some(dir) = self.log_root {
            config.log_root = dir;
        }
        config.amp |= self.amp;
        config.eval |= self.eval;
        config.tensorboard |= self.tensorboard;
        config.save |= self.save;

        config.validate()?;
        Ok((config, self.hidden_size))
    }
}

fn run() -> Result<(), TrainingError> {
    let (config, hidden_size) = Args::parse().into_config()?;

    let device = select_device(config.local_rank)?;
    seed_everything(&device, config.seed);
    let coordinator = init_process_group(&config)?;
    let shard = coordinator.is_distributed().then(|| ShardSpec {
        rank: coordinator.rank() as usize,
        world_size: coordinator.world_size(),
    });

    let train_set = RoleDataset::load(&config.train_path)?;
    let dev_set = match &config.dev_path {
        Some(path) if config.eval => Some(RoleDataset::load(path)?),
        _ => None,
    };
    log::info!(
        "loaded {} training examples{}",
        train_set.len(),
        dev_set
            .as_ref()
            .map(|dev| format!(", {} dev examples", dev.len()))
            .unwrap_or_default()
    );

    let tagger_config = TaggerConfig {
        vocab_size: dev_set
            .iter()
            .map(RoleDataset::vocab_size)
            .fold(train_set.vocab_size(), usize::max),
        hidden_size,
        num_labels: dev_set
            .iter()
            .map(RoleDataset::num_labels)
            .fold(train_set.num_labels(), usize::max),
        dropout: config.dropout,
    };
    let mut model = TokenRoleTagger::new(tagger_config, &device)?;
    if let Some(source) = &config.pretrained_model_name_or_path {
        model.load_pretrained(&pretrained_weights(Path::new(source)))?;
    }

    let mut train = TokenBudgetLoader::new(
        train_set,
        config.max_tokens,
        true,
        config.seed,
        shard,
        device.clone(),
    )?;
    let mut dev = dev_set
        .map(|set| TokenBudgetLoader::new(set, config.max_tokens, false, config.seed, None, device))
        .transpose()?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let mut trainer = Trainer::new(config, model)?.with_coordinator(coordinator);
    let summary = trainer.run_with_shutdown(
        &mut train,
        dev.as_mut().map(|loader| loader as &mut dyn DataLoader),
        || shutdown_flag.load(Ordering::Relaxed),
    )?;

    log::info!(
        "finished: {} batches trained, {} skipped, {} optimizer steps, {} checkpoints{}",
        summary.processed_batches,
        summary.skipped_batches,
        summary.optimizer_steps,
        summary.checkpoints.len(),
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}

/// A directory is expected to hold `model.safetensors`.
fn pretrained_weights(source: &Path) -> PathBuf {
    if source.is_dir() {
        source.join(PRETRAINED_WEIGHTS_FILENAME)
    } else {
        source.to_path_buf()
    }
}
