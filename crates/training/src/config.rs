use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Immutable snapshot of every knob a training run reads.
///
/// Built once at startup (from the CLI or from a persisted `args` file) and
/// only ever borrowed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub dataset_tag: DatasetTag,
    pub train_path: PathBuf,
    #[serde(default)]
    pub dev_path: Option<PathBuf>,
    #[serde(default)]
    pub pretrained_model_name_or_path: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    #[serde(default = "default_learning_rate")]
    pub lr: f64,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default)]
    pub amp: bool,
    #[serde(default = "default_local_rank")]
    pub local_rank: i64,
    #[serde(default)]
    pub eval: bool,
    #[serde(default)]
    pub tensorboard: bool,
    #[serde(default)]
    pub save: bool,
    #[serde(default = "default_tqdm_mininterval")]
    pub tqdm_mininterval: f64,
    #[serde(default = "default_checkpoint_root")]
    pub checkpoint_root: PathBuf,
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
}

impl TrainingConfig {
    /// Config with every optional knob at its default.
    pub fn new(dataset_tag: DatasetTag, train_path: impl Into<PathBuf>) -> Self {
        Self {
            seed: default_seed(),
            dataset_tag,
            train_path: train_path.into(),
            dev_path: None,
            pretrained_model_name_or_path: None,
            max_tokens: default_max_tokens(),
            max_epochs: default_max_epochs(),
            warmup_ratio: default_warmup_ratio(),
            lr: default_learning_rate(),
            dropout: default_dropout(),
            weight_decay: default_weight_decay(),
            max_grad_norm: default_max_grad_norm(),
            amp: false,
            local_rank: default_local_rank(),
            eval: false,
            tensorboard: false,
            save: false,
            tqdm_mininterval: default_tqdm_mininterval(),
            checkpoint_root: default_checkpoint_root(),
            log_root: default_log_root(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") | Some("tml") => toml::from_str(&contents)?,
            // the persisted `args` file has no extension and is JSON
            Some("json") | None => serde_json::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.train_path.as_os_str().is_empty() {
            errors.push("train_path must not be empty".to_string());
        }

        if self.max_tokens == 0 {
            errors.push("max_tokens must be greater than 0".to_string());
        }

        if self.max_epochs == 0 {
            errors.push("max_epochs must be greater than 0".to_string());
        }

        if !(self.lr > 0.0) {
            errors.push("lr must be greater than 0".to_string());
        }

        if self.weight_decay < 0.0 {
            errors.push("weight_decay must be >= 0".to_string());
        }

        if !(0.0..1.0).contains(&self.dropout) {
            errors.push(format!("dropout must be in [0, 1) (got {})", self.dropout));
        }

        if !(self.max_grad_norm > 0.0) {
            errors.push("max_grad_norm must be greater than 0".to_string());
        }

        if self.warmup_ratio > 1.0 {
            errors.push("warmup_ratio cannot exceed 1".to_string());
        }

        if self.local_rank < -1 {
            errors.push("local_rank must be -1 (disabled) or a non-negative rank".to_string());
        }

        if self.tqdm_mininterval < 0.0 {
            errors.push("tqdm_mininterval must be >= 0".to_string());
        }

        if self.eval && self.dev_path.is_none() {
            errors.push("eval requires dev_path".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    pub fn precision(&self) -> Precision {
        if self.amp {
            Precision::Scaled
        } else {
            Precision::Exact
        }
    }

    pub fn scheduler_enabled(&self) -> bool {
        self.warmup_ratio > 0.0
    }

    pub fn is_distributed(&self) -> bool {
        self.local_rank != -1
    }

    /// Rank 0 and single-process runs own every side-effecting write.
    pub fn is_primary(&self) -> bool {
        self.local_rank < 1
    }

    /// Hex sha256 of the canonical JSON form; stamped into every checkpoint.
    pub fn fingerprint(&self) -> Result<String, TrainingError> {
        let json = serde_json::to_vec(self)
            .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
        Ok(hex::encode(Sha256::digest(json)))
    }

    /// Numeric view of the config, used as TensorBoard hyper-parameters.
    pub fn numeric_hparams(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("seed", self.seed as f64),
            ("max_tokens", self.max_tokens as f64),
            ("max_epochs", self.max_epochs as f64),
            ("warmup_ratio", self.warmup_ratio),
            ("lr", self.lr),
            ("dropout", self.dropout as f64),
            ("weight_decay", self.weight_decay),
            ("max_grad_norm", self.max_grad_norm),
            ("amp", if self.amp { 1.0 } else { 0.0 }),
        ]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatasetTag {
    Conll2005,
    Conll2009,
    Conll2012,
}

impl DatasetTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetTag::Conll2005 => "conll2005",
            DatasetTag::Conll2009 => "conll2009",
            DatasetTag::Conll2012 => "conll2012",
        }
    }
}

impl fmt::Display for DatasetTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetTag {
    type Err = TrainingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "conll2005" => Ok(DatasetTag::Conll2005),
            "conll2009" => Ok(DatasetTag::Conll2009),
            "conll2012" => Ok(DatasetTag::Conll2012),
            other => Err(TrainingError::validation(vec![format!(
                "unsupported dataset_tag '{}' (expected conll2005, conll2009 or conll2012)",
                other
            )])),
        }
    }
}

/// Numeric mode of the forward/backward pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Full fp32 loss and gradients, no loss scaling.
    Exact,
    /// Reduced-precision forward with dynamic loss scaling.
    Scaled,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Exact
    }
}

fn default_seed() -> u64 {
    0
}

fn default_max_tokens() -> usize {
    2_048
}

fn default_max_epochs() -> usize {
    5
}

fn default_warmup_ratio() -> f64 {
    -1.0
}

fn default_learning_rate() -> f64 {
    2e-5
}

fn default_dropout() -> f32 {
    0.1
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_max_grad_norm() -> f64 {
    1.0
}

fn default_local_rank() -> i64 {
    -1
}

fn default_tqdm_mininterval() -> f64 {
    1.0
}

fn default_checkpoint_root() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_log_root() -> PathBuf {
    PathBuf::from("./logs")
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Distributed(String),
    Persistence(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn distributed(message: impl Into<String>) -> Self {
        Self::Distributed(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Distributed(msg) => write!(f, "distributed setup failed: {}", msg),
            TrainingError::Persistence(msg) => write!(f, "checkpoint persistence failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_)
            | TrainingError::Runtime(_)
            | TrainingError::Distributed(_)
            | TrainingError::Persistence(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_disable_scheduler_and_distribution() {
        let config = TrainingConfig::new(DatasetTag::Conll2012, "train.json");
        assert!(!config.scheduler_enabled());
        assert!(!config.is_distributed());
        assert!(config.is_primary());
        assert_eq!(config.precision(), Precision::Exact);
        config.validate().unwrap();
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut config = TrainingConfig::new(DatasetTag::Conll2005, "train.json");
        config.max_epochs = 0;
        config.lr = 0.0;
        config.eval = true;
        config.local_rank = -3;

        let err = config.validate().unwrap_err();
        match err {
            TrainingError::Validation(messages) => {
                assert_eq!(messages.len(), 4, "{:?}", messages);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rank_zero_is_primary_but_rank_one_is_not() {
        let mut config = TrainingConfig::new(DatasetTag::Conll2009, "train.json");
        config.local_rank = 0;
        assert!(config.is_distributed());
        assert!(config.is_primary());
        config.local_rank = 1;
        assert!(!config.is_primary());
    }

    #[test]
    fn persisted_args_round_trip_through_from_path() {
        let tmp = tempdir().unwrap();
        let mut config = TrainingConfig::new(DatasetTag::Conll2012, "train.json");
        config.amp = true;
        config.warmup_ratio = 0.1;
        let path = tmp.path().join("args");
        fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.fingerprint().unwrap(), config.fingerprint().unwrap());
    }

    #[test]
    fn toml_fills_in_defaults() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("run.toml");
        fs::write(
            &path,
            "dataset_tag = \"conll2005\"\ntrain_path = \"data/train\"\nlr = 3e-5\n",
        )
        .unwrap();

        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.dataset_tag, DatasetTag::Conll2005);
        assert_eq!(config.lr, 3e-5);
        assert_eq!(config.max_tokens, 2_048);
        assert_eq!(config.local_rank, -1);
    }

    #[test]
    fn dataset_tag_parses_case_insensitively() {
        assert_eq!(
            "CoNLL2012".parse::<DatasetTag>().unwrap(),
            DatasetTag::Conll2012
        );
        assert!("ontonotes".parse::<DatasetTag>().is_err());
    }
}
