pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod evaluation;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod run;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointPayload, CheckpointStore};
pub use config::{DatasetTag, Precision, TrainingConfig, TrainingError};
pub use data::{Batch, BatchList, DataLoader, Example, RoleDataset, ShardSpec, TokenBudgetLoader};
pub use distributed::{init_process_group, DistributedCoordinator, SingleProcess};
pub use evaluation::{Evaluator, LossEvaluator};
pub use logging::{Logger, LoggingSettings};
pub use loss::{LossOutput, MaskedCrossEntropy};
pub use metrics::{ScoreRecord, StepState};
pub use model::{RoleModel, TaggerConfig, TokenRoleTagger};
pub use optimizer::{AdamWConfig, GradientScaler, TrainerOptimizer};
pub use run::{select_device, seed_everything, RunContext};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::{Trainer, TrainingSummary, MAX_TOKEN_DIM};
