pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointManager, CheckpointRecord, CHECKPOINT_VERSION};
pub use config::{ModelKind, TrainingConfig, TrainingError};
pub use data::{get_dataloaders, Batch, DataLoader, DataLoaders, LoaderSettings, PairedDataset, Split};
pub use logging::{Logger, LoggingSettings};
pub use metrics::{EvaluationSummary, LossHistory};
pub use optimizer::{OptimizerConfig, OptimizerState, TrainerOptimizer};
pub use scheduler::{LRScheduler, SchedulerConfig, StepDecay};
pub use trainer::{ForwardTrainer, GanTrainer, RunSummary, Trainer};
