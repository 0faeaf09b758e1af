//! Training loop and its collaborators

pub mod checkpoint;
pub mod dataset;
pub mod distributed;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod schedule;
pub mod trainer;

// Re-export main components
pub use checkpoint::{checkpoint_files, checkpoint_path, load_checkpoint, save_checkpoint, Checkpoint};
pub use dataset::{Batch, BatchSource, Dataset};
pub use distributed::{Distributed, SingleProcess};
pub use loss::{accuracy, classification_loss, LossOutput};
pub use metrics::{JsonLinesSink, LogSink, Metrics, MetricsSink, TrainResults};
pub use model::{AugmentedBatch, ClassifierWithLoss, DatasetValidator, StepOutput, TrainingModel, Validator};
pub use optimizer::{Optimizer, OptimizerState, ParamGroup, Sgd};
pub use schedule::{LossScalingSchedule, LrScheduler};
pub use trainer::{validate_checkpoints, TrainOutcome, Trainer, TrainingState, TrainingSummary};
