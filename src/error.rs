use thiserror::Error;

use crate::augment::AugmentError;
use crate::config::ConfigError;
use crate::model::ModelError;
use crate::training::checkpoint::CheckpointError;
use crate::training::dataset::DatasetError;
use crate::training::distributed::DistributedError;
use crate::training::optimizer::OptimizerError;
use crate::training::schedule::ScheduleError;
use crate::utils::io::IoError;
use crate::utils::math::MathError;

#[derive(Error, Debug)]
pub enum MixTrainError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    #[error("Augmentation error: {0}")]
    Augment(#[from] AugmentError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("Math error: {0}")]
    Math(#[from] MathError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Training error: {0}")]
    Training(String),
}

pub type Result<T> = std::result::Result<T, MixTrainError>;
