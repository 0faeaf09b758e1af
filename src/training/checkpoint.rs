use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::optimizer::OptimizerState;
use crate::config::TrainConfig;
use crate::model::ModelState;
use crate::utils::io::{self, IoError};

pub const CHECKPOINT_EXTENSION: &str = "pt";

/// Everything needed to resume training or evaluate a trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub model_state: ModelState,
    pub optimizer_state: OptimizerState,
    /// Running mean of the loss at the end of the epoch
    pub loss: Option<f64>,
    /// Running mean of the training accuracy at the end of the epoch
    pub train_accuracy: Option<f64>,
    pub config: TrainConfig,
}

/// Error type for checkpoint operations
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),
    #[error("No checkpoints found in {0}")]
    NoCheckpoints(PathBuf),
}

/// `{dir}/{model}_{dataset}_{epoch}.pt`
pub fn checkpoint_path(dir: impl AsRef<Path>, model: &str, dataset: &str, epoch: usize) -> PathBuf {
    dir.as_ref().join(format!(
        "{}_{}_{}.{}",
        model, dataset, epoch, CHECKPOINT_EXTENSION
    ))
}

/// Saves a checkpoint, creating the directory if needed
pub fn save_checkpoint(
    path: impl AsRef<Path>,
    checkpoint: &Checkpoint,
) -> Result<(), CheckpointError> {
    let path = path.as_ref();
    io::serialize_to_file(path, checkpoint)?;
    info!("Saved checkpoint for epoch {} to {}", checkpoint.epoch, path.display());
    Ok(())
}

pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint, CheckpointError> {
    Ok(io::deserialize_from_file(path)?)
}

/// All checkpoint files in `dir`, sorted by path
pub fn checkpoint_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, CheckpointError> {
    let dir = dir.as_ref();
    let files = io::get_files_with_extension(dir, CHECKPOINT_EXTENSION)?;
    if files.is_empty() {
        return Err(CheckpointError::NoCheckpoints(dir.to_path_buf()));
    }
    Ok(files)
}
