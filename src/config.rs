use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::utils::io::{self, IoError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] IoError),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Numeric precision used for host-side augmentation coefficients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Full,
    Half,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Sgd,
    /// SGD with combined gradient/velocity accumulation; carries a velocity scaling per group
    SgdCombined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduleKind {
    #[default]
    Step,
    Cosine,
    Exponential,
}

/// How far a run goes before it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Train,
    /// Compile the model on the first batch and stop
    CompileOnly,
    /// Run a single training step and stop
    ProfileOnly,
}

/// When the held-out set is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    None,
    /// At the logging cadence of every `validation_frequency`-th epoch
    #[default]
    During,
    /// Once training has finished, on the final model or on every checkpoint
    After,
}

/// An empty path means "no checkpoints"
fn empty_path_as_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let path = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(path.filter(|p| !p.as_os_str().is_empty()))
}

/// Full training configuration. Stored verbatim in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    // --- Run ---
    pub model: String,
    pub dataset: String,
    pub epochs: usize,
    pub seed: Option<u64>,
    pub run_mode: RunMode,

    // --- Batching ---
    pub batch_size: usize,               // micro batch per replica
    pub device_iterations: usize,
    pub gradient_accumulation: usize,
    pub replicas: usize,
    pub precision: Precision,

    // --- Augmentation ---
    pub mixup_enabled: bool,
    pub mixup_alpha: f32,
    pub cutmix_enabled: bool,
    pub cutmix_lambda_low: Option<f32>,
    pub cutmix_lambda_high: Option<f32>,
    pub cutmix_disable_prob: Option<f32>,

    // --- Loss ---
    pub label_smoothing: f32,

    // --- Optimizer ---
    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub momentum: f32,
    pub weight_decay: f32,
    pub initial_loss_scaling: f32,
    pub loss_scaling: f32,               // maximum reached by the doubling schedule
    pub loss_velocity_scaling_ratio: f32,

    // --- LR schedule ---
    pub lr_schedule: LrScheduleKind,
    pub lr_decay: f64,
    pub lr_epoch_decay: Vec<f64>,
    pub warmup_epochs: f64,
    pub lr_scheduler_freq: f64,          // scheduler steps per epoch, 0 = every iteration

    // --- Logging / validation / checkpoints ---
    pub logs_per_epoch: usize,
    pub validation_mode: ValidationMode,
    pub validation_frequency: usize,
    pub disable_metrics: bool,
    pub weight_histogram: bool,
    #[serde(deserialize_with = "empty_path_as_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: "linear".to_string(),
            dataset: "synthetic".to_string(),
            epochs: 10,
            seed: None,
            run_mode: RunMode::Train,
            batch_size: 32,
            device_iterations: 1,
            gradient_accumulation: 1,
            replicas: 1,
            precision: Precision::Full,
            mixup_enabled: false,
            mixup_alpha: 1.0,
            cutmix_enabled: false,
            cutmix_lambda_low: Some(0.0),
            cutmix_lambda_high: Some(1.0),
            cutmix_disable_prob: Some(0.0),
            label_smoothing: 0.0,
            optimizer: OptimizerKind::Sgd,
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
            initial_loss_scaling: 1.0,
            loss_scaling: 1.0,
            loss_velocity_scaling_ratio: 1.0,
            lr_schedule: LrScheduleKind::Step,
            lr_decay: 1.0,
            lr_epoch_decay: Vec::new(),
            warmup_epochs: 0.0,
            lr_scheduler_freq: 0.0,
            logs_per_epoch: 1,
            validation_mode: ValidationMode::During,
            validation_frequency: 1,
            disable_metrics: false,
            weight_histogram: false,
            checkpoint_dir: None,
        }
    }
}

impl TrainConfig {
    /// Loads a JSON configuration; missing fields fall back to defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = io::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of samples the host feeds per training step
    pub fn host_batch_size(&self) -> usize {
        self.batch_size * self.gradient_accumulation * self.replicas * self.device_iterations
    }

    /// Step outputs are summed over device iterations and accumulated micro batches
    pub fn reduction_divisor(&self) -> f64 {
        (self.device_iterations * self.gradient_accumulation) as f64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("device_iterations", self.device_iterations),
            ("gradient_accumulation", self.gradient_accumulation),
            ("replicas", self.replicas),
            ("logs_per_epoch", self.logs_per_epoch),
            ("validation_frequency", self.validation_frequency),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if !(self.initial_loss_scaling > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "initial_loss_scaling must be positive, got {}",
                self.initial_loss_scaling
            )));
        }
        if self.loss_scaling < self.initial_loss_scaling {
            return Err(ConfigError::Invalid(format!(
                "loss_scaling ({}) must not be smaller than initial_loss_scaling ({})",
                self.loss_scaling, self.initial_loss_scaling
            )));
        }
        if !(self.loss_velocity_scaling_ratio > 0.0) {
            return Err(ConfigError::Invalid(
                "loss_velocity_scaling_ratio must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(ConfigError::Invalid(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if self.mixup_enabled && !(self.mixup_alpha > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "mixup_alpha must be positive, got {}",
                self.mixup_alpha
            )));
        }
        if self.lr_scheduler_freq < 0.0 || self.warmup_epochs < 0.0 {
            return Err(ConfigError::Invalid(
                "lr_scheduler_freq and warmup_epochs must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_host_batch_size() {
        let config = TrainConfig {
            batch_size: 4,
            gradient_accumulation: 2,
            replicas: 2,
            device_iterations: 3,
            ..TrainConfig::default()
        };
        assert_eq!(config.host_batch_size(), 48);
        assert_eq!(config.reduction_divisor(), 6.0);
    }

    #[test]
    fn test_rejects_shrinking_loss_scaling() {
        let config = TrainConfig {
            initial_loss_scaling: 128.0,
            loss_scaling: 64.0,
            ..TrainConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_epochs() {
        let config = TrainConfig { epochs: 0, ..TrainConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_partial() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"epochs": 3, "mixup_enabled": true, "mixup_alpha": 0.2, "precision": "half"}"#,
        )
        .unwrap();

        let config = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(config.epochs, 3);
        assert!(config.mixup_enabled);
        assert_eq!(config.precision, Precision::Half);
        assert_eq!(config.batch_size, TrainConfig::default().batch_size);
    }

    #[test]
    fn test_empty_checkpoint_dir_is_none() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"checkpoint_dir": "", "validation_mode": "after"}"#).unwrap();
        assert_eq!(config.checkpoint_dir, None);
        assert_eq!(config.validation_mode, ValidationMode::After);

        let config: TrainConfig = serde_json::from_str(r#"{"checkpoint_dir": "ckpt"}"#).unwrap();
        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("ckpt")));
        let config: TrainConfig = serde_json::from_str(r#"{"checkpoint_dir": null}"#).unwrap();
        assert_eq!(config.checkpoint_dir, None);
    }

    #[test]
    fn test_from_json_file_invalid() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"label_smoothing": 1.5}"#).unwrap();
        assert!(matches!(
            TrainConfig::from_json_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
