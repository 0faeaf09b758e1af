//! Mixup and cutmix batch augmentation.
//!
//! Mixup coefficients are sampled on the host (one per image) and handed to the
//! model with the batch; the cutmix coefficient is sampled next to the model
//! (one per batch). Both techniques compose: mixup first, then cutmix on the
//! mixed images.

pub mod coefficients;
pub mod mixer;

pub use coefficients::{sample_mixup_coefficients, CutmixSampler};
pub use mixer::{Augmenter, CutBox};

use ndarray::Array1;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AugmentError {
    #[error("augmentation needs at least one of mixup or cutmix enabled")]
    NoAugmentation,
    #[error("cutmix requires lambda_low, lambda_high and disable_prob")]
    MissingCutmixParams,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("mixup is enabled but no mixup coefficients were provided")]
    MissingMixupCoefficients,
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

/// Which augmentation techniques are applied to a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Augmentation {
    None,
    Mixup,
    Cutmix,
    Both,
}

impl Augmentation {
    pub fn from_flags(use_mixup: bool, use_cutmix: bool) -> Self {
        match (use_mixup, use_cutmix) {
            (false, false) => Augmentation::None,
            (true, false) => Augmentation::Mixup,
            (false, true) => Augmentation::Cutmix,
            (true, true) => Augmentation::Both,
        }
    }

    pub fn uses_mixup(self) -> bool {
        matches!(self, Augmentation::Mixup | Augmentation::Both)
    }

    pub fn uses_cutmix(self) -> bool {
        matches!(self, Augmentation::Cutmix | Augmentation::Both)
    }
}

/// Coefficients actually applied to one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MixCoefficients {
    /// Per-image mixup coefficient, each in [0.5, 1.0]
    pub mixup: Option<Array1<f32>>,
    /// Fraction of image area kept from the original image
    pub cutmix: Option<f32>,
}

/// Parallel label branches and per-sample weights; the loss is the weighted
/// sum of the per-branch losses.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMix {
    pub labels: Vec<Array1<usize>>,
    pub weights: Vec<Array1<f32>>,
}

impl LabelMix {
    /// Unmixed labels: a single branch with weight one.
    pub fn single(labels: Array1<usize>) -> Self {
        let weights = Array1::ones(labels.len());
        Self {
            labels: vec![labels],
            weights: vec![weights],
        }
    }

    pub fn num_branches(&self) -> usize {
        self.labels.len()
    }

    /// Sum of branch weights for each sample (one for a well-formed mix)
    pub fn total_weight(&self) -> Array1<f32> {
        let n = self.labels.first().map_or(0, |l| l.len());
        self.weights
            .iter()
            .fold(Array1::zeros(n), |acc, w| acc + w)
    }
}
