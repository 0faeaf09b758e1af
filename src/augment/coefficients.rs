use half::f16;
use ndarray::Array1;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::Beta;

use super::AugmentError;
use crate::config::Precision;

/// Samples one mixup coefficient per image from Beta(alpha, alpha).
///
/// Each sample `x` is reflected to `max(x, 1 - x)`, so the original image is
/// always the foreground image. Since the partner is the image rolled by one
/// position, every image is once a foreground and once a background image
/// within the batch.
pub fn sample_mixup_coefficients<R: Rng + ?Sized>(
    alpha: f32,
    batch_size: usize,
    precision: Precision,
    rng: &mut R,
) -> Result<Array1<f32>, AugmentError> {
    if !(alpha > 0.0) || !alpha.is_finite() {
        return Err(AugmentError::InvalidParameter(format!(
            "mixup alpha must be positive and finite, got {}",
            alpha
        )));
    }
    let beta = Beta::new(alpha as f64, alpha as f64)
        .map_err(|e| AugmentError::InvalidParameter(e.to_string()))?;

    let coefficients: Array1<f32> = (0..batch_size)
        .map(|_| {
            let x = beta.sample(rng) as f32;
            let x = x.max(1.0 - x);
            match precision {
                Precision::Full => x,
                Precision::Half => f16::from_f32(x).to_f32(),
            }
        })
        .collect();
    Ok(coefficients)
}

#[derive(Debug, Clone)]
enum Lambda {
    Constant(f32),
    Uniform(Uniform<f32>),
}

/// Draws the per-batch cutmix coefficient (fraction of area kept).
#[derive(Debug, Clone)]
pub struct CutmixSampler {
    lambda: Lambda,
    disable_prob: f32,
}

impl CutmixSampler {
    pub fn new(low: f32, high: f32, disable_prob: f32) -> Result<Self, AugmentError> {
        if !(0.0 <= low && low <= high && high <= 1.0) {
            return Err(AugmentError::InvalidParameter(format!(
                "cutmix lambda bounds must satisfy 0 <= low <= high <= 1, got [{}, {}]",
                low, high
            )));
        }
        if !(0.0..=1.0).contains(&disable_prob) {
            return Err(AugmentError::InvalidParameter(format!(
                "cutmix disable probability must be in [0, 1], got {}",
                disable_prob
            )));
        }

        let lambda = if low == high {
            Lambda::Constant(low)
        } else {
            Lambda::Uniform(Uniform::new(low, high))
        };
        Ok(Self { lambda, disable_prob })
    }

    /// Builds a sampler from optional hyperparameters; all three must be present.
    pub fn from_params(
        low: Option<f32>,
        high: Option<f32>,
        disable_prob: Option<f32>,
    ) -> Result<Self, AugmentError> {
        match (low, high, disable_prob) {
            (Some(low), Some(high), Some(disable_prob)) => Self::new(low, high, disable_prob),
            _ => Err(AugmentError::MissingCutmixParams),
        }
    }

    pub fn disable_prob(&self) -> f32 {
        self.disable_prob
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        let coeff = match &self.lambda {
            Lambda::Constant(c) => *c,
            Lambda::Uniform(u) => u.sample(rng),
        };
        self.maybe_disable(coeff, rng.gen::<f32>())
    }

    /// Forces the coefficient to 1.0 (cutmix is a no-op) when `draw < disable_prob`
    pub fn maybe_disable(&self, coeff: f32, draw: f32) -> f32 {
        if draw < self.disable_prob {
            1.0
        } else {
            coeff
        }
    }
}
