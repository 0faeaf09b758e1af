use ndarray::{Array1, Array2, ArrayView2};

use crate::augment::LabelMix;
use crate::utils::math::{argmax_rows, check_rows, log_softmax_rows, softmax_rows, MathError};

/// Loss terms of one step plus the gradient of `loss` w.r.t. the logits
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f32,
    pub classification_loss: f32,
    pub smoothing_loss: Option<f32>,
    pub grad_logits: Array2<f32>,
}

impl LossOutput {
    /// Sub-losses in reporting order: classification, then smoothing if enabled
    pub fn sublosses(&self) -> Vec<f32> {
        let mut sublosses = vec![self.classification_loss];
        sublosses.extend(self.smoothing_loss);
        sublosses
    }
}

fn check_labels(labels: &Array1<usize>, rows: usize, classes: usize) -> Result<(), MathError> {
    if labels.len() != rows {
        return Err(MathError::DimensionMismatch(format!(
            "Expected {} labels, got {}",
            rows,
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(MathError::DimensionMismatch(format!(
            "label {} out of range for {} classes",
            bad, classes
        )));
    }
    Ok(())
}

/// Weighted negative log-likelihood: the sum over label branches of the
/// batch mean of `weight * -log_pred[label]`.
pub fn weighted_nll_loss(log_preds: ArrayView2<f32>, mix: &LabelMix) -> Result<f32, MathError> {
    let (rows, classes) = log_preds.dim();
    let mut loss = 0.0f32;
    for (labels, weights) in mix.labels.iter().zip(&mix.weights) {
        check_labels(labels, rows, classes)?;
        check_rows(log_preds, weights.len())?;
        let branch: f32 = labels
            .iter()
            .zip(weights.iter())
            .enumerate()
            .map(|(i, (&label, &w))| -w * log_preds[[i, label]])
            .sum();
        loss += branch / rows.max(1) as f32;
    }
    Ok(loss)
}

/// Classification loss with optional label smoothing.
///
/// `classification_loss = (1 - s) * nll` and `smoothing_loss = -mean(log_preds) * s`,
/// where the mean runs over every class of every sample.
pub fn classification_loss(
    logits: ArrayView2<f32>,
    mix: &LabelMix,
    label_smoothing: f32,
) -> Result<LossOutput, MathError> {
    let (rows, classes) = logits.dim();
    if rows == 0 || classes == 0 {
        return Err(MathError::DimensionMismatch("empty logits".to_string()));
    }
    let log_preds = log_softmax_rows(logits);
    let nll = weighted_nll_loss(log_preds.view(), mix)?;
    let classification_loss = (1.0 - label_smoothing) * nll;

    let smoothing_loss = if label_smoothing > 0.0 {
        let mean_log_pred = log_preds.mean().unwrap_or(0.0);
        Some(-mean_log_pred * label_smoothing)
    } else {
        None
    };
    let loss = classification_loss + smoothing_loss.unwrap_or(0.0);
    if !loss.is_finite() {
        return Err(MathError::NumericalError(format!("loss is {}", loss)));
    }

    // d loss / d logits = ((1 - s) * (W p - T) + s * (p - 1/C)) / N
    let probs = softmax_rows(logits);
    let mut targets = Array2::<f32>::zeros((rows, classes));
    let mut total_weight = Array1::<f32>::zeros(rows);
    for (labels, weights) in mix.labels.iter().zip(&mix.weights) {
        for (i, (&label, &w)) in labels.iter().zip(weights.iter()).enumerate() {
            targets[[i, label]] += w;
            total_weight[i] += w;
        }
    }
    let mut grad_logits = Array2::<f32>::zeros((rows, classes));
    let uniform = 1.0 / classes as f32;
    for i in 0..rows {
        for j in 0..classes {
            let p = probs[[i, j]];
            grad_logits[[i, j]] = ((1.0 - label_smoothing) * (total_weight[i] * p - targets[[i, j]])
                + label_smoothing * (p - uniform))
                / rows as f32;
        }
    }

    Ok(LossOutput {
        loss,
        classification_loss,
        smoothing_loss,
        grad_logits,
    })
}

/// Percentage of samples whose arg-max prediction matches the label
pub fn accuracy(logits: ArrayView2<f32>, labels: &Array1<usize>) -> Result<f32, MathError> {
    check_rows(logits, labels.len())?;
    if labels.is_empty() {
        return Ok(0.0);
    }
    let predictions = argmax_rows(logits);
    let correct = predictions
        .iter()
        .zip(labels.iter())
        .filter(|(p, l)| p == l)
        .count();
    Ok(100.0 * correct as f32 / labels.len() as f32)
}
