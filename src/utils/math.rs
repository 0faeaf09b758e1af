use ndarray::{Array, Array1, Array2, ArrayView, ArrayView2, Axis, Dimension, RemoveAxis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MathError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
}

/// Rolls an array along its leading (batch) axis:
/// element `i` of the result is element `i - shift (mod n)` of the input.
pub fn roll_axis0<A, D>(array: ArrayView<'_, A, D>, shift: usize) -> Array<A, D>
where
    A: Clone,
    D: Dimension + RemoveAxis,
{
    let n = array.len_of(Axis(0));
    let mut rolled = array.to_owned();
    if n == 0 {
        return rolled;
    }
    let shift = shift % n;
    for i in 0..n {
        let src = (i + n - shift) % n;
        rolled
            .index_axis_mut(Axis(0), i)
            .assign(&array.index_axis(Axis(0), src));
    }
    rolled
}

/// Row-wise log-softmax of a `[batch, classes]` matrix.
pub fn log_softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum_exp = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|x| x - log_sum_exp);
    }
    out
}

/// Row-wise softmax of a `[batch, classes]` matrix.
pub fn softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));

        // All values non-finite: fall back to a uniform distribution
        if max == f32::NEG_INFINITY {
            row.fill(1.0 / row.len() as f32);
            continue;
        }

        let mut sum = 0.0f32;
        for val in row.iter_mut() {
            *val = (*val - max).exp();
            sum += *val;
        }
        sum = sum.max(1e-20);
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Index of the largest entry of each row.
pub fn argmax_rows(matrix: ArrayView2<f32>) -> Array1<usize> {
    matrix
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |(best_i, best), (i, &v)| {
                    if v > best {
                        (i, v)
                    } else {
                        (best_i, best)
                    }
                })
                .0
        })
        .collect()
}

/// Ensures `matrix` has `expected` rows.
pub fn check_rows(matrix: ArrayView2<f32>, expected: usize) -> Result<(), MathError> {
    if matrix.nrows() != expected {
        return Err(MathError::DimensionMismatch(format!(
            "Expected {} rows, got {}",
            expected,
            matrix.nrows()
        )));
    }
    Ok(())
}
