//! Classifier contract driven by the training loop, plus a reference
//! implementation.

pub mod linear;

pub use linear::LinearClassifier;

use ndarray::{Array, Array2, ArrayD, ArrayView2, ArrayView4, ArrayViewMutD, Dimension};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),
}

/// Named parameter tensors, as stored in checkpoints
pub type ModelState = BTreeMap<String, ArrayD<f32>>;

/// A parameter tensor together with its accumulated gradient
#[derive(Debug, Clone)]
pub struct Param<D: Dimension> {
    pub value: Array<f32, D>,
    pub grad: Array<f32, D>,
}

impl<D: Dimension> Param<D> {
    pub fn new(value: Array<f32, D>) -> Self {
        let grad = Array::zeros(value.raw_dim());
        Self { value, grad }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn view_mut<'a>(&'a mut self, name: &'a str) -> ParamMut<'a> {
        ParamMut {
            name,
            value: self.value.view_mut().into_dyn(),
            grad: self.grad.view_mut().into_dyn(),
        }
    }

    /// Replaces the value from a checkpointed tensor of the same shape
    pub fn load(&mut self, name: &str, state: &ModelState) -> Result<(), ModelError> {
        let stored = state
            .get(name)
            .ok_or_else(|| ModelError::MissingParameter(name.to_string()))?;
        if stored.shape() != self.value.shape() {
            return Err(ModelError::DimensionMismatch(format!(
                "parameter {}: expected shape {:?}, got {:?}",
                name,
                self.value.shape(),
                stored.shape()
            )));
        }
        let stored = stored
            .clone()
            .into_dimensionality::<D>()
            .map_err(|e| ModelError::DimensionMismatch(e.to_string()))?;
        self.value.assign(&stored);
        self.zero_grad();
        Ok(())
    }
}

/// Mutable access to one parameter, handed to optimizers
pub struct ParamMut<'a> {
    pub name: &'a str,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewMutD<'a, f32>,
}

/// An image classifier: NCHW images in, class logits out.
pub trait Classifier {
    fn num_classes(&self) -> usize;

    /// Logits of shape `[batch, num_classes]`
    fn forward(&self, images: ArrayView4<f32>) -> Result<Array2<f32>, ModelError>;

    /// Accumulates parameter gradients given the gradient of the loss w.r.t. the logits
    fn backward(
        &mut self,
        images: ArrayView4<f32>,
        grad_logits: ArrayView2<f32>,
    ) -> Result<(), ModelError>;

    fn params_mut(&mut self) -> Vec<ParamMut<'_>>;

    fn zero_grad(&mut self);

    fn state_dict(&self) -> ModelState;

    fn load_state_dict(&mut self, state: &ModelState) -> Result<(), ModelError>;
}
