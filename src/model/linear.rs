use ndarray::{Array1, Array2, ArrayView2, ArrayView4, Axis, Ix1, Ix2};
use ndarray_rand::RandomExt;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::Normal;

use super::{Classifier, ModelError, ModelState, Param, ParamMut};

/// Softmax-regression classifier over flattened CHW images
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    pub weight: Param<Ix2>,
    pub bias: Param<Ix1>,
    input_shape: (usize, usize, usize),
    num_classes: usize,
}

impl LinearClassifier {
    pub fn new(
        input_shape: (usize, usize, usize),
        num_classes: usize,
        seed: Option<u64>,
    ) -> Result<Self, ModelError> {
        if num_classes == 0 {
            return Err(ModelError::InitializationError(
                "classifier needs at least one class".to_string(),
            ));
        }
        let (c, h, w) = input_shape;
        let features = c * h * w;
        let normal = Normal::new(0.0f32, 0.02).map_err(|e| {
            ModelError::InitializationError(e.to_string())
        })?;
        let mut rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        Ok(Self {
            weight: Param::new(Array2::random_using((features, num_classes), normal, &mut rng)),
            bias: Param::new(Array1::zeros(num_classes)),
            input_shape,
            num_classes,
        })
    }

    pub fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    fn flatten(&self, images: ArrayView4<f32>) -> Result<Array2<f32>, ModelError> {
        let (n, c, h, w) = images.dim();
        if (c, h, w) != self.input_shape {
            return Err(ModelError::DimensionMismatch(format!(
                "expected images of shape {:?}, got {:?}",
                self.input_shape,
                (c, h, w)
            )));
        }
        images
            .to_owned()
            .into_shape((n, c * h * w))
            .map_err(|e| ModelError::DimensionMismatch(e.to_string()))
    }
}

impl Classifier for LinearClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, images: ArrayView4<f32>) -> Result<Array2<f32>, ModelError> {
        let x = self.flatten(images)?;
        Ok(x.dot(&self.weight.value) + &self.bias.value)
    }

    fn backward(
        &mut self,
        images: ArrayView4<f32>,
        grad_logits: ArrayView2<f32>,
    ) -> Result<(), ModelError> {
        let x = self.flatten(images)?;
        if grad_logits.dim() != (x.nrows(), self.num_classes) {
            return Err(ModelError::DimensionMismatch(format!(
                "expected logit gradient of shape {:?}, got {:?}",
                (x.nrows(), self.num_classes),
                grad_logits.dim()
            )));
        }
        self.weight.grad += &x.t().dot(&grad_logits);
        self.bias.grad += &grad_logits.sum_axis(Axis(0));
        Ok(())
    }

    fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        vec![self.weight.view_mut("weight"), self.bias.view_mut("bias")]
    }

    fn zero_grad(&mut self) {
        self.weight.zero_grad();
        self.bias.zero_grad();
    }

    fn state_dict(&self) -> ModelState {
        let mut state = ModelState::new();
        state.insert("weight".to_string(), self.weight.value.clone().into_dyn());
        state.insert("bias".to_string(), self.bias.value.clone().into_dyn());
        state
    }

    fn load_state_dict(&mut self, state: &ModelState) -> Result<(), ModelError> {
        self.weight.load("weight", state)?;
        self.bias.load("bias", state)?;
        Ok(())
    }
}
