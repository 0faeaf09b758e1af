use log::info;
use ndarray::{Array1, Array2, ArrayView4};

use super::dataset::{Batch, Dataset};
use super::loss::{accuracy, classification_loss};
use super::optimizer::{Optimizer, OptimizerState};
use crate::augment::{Augmenter, LabelMix};
use crate::config::TrainConfig;
use crate::error::{MixTrainError, Result};
use crate::model::{Classifier, ModelState};

/// A batch as handed to the training model: the images and labels plus the
/// host-sampled mixup coefficients, when mixup is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedBatch {
    pub batch: Batch,
    pub mixup_coefficients: Option<Array1<f32>>,
}

impl AugmentedBatch {
    pub fn plain(batch: Batch) -> Self {
        Self {
            batch,
            mixup_coefficients: None,
        }
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Result of one training step. Values are summed over device iterations
/// and accumulated micro batches.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Accuracy in percent
    pub accuracy: f32,
    pub loss: f32,
    /// Classification loss, then the smoothing loss if label smoothing is on
    pub sublosses: Vec<f32>,
}

/// A model compiled for training together with its loss and a device-side
/// copy of the optimizer.
pub trait TrainingModel {
    /// Prepares the model for the shapes of `batch` without training on it
    fn compile(&mut self, batch: &AugmentedBatch) -> Result<()>;

    /// Forward, loss, backward and one optimizer step
    fn train_step(&mut self, batch: &AugmentedBatch) -> Result<StepOutput>;

    /// Raw logits without augmentation or loss
    fn predict(&self, images: ArrayView4<f32>) -> Result<Array2<f32>>;

    /// Pushes the host optimizer's hyperparameters to the model
    fn set_optimizer(&mut self, optimizer: &dyn Optimizer) -> Result<()>;

    fn optimizer_state(&self) -> OptimizerState;

    fn load_optimizer_state(&mut self, state: OptimizerState) -> Result<()>;

    fn state_dict(&self) -> ModelState;

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()>;

    fn attach_to_device(&mut self) -> Result<()> {
        Ok(())
    }

    fn detach_from_device(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Wraps a classifier with augmentation, label-smoothed loss and SGD updates
pub struct ClassifierWithLoss<M: Classifier> {
    model: M,
    augmenter: Option<Augmenter>,
    label_smoothing: f32,
    optimizer: Box<dyn Optimizer>,
    compiled: bool,
    attached: bool,
}

impl<M: Classifier> ClassifierWithLoss<M> {
    pub fn new(
        model: M,
        augmenter: Option<Augmenter>,
        label_smoothing: f32,
        optimizer: &dyn Optimizer,
    ) -> Self {
        Self {
            model,
            augmenter,
            label_smoothing,
            optimizer: optimizer.box_clone(),
            compiled: false,
            attached: true,
        }
    }

    pub fn from_config(model: M, config: &TrainConfig, optimizer: &dyn Optimizer) -> Result<Self> {
        let augmenter = Augmenter::from_config(config)?;
        Ok(Self::new(model, augmenter, config.label_smoothing, optimizer))
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Current hyperparameters and buffers of the device-side optimizer
    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    fn check_attached(&self) -> Result<()> {
        if self.attached {
            Ok(())
        } else {
            Err(MixTrainError::Training(
                "model is detached from the device".to_string(),
            ))
        }
    }
}

impl<M: Classifier> TrainingModel for ClassifierWithLoss<M> {
    fn compile(&mut self, batch: &AugmentedBatch) -> Result<()> {
        self.check_attached()?;
        let logits = self.model.forward(batch.batch.images.view())?;
        info!(
            "Compiled training model for batches of {} ({} classes)",
            logits.nrows(),
            logits.ncols()
        );
        self.compiled = true;
        Ok(())
    }

    fn train_step(&mut self, batch: &AugmentedBatch) -> Result<StepOutput> {
        self.check_attached()?;
        let labels = &batch.batch.labels;
        let (images, mix) = match &mut self.augmenter {
            Some(augmenter) => {
                let (images, coeffs) = augmenter
                    .augment(batch.batch.images.view(), batch.mixup_coefficients.as_ref())?;
                let mix = augmenter.mix_labels(labels, &coeffs)?;
                (images, mix)
            }
            None => (batch.batch.images.clone(), LabelMix::single(labels.clone())),
        };

        let logits = self.model.forward(images.view())?;
        let loss = classification_loss(logits.view(), &mix, self.label_smoothing)?;
        let accuracy = accuracy(logits.view(), labels)?;

        let loss_scaling = self.optimizer.loss_scaling();
        let grad_logits = loss.grad_logits.mapv(|g| g * loss_scaling);
        self.model.zero_grad();
        self.model.backward(images.view(), grad_logits.view())?;
        self.optimizer.step(self.model.params_mut())?;
        self.compiled = true;

        Ok(StepOutput {
            accuracy,
            loss: loss.loss,
            sublosses: loss.sublosses(),
        })
    }

    fn predict(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        Ok(self.model.forward(images)?)
    }

    fn set_optimizer(&mut self, optimizer: &dyn Optimizer) -> Result<()> {
        Ok(self.optimizer.sync_hyperparameters(optimizer)?)
    }

    fn optimizer_state(&self) -> OptimizerState {
        self.optimizer.state()
    }

    fn load_optimizer_state(&mut self, state: OptimizerState) -> Result<()> {
        Ok(self.optimizer.load_state(state)?)
    }

    fn state_dict(&self) -> ModelState {
        self.model.state_dict()
    }

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()> {
        Ok(self.model.load_state_dict(state)?)
    }

    fn attach_to_device(&mut self) -> Result<()> {
        self.attached = true;
        Ok(())
    }

    fn detach_from_device(&mut self) -> Result<()> {
        self.attached = false;
        Ok(())
    }
}

/// Measures model accuracy (in percent) on held-out data
pub trait Validator {
    fn validate(&mut self, model: &dyn TrainingModel) -> Result<f64>;
}

/// Top-1 accuracy over every sample of a dataset, tail batch included
pub struct DatasetValidator {
    dataset: Dataset,
}

impl DatasetValidator {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset }
    }
}

impl Validator for DatasetValidator {
    fn validate(&mut self, model: &dyn TrainingModel) -> Result<f64> {
        let mut correct = 0.0f64;
        let mut total = 0usize;
        for batch in self.dataset.batch_iter_with_remainder() {
            let logits = model.predict(batch.images.view())?;
            let batch_accuracy = accuracy(logits.view(), &batch.labels)?;
            correct += batch_accuracy as f64 * batch.len() as f64 / 100.0;
            total += batch.len();
        }
        if total == 0 {
            return Err(MixTrainError::Training("validation dataset is empty".to_string()));
        }
        Ok(100.0 * correct / total as f64)
    }
}
