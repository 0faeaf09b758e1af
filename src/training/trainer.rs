use log::{debug, info};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::checkpoint::{self, Checkpoint};
use super::dataset::{Batch, BatchSource};
use super::distributed::Distributed;
use super::metrics::{Metrics, MetricsSink, TrainResults};
use super::model::{AugmentedBatch, StepOutput, TrainingModel, Validator};
use super::optimizer::Optimizer;
use super::schedule::{LossScalingSchedule, LrScheduler};
use crate::augment::sample_mixup_coefficients;
use crate::config::{LrScheduleKind, RunMode, TrainConfig, ValidationMode};
use crate::error::{MixTrainError, Result};

/// Mutable state of a training run, updated once per step
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub epoch: usize,
    pub metrics: Metrics,
    /// Learning rate last pushed to the model
    pub learning_rate: f64,
    /// Loss scaling last pushed to the model
    pub loss_scaling: f32,
    /// Loss scaling scheduled for the current epoch, pushed after the next step
    pub pending_loss_scaling: f32,
    /// Samples processed in the current epoch, over all processes
    pub epoch_samples: usize,
}

impl TrainingState {
    fn new(iterations_per_epoch: usize, learning_rate: f64, loss_scaling: f32) -> Self {
        Self {
            epoch: 0,
            metrics: Metrics::new(iterations_per_epoch),
            learning_rate,
            loss_scaling,
            pending_loss_scaling: loss_scaling,
            epoch_samples: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub epochs_completed: usize,
    pub loss: Option<f64>,
    pub train_accuracy: Option<f64>,
    pub learning_rate: f64,
    pub loss_scaling: f32,
    /// Images per second of the last epoch, over all processes
    pub throughput: f64,
    pub checkpoints: Vec<PathBuf>,
}

/// How a call to `Trainer::train` ended
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    Completed(TrainingSummary),
    /// The model was compiled on the first batch; nothing was trained
    CompiledOnly,
    /// A single step was run for profiling
    ProfiledOnly,
}

/// Main trainer struct that handles the training loop
pub struct Trainer {
    config: TrainConfig,
    model: Box<dyn TrainingModel>,
    optimizer: Box<dyn Optimizer>,
    sink: Box<dyn MetricsSink>,
    distributed: Box<dyn Distributed>,
    validator: Option<Box<dyn Validator>>,
    host_rng: SmallRng,
    start_epoch: usize,
    state: Option<TrainingState>,
}

impl Trainer {
    pub fn new(
        config: TrainConfig,
        model: Box<dyn TrainingModel>,
        optimizer: Box<dyn Optimizer>,
        sink: Box<dyn MetricsSink>,
        distributed: Box<dyn Distributed>,
    ) -> Result<Self> {
        config.validate()?;
        let host_rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Ok(Self {
            config,
            model,
            optimizer,
            sink,
            distributed,
            validator: None,
            host_rng,
            start_epoch: 0,
            state: None,
        })
    }

    pub fn with_validator(mut self, validator: Box<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Restores model and optimizer state; training continues at `checkpoint.epoch + 1`
    pub fn resume(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.model.load_state_dict(&checkpoint.model_state)?;
        self.optimizer.load_state(checkpoint.optimizer_state.clone())?;
        self.model.load_optimizer_state(checkpoint.optimizer_state)?;
        self.start_epoch = checkpoint.epoch;
        info!("Resuming training after epoch {}", checkpoint.epoch);
        Ok(())
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &dyn TrainingModel {
        self.model.as_ref()
    }

    /// State of the last completed run
    pub fn state(&self) -> Option<&TrainingState> {
        self.state.as_ref()
    }

    /// Runs the remaining epochs over `data`
    pub fn train(&mut self, data: &dyn BatchSource) -> Result<TrainOutcome> {
        let iterations = data.iterations_per_epoch();
        if iterations == 0 {
            return Err(MixTrainError::Training(
                "training data yields no batches".to_string(),
            ));
        }
        let mut lr_scheduler = LrScheduler::from_config(&self.config, iterations, self.start_epoch)?;
        let loss_schedule = LossScalingSchedule::from_config(&self.config)?;
        let log_interval = (iterations / self.config.logs_per_epoch).max(1);
        let num_instances = self.distributed.size();

        let mut state = TrainingState::new(
            iterations,
            lr_scheduler.last_lr(),
            self.optimizer.loss_scaling(),
        );
        self.optimizer.set_learning_rate(state.learning_rate);
        self.model.set_optimizer(self.optimizer.as_ref())?;

        let mut summary = TrainingSummary {
            epochs_completed: 0,
            loss: None,
            train_accuracy: None,
            learning_rate: state.learning_rate,
            loss_scaling: state.loss_scaling,
            throughput: 0.0,
            checkpoints: Vec::new(),
        };

        for epoch in (self.start_epoch + 1)..=self.config.epochs {
            info!("Epoch {}/{}", epoch, self.config.epochs);
            state.epoch = epoch;
            state.epoch_samples = 0;
            state.pending_loss_scaling = loss_schedule.scaling_for_epoch(epoch);
            let epoch_start = Instant::now();

            for (batch_idx, batch) in data.batches().enumerate() {
                let batch = self.augment_on_host(batch)?;

                if self.config.run_mode == RunMode::CompileOnly {
                    self.model.compile(&batch)?;
                    info!("Graph compilation complete, compile-only mode was set, stopping.");
                    return Ok(TrainOutcome::CompiledOnly);
                }

                let output = self.model.train_step(&batch)?;
                if self.config.run_mode == RunMode::ProfileOnly {
                    info!("Profiled one training step, stopping.");
                    return Ok(TrainOutcome::ProfiledOnly);
                }

                let epoch_num = (epoch - 1) as f64 + (batch_idx + 1) as f64 / iterations as f64;
                state.metrics.record_step();
                if !self.config.disable_metrics {
                    self.record_step_metrics(&mut state, &output);
                }
                state.epoch_samples += batch.len() * num_instances;

                if !self.config.disable_metrics && (batch_idx + 1) % log_interval == 0 {
                    let iteration = batch_idx + 1 + (epoch - 1) * iterations;
                    self.report_interval(&mut state, epoch_num, iteration, batch.len())?;
                }

                let new_lr = lr_scheduler.step(epoch_num);
                if new_lr != state.learning_rate || state.pending_loss_scaling != state.loss_scaling {
                    self.push_hyperparameters(&mut state, new_lr)?;
                }
            }

            let elapsed = epoch_start.elapsed().as_secs_f64();
            if !self.config.disable_metrics {
                info!(
                    "Epoch {}: Train accuracy is {:.2}%",
                    epoch,
                    state.metrics.running_mean("accuracy")
                );
            }
            let total_samples = self.distributed.all_reduce_mean(state.epoch_samples as f64)?;
            let elapsed = self.distributed.all_reduce_mean(elapsed)?;
            let throughput = if elapsed > 0.0 { total_samples / elapsed } else { 0.0 };
            info!("Throughput of the epoch: {:.1} img/sec", throughput);

            summary.epochs_completed += 1;
            summary.throughput = throughput;
            if !self.config.disable_metrics {
                summary.loss = Some(state.metrics.running_mean("loss"));
                summary.train_accuracy = Some(state.metrics.running_mean("accuracy"));
            }
            if let Some(path) = self.save_checkpoint(epoch, &summary)? {
                summary.checkpoints.push(path);
            }
        }

        summary.learning_rate = state.learning_rate;
        summary.loss_scaling = state.loss_scaling;
        self.state = Some(state);
        Ok(TrainOutcome::Completed(summary))
    }

    /// Attaches host-sampled mixup coefficients, one per image of the host batch
    fn augment_on_host(&mut self, batch: Batch) -> Result<AugmentedBatch> {
        if !self.config.mixup_enabled {
            return Ok(AugmentedBatch::plain(batch));
        }
        let coefficients = sample_mixup_coefficients(
            self.config.mixup_alpha,
            batch.len(),
            self.config.precision,
            &mut self.host_rng,
        )?;
        Ok(AugmentedBatch {
            batch,
            mixup_coefficients: Some(coefficients),
        })
    }

    /// Step outputs are sums over device iterations and accumulated micro batches
    fn record_step_metrics(&self, state: &mut TrainingState, output: &StepOutput) {
        let divisor = self.config.reduction_divisor();
        let classification = output.sublosses.first().copied().unwrap_or(output.loss) as f64;
        let smoothing = output.sublosses.get(1).copied().unwrap_or(0.0) as f64;

        let metrics = &mut state.metrics;
        metrics.save_value("accuracy", output.accuracy as f64 / divisor);
        metrics.save_value("loss", output.loss as f64 / divisor);
        metrics.save_value("classification_loss", classification / divisor);
        metrics.save_value("smoothing_loss", smoothing / divisor);

        if self.distributed.is_primary() {
            debug!(
                "Loss: {:.4} | Accuracy: {:.2}%",
                metrics.running_mean("loss"),
                metrics.running_mean("accuracy")
            );
        }
    }

    fn report_interval(
        &mut self,
        state: &mut TrainingState,
        epoch_num: f64,
        iteration: usize,
        batch_len: usize,
    ) -> Result<()> {
        let interval = state.metrics.take_interval();
        let num_instances = self.distributed.size();
        let validation_accuracy = self.run_validation(state.epoch)?;

        let metrics = &state.metrics;
        let mut results = TrainResults::new();
        let mut put = |name: &str, value: f64| {
            results.insert(name.to_string(), value);
        };
        put("loss_avg", metrics.running_mean("loss"));
        put("loss_batch", metrics.get_value("loss"));
        put("epoch", epoch_num);
        put("iteration", iteration as f64);
        put("train_accuracy_avg", metrics.running_mean("accuracy"));
        put("train_accuracy_batch", metrics.get_value("accuracy"));
        put("learning_rate", state.learning_rate);
        put("loss_scaling", state.loss_scaling as f64);
        let (throughput, latency) = if interval.elapsed_secs > 0.0 && interval.steps > 0 {
            (
                (interval.steps * batch_len) as f64 / interval.elapsed_secs,
                interval.elapsed_secs / (interval.steps * num_instances) as f64,
            )
        } else {
            (0.0, 0.0)
        };
        put("train_img_per_sec", throughput);
        put("latency_sec", latency);
        put("validation_accuracy", validation_accuracy.unwrap_or(0.0));
        put("classification_loss_batch", metrics.get_value("classification_loss"));
        put("classification_loss_avg", metrics.running_mean("classification_loss"));
        put("smoothing_loss_batch", metrics.get_value("smoothing_loss"));
        put("smoothing_loss_avg", metrics.running_mean("smoothing_loss"));

        if self.distributed.is_primary() {
            if self.config.weight_histogram {
                self.sink.log_histogram(&self.model.state_dict())?;
            }
            self.sink.log_train_results(&results)?;
            if let Some(accuracy) = validation_accuracy {
                let mut validation = TrainResults::new();
                validation.insert("epoch".to_string(), epoch_num);
                validation.insert("validation_accuracy".to_string(), accuracy);
                self.sink.log_validation_results(&validation)?;
            }
        }
        Ok(())
    }

    /// Validates the trained model once when validation runs after training
    /// and no checkpoints are kept; with a checkpoint directory use
    /// `validate_checkpoints` instead. Returns the reported results.
    pub fn validate_after_training(&mut self) -> Result<Option<TrainResults>> {
        if self.config.validation_mode != ValidationMode::After
            || self.config.checkpoint_dir.is_some()
        {
            return Ok(None);
        }
        let validator = match self.validator.as_mut() {
            Some(validator) => validator,
            None => return Ok(None),
        };
        self.model.detach_from_device()?;
        let accuracy = validator.validate(self.model.as_ref())?;
        let accuracy = self.distributed.all_reduce_mean(accuracy)?;
        info!("Validation Accuracy: {:.2}%", accuracy);

        let epochs = self.config.epochs;
        let mut results = TrainResults::new();
        results.insert("validation_epoch".to_string(), epochs as f64);
        results.insert(
            "validation_iteration".to_string(),
            (self.config.logs_per_epoch * epochs) as f64,
        );
        results.insert("validation_accuracy".to_string(), accuracy);
        if self.distributed.is_primary() {
            self.sink.log_validation_results(&results)?;
        }
        Ok(Some(results))
    }

    /// Validates when validation runs during training and `epoch` is a validation epoch
    fn run_validation(&mut self, epoch: usize) -> Result<Option<f64>> {
        if self.config.validation_mode != ValidationMode::During {
            return Ok(None);
        }
        let validator = match self.validator.as_mut() {
            Some(validator) if epoch % self.config.validation_frequency == 0 => validator,
            _ => return Ok(None),
        };
        self.model.detach_from_device()?;
        let accuracy = validator.validate(self.model.as_ref())?;
        let accuracy = self.distributed.all_reduce_mean(accuracy)?;
        self.model.attach_to_device()?;
        info!("Validation Accuracy: {:.2}%", accuracy);
        Ok(Some(accuracy))
    }

    fn push_hyperparameters(&mut self, state: &mut TrainingState, new_lr: f64) -> Result<()> {
        let new_loss_scaling = state.pending_loss_scaling;
        if new_loss_scaling != state.loss_scaling {
            self.optimizer.set_loss_scaling(new_loss_scaling);
            if self.optimizer.uses_velocity_scaling() {
                let velocity_scaling = new_loss_scaling / self.config.loss_velocity_scaling_ratio;
                for group in self.optimizer.param_groups_mut() {
                    group.velocity_scaling = Some(velocity_scaling);
                }
            }
            info!("Loss scaling is changed to {}", new_loss_scaling);
        }
        self.optimizer.set_learning_rate(new_lr);
        self.model.set_optimizer(self.optimizer.as_ref())?;

        if self.config.lr_schedule == LrScheduleKind::Step && new_lr != state.learning_rate {
            info!("Learning rate is changed to {}", new_lr);
        }
        state.learning_rate = new_lr;
        state.loss_scaling = new_loss_scaling;
        Ok(())
    }

    /// Only the first process of each host writes checkpoints
    fn save_checkpoint(&self, epoch: usize, summary: &TrainingSummary) -> Result<Option<PathBuf>> {
        let dir = match &self.config.checkpoint_dir {
            Some(dir) if self.distributed.is_local_primary() => dir,
            _ => return Ok(None),
        };
        let path = checkpoint::checkpoint_path(dir, &self.config.model, &self.config.dataset, epoch);
        let checkpoint = Checkpoint {
            epoch,
            model_state: self.model.state_dict(),
            optimizer_state: self.model.optimizer_state(),
            loss: summary.loss,
            train_accuracy: summary.train_accuracy,
            config: self.config.clone(),
        };
        checkpoint::save_checkpoint(&path, &checkpoint)?;
        Ok(Some(path))
    }
}

/// Loads every checkpoint in `dir` into `model` and reports its validation
/// accuracy. Returns `(checkpoint path, accuracy)` pairs in path order.
pub fn validate_checkpoints(
    dir: impl AsRef<Path>,
    model: &mut dyn TrainingModel,
    validator: &mut dyn Validator,
    sink: &mut dyn MetricsSink,
) -> Result<Vec<(PathBuf, f64)>> {
    let mut accuracies = Vec::new();
    for path in checkpoint::checkpoint_files(dir)? {
        let checkpoint = checkpoint::load_checkpoint(&path)?;
        model.load_state_dict(&checkpoint.model_state)?;
        let accuracy = validator.validate(&*model)?;
        info!(
            "Checkpoint {}: validation accuracy {:.2}%",
            path.display(),
            accuracy
        );

        let mut results = TrainResults::new();
        results.insert("epoch".to_string(), checkpoint.epoch as f64);
        results.insert("validation_accuracy".to_string(), accuracy);
        sink.log_validation_results(&results)?;
        accuracies.push((path, accuracy));
    }
    Ok(accuracies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptimizerKind, RunMode};
    use crate::model::{LinearClassifier, ModelState};
    use crate::training::dataset::Dataset;
    use crate::training::distributed::{DistributedError, SingleProcess};
    use crate::training::model::{ClassifierWithLoss, DatasetValidator};
    use crate::training::optimizer::{OptimizerState, Sgd};
    use crate::utils::io::IoError;
    use ndarray::{Array2, ArrayView4};
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorded {
        train: Vec<TrainResults>,
        validation: Vec<TrainResults>,
        /// Parameter names of every histogrammed model state
        histograms: Vec<Vec<String>>,
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Rc<RefCell<Recorded>>);

    impl MetricsSink for RecordingSink {
        fn log_train_results(&mut self, results: &TrainResults) -> std::result::Result<(), IoError> {
            self.0.borrow_mut().train.push(results.clone());
            Ok(())
        }

        fn log_validation_results(
            &mut self,
            results: &TrainResults,
        ) -> std::result::Result<(), IoError> {
            self.0.borrow_mut().validation.push(results.clone());
            Ok(())
        }

        fn log_histogram(&mut self, state: &ModelState) -> std::result::Result<(), IoError> {
            self.0.borrow_mut().histograms.push(state.keys().cloned().collect());
            Ok(())
        }
    }

    #[derive(Default)]
    struct ModelLog {
        steps: usize,
        compiled: usize,
        mixup_lengths: Vec<usize>,
        pushes: Vec<(f64, f32, Option<f32>)>,
        detached: usize,
    }

    /// Returns a fixed step output and records how the trainer drives it
    struct ScriptedModel {
        log: Rc<RefCell<ModelLog>>,
        output: StepOutput,
        optimizer: OptimizerState,
    }

    impl ScriptedModel {
        fn new(output: StepOutput) -> (Self, Rc<RefCell<ModelLog>>) {
            let log = Rc::new(RefCell::new(ModelLog::default()));
            let model = Self {
                log: log.clone(),
                output,
                optimizer: Sgd::new(OptimizerKind::Sgd, 0.1, 0.0, 0.0, 1.0, None).state(),
            };
            (model, log)
        }
    }

    impl TrainingModel for ScriptedModel {
        fn compile(&mut self, _batch: &AugmentedBatch) -> Result<()> {
            self.log.borrow_mut().compiled += 1;
            Ok(())
        }

        fn train_step(&mut self, batch: &AugmentedBatch) -> Result<StepOutput> {
            let mut log = self.log.borrow_mut();
            log.steps += 1;
            if let Some(coeffs) = &batch.mixup_coefficients {
                log.mixup_lengths.push(coeffs.len());
            }
            Ok(self.output.clone())
        }

        fn predict(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
            Ok(Array2::zeros((images.dim().0, 2)))
        }

        fn set_optimizer(&mut self, optimizer: &dyn Optimizer) -> Result<()> {
            self.log.borrow_mut().pushes.push((
                optimizer.learning_rate(),
                optimizer.loss_scaling(),
                optimizer.param_groups()[0].velocity_scaling,
            ));
            Ok(())
        }

        fn optimizer_state(&self) -> OptimizerState {
            self.optimizer.clone()
        }

        fn load_optimizer_state(&mut self, state: OptimizerState) -> Result<()> {
            self.optimizer = state;
            Ok(())
        }

        fn state_dict(&self) -> ModelState {
            ModelState::new()
        }

        fn load_state_dict(&mut self, _state: &ModelState) -> Result<()> {
            Ok(())
        }

        fn detach_from_device(&mut self) -> Result<()> {
            self.log.borrow_mut().detached += 1;
            Ok(())
        }
    }

    struct CountingValidator(Rc<RefCell<usize>>);

    impl Validator for CountingValidator {
        fn validate(&mut self, _model: &dyn TrainingModel) -> Result<f64> {
            *self.0.borrow_mut() += 1;
            Ok(42.0)
        }
    }

    /// Rank 1 of two processes sharing one host
    struct SecondRank;

    impl Distributed for SecondRank {
        fn rank(&self) -> usize {
            1
        }

        fn local_rank(&self) -> usize {
            0
        }

        fn size(&self) -> usize {
            2
        }

        fn all_reduce_sum(&self, value: f64) -> std::result::Result<f64, DistributedError> {
            Ok(value * 2.0)
        }
    }

    fn data(batches: usize, batch_size: usize) -> Dataset {
        Dataset::synthetic(batches * batch_size, (1, 4, 4), 3, batch_size, 9).unwrap()
    }

    fn base_config() -> TrainConfig {
        TrainConfig {
            epochs: 2,
            batch_size: 4,
            seed: Some(0),
            ..TrainConfig::default()
        }
    }

    fn scripted_output() -> StepOutput {
        StepOutput {
            accuracy: 60.0,
            loss: 6.0,
            sublosses: vec![3.0, 3.0],
        }
    }

    fn trainer_with(
        config: TrainConfig,
        model: Box<dyn TrainingModel>,
        sink: RecordingSink,
    ) -> Trainer {
        let optimizer = Box::new(Sgd::from_config(&config));
        Trainer::new(config, model, optimizer, Box::new(sink), Box::new(SingleProcess)).unwrap()
    }

    #[test]
    fn test_end_to_end_linear_training() {
        let dir = tempdir().unwrap();
        let config = TrainConfig {
            epochs: 2,
            batch_size: 8,
            logs_per_epoch: 2,
            mixup_enabled: true,
            cutmix_enabled: true,
            label_smoothing: 0.1,
            momentum: 0.9,
            seed: Some(1),
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..TrainConfig::default()
        };
        let optimizer = Sgd::from_config(&config);
        let classifier = LinearClassifier::new((1, 4, 4), 3, config.seed).unwrap();
        let model = ClassifierWithLoss::from_config(classifier, &config, &optimizer).unwrap();
        let sink = RecordingSink::default();
        let mut trainer = Trainer::new(
            config,
            Box::new(model),
            Box::new(optimizer),
            Box::new(sink.clone()),
            Box::new(SingleProcess),
        )
        .unwrap()
        .with_validator(Box::new(DatasetValidator::new(data(2, 8))));

        let outcome = trainer.train(&data(4, 8)).unwrap();
        let summary = match outcome {
            TrainOutcome::Completed(summary) => summary,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(summary.epochs_completed, 2);
        assert_eq!(summary.checkpoints.len(), 2);
        assert!(summary.loss.unwrap().is_finite());

        let recorded = sink.0.borrow();
        assert_eq!(recorded.train.len(), 4);
        assert_eq!(recorded.validation.len(), 4);
        let first = &recorded.train[0];
        for key in [
            "loss_avg",
            "loss_batch",
            "epoch",
            "iteration",
            "train_accuracy_avg",
            "train_accuracy_batch",
            "learning_rate",
            "loss_scaling",
            "train_img_per_sec",
            "latency_sec",
            "validation_accuracy",
            "classification_loss_batch",
            "classification_loss_avg",
            "smoothing_loss_batch",
            "smoothing_loss_avg",
        ] {
            assert!(first.contains_key(key), "missing {}", key);
        }
        assert_eq!(first["iteration"], 2.0);
        assert_eq!(first["epoch"], 0.5);
        assert!(first["smoothing_loss_batch"] > 0.0);

        let files = checkpoint::checkpoint_files(dir.path()).unwrap();
        assert!(files[1].ends_with("linear_synthetic_2.pt"));
        let saved = checkpoint::load_checkpoint(&files[1]).unwrap();
        assert_eq!(saved.epoch, 2);
        assert_eq!(saved.model_state, trainer.model().state_dict());
        assert!(!saved.optimizer_state.velocities.is_empty());
        assert_eq!(saved.loss, summary.loss);
    }

    #[test]
    fn test_metrics_normalized_by_reduction() {
        let config = TrainConfig {
            epochs: 1,
            batch_size: 1,
            device_iterations: 2,
            gradient_accumulation: 3,
            ..base_config()
        };
        let (model, _) = ScriptedModel::new(scripted_output());
        let sink = RecordingSink::default();
        let mut trainer = trainer_with(config, Box::new(model), sink.clone());
        trainer.train(&data(3, 6)).unwrap();

        let recorded = sink.0.borrow();
        let results = &recorded.train[0];
        assert!((results["loss_batch"] - 1.0).abs() < 1e-9);
        assert!((results["train_accuracy_avg"] - 10.0).abs() < 1e-9);
        assert!((results["classification_loss_avg"] - 0.5).abs() < 1e-9);
        assert!((results["smoothing_loss_avg"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_loss_scaling_ramp_pushed_to_optimizer() {
        let config = TrainConfig {
            epochs: 3,
            optimizer: OptimizerKind::SgdCombined,
            initial_loss_scaling: 1.0,
            loss_scaling: 4.0,
            loss_velocity_scaling_ratio: 2.0,
            ..base_config()
        };
        let (model, log) = ScriptedModel::new(scripted_output());
        let mut trainer = trainer_with(config, Box::new(model), RecordingSink::default());
        let outcome = trainer.train(&data(2, 4)).unwrap();

        // one push at start, then one per loss scaling change
        let pushes = &log.borrow().pushes;
        assert_eq!(
            pushes,
            &vec![(0.1, 1.0, Some(0.5)), (0.1, 2.0, Some(1.0)), (0.1, 4.0, Some(2.0))]
        );
        match outcome {
            TrainOutcome::Completed(summary) => assert_eq!(summary.loss_scaling, 4.0),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(trainer.state().unwrap().epoch, 3);
    }

    #[test]
    fn test_learning_rate_change_is_pushed() {
        let config = TrainConfig {
            epochs: 2,
            lr: 1.0,
            lr_decay: 0.1,
            lr_epoch_decay: vec![1.0],
            ..base_config()
        };
        let (model, log) = ScriptedModel::new(scripted_output());
        let mut trainer = trainer_with(config, Box::new(model), RecordingSink::default());
        trainer.train(&data(2, 4)).unwrap();

        let pushes = &log.borrow().pushes;
        assert_eq!(pushes.len(), 2);
        assert!((pushes[1].0 - 0.1).abs() < 1e-12);
        assert_eq!(log.borrow().steps, 4);
    }

    #[test]
    fn test_mixup_coefficients_match_host_batch() {
        let config = TrainConfig {
            epochs: 1,
            mixup_enabled: true,
            ..base_config()
        };
        let (model, log) = ScriptedModel::new(scripted_output());
        let mut trainer = trainer_with(config, Box::new(model), RecordingSink::default());
        trainer.train(&data(3, 4)).unwrap();
        assert_eq!(log.borrow().mixup_lengths, vec![4, 4, 4]);
    }

    #[test]
    fn test_validation_frequency() {
        let config = TrainConfig {
            epochs: 2,
            validation_frequency: 2,
            ..base_config()
        };
        let (model, log) = ScriptedModel::new(scripted_output());
        let calls = Rc::new(RefCell::new(0));
        let sink = RecordingSink::default();
        let mut trainer = trainer_with(config, Box::new(model), sink.clone())
            .with_validator(Box::new(CountingValidator(calls.clone())));
        trainer.train(&data(2, 4)).unwrap();

        assert_eq!(*calls.borrow(), 1);
        assert_eq!(log.borrow().detached, 1);
        let recorded = sink.0.borrow();
        assert_eq!(recorded.train[0]["validation_accuracy"], 0.0);
        assert_eq!(recorded.train[1]["validation_accuracy"], 42.0);
    }

    #[test]
    fn test_validation_after_training_without_checkpoints() {
        let config = TrainConfig {
            epochs: 2,
            logs_per_epoch: 2,
            validation_mode: ValidationMode::After,
            ..base_config()
        };
        let (model, log) = ScriptedModel::new(scripted_output());
        let calls = Rc::new(RefCell::new(0));
        let sink = RecordingSink::default();
        let mut trainer = trainer_with(config, Box::new(model), sink.clone())
            .with_validator(Box::new(CountingValidator(calls.clone())));
        trainer.train(&data(2, 4)).unwrap();

        assert_eq!(*calls.borrow(), 0);
        assert!(sink.0.borrow().validation.is_empty());
        assert!(sink.0.borrow().train.iter().all(|r| r["validation_accuracy"] == 0.0));

        let results = trainer.validate_after_training().unwrap().unwrap();
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(log.borrow().detached, 1);
        assert_eq!(results["validation_epoch"], 2.0);
        assert_eq!(results["validation_iteration"], 4.0);
        assert_eq!(results["validation_accuracy"], 42.0);
        assert_eq!(sink.0.borrow().validation, vec![results]);
    }

    #[test]
    fn test_validation_after_training_skipped() {
        let dir = tempdir().unwrap();
        let calls = Rc::new(RefCell::new(0));
        for config in [
            TrainConfig { validation_mode: ValidationMode::None, ..base_config() },
            TrainConfig { validation_mode: ValidationMode::During, ..base_config() },
            TrainConfig {
                validation_mode: ValidationMode::After,
                checkpoint_dir: Some(dir.path().to_path_buf()),
                ..base_config()
            },
        ] {
            let mode = config.validation_mode;
            let (model, _) = ScriptedModel::new(scripted_output());
            let mut trainer = trainer_with(config, Box::new(model), RecordingSink::default())
                .with_validator(Box::new(CountingValidator(calls.clone())));
            let before = *calls.borrow();
            trainer.train(&data(2, 4)).unwrap();
            if mode != ValidationMode::During {
                assert_eq!(*calls.borrow(), before, "{:?} validated during training", mode);
            }
            let during = *calls.borrow();
            assert_eq!(trainer.validate_after_training().unwrap(), None);
            assert_eq!(*calls.borrow(), during);
        }
    }

    #[test]
    fn test_weight_histogram_per_logging_interval() {
        let config = TrainConfig {
            epochs: 2,
            logs_per_epoch: 2,
            weight_histogram: true,
            ..base_config()
        };
        let optimizer = Sgd::from_config(&config);
        let classifier = LinearClassifier::new((1, 4, 4), 3, Some(0)).unwrap();
        let model = ClassifierWithLoss::from_config(classifier, &config, &optimizer).unwrap();
        let sink = RecordingSink::default();
        let mut trainer = trainer_with(config, Box::new(model), sink.clone());
        trainer.train(&data(2, 4)).unwrap();

        let recorded = sink.0.borrow();
        assert_eq!(recorded.train.len(), 4);
        assert_eq!(recorded.histograms.len(), 4);
        let names: Vec<String> = trainer.model().state_dict().keys().cloned().collect();
        assert_eq!(names, vec!["bias".to_string(), "weight".to_string()]);
        assert!(recorded.histograms.iter().all(|h| *h == names));
    }

    #[test]
    fn test_compile_only() {
        let config = TrainConfig {
            run_mode: RunMode::CompileOnly,
            ..base_config()
        };
        let (model, log) = ScriptedModel::new(scripted_output());
        let sink = RecordingSink::default();
        let mut trainer = trainer_with(config, Box::new(model), sink.clone());

        assert_eq!(trainer.train(&data(2, 4)).unwrap(), TrainOutcome::CompiledOnly);
        assert_eq!(log.borrow().compiled, 1);
        assert_eq!(log.borrow().steps, 0);
        assert!(sink.0.borrow().train.is_empty());
    }

    #[test]
    fn test_profile_only() {
        let config = TrainConfig {
            run_mode: RunMode::ProfileOnly,
            ..base_config()
        };
        let (model, log) = ScriptedModel::new(scripted_output());
        let mut trainer = trainer_with(config, Box::new(model), RecordingSink::default());

        assert_eq!(trainer.train(&data(2, 4)).unwrap(), TrainOutcome::ProfiledOnly);
        assert_eq!(log.borrow().steps, 1);
    }

    #[test]
    fn test_non_primary_rank_is_silent_but_checkpoints() {
        let dir = tempdir().unwrap();
        let config = TrainConfig {
            epochs: 1,
            weight_histogram: true,
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..base_config()
        };
        let (model, _) = ScriptedModel::new(scripted_output());
        let sink = RecordingSink::default();
        let optimizer = Box::new(Sgd::from_config(&config));
        let mut trainer = Trainer::new(
            config,
            Box::new(model),
            optimizer,
            Box::new(sink.clone()),
            Box::new(SecondRank),
        )
        .unwrap();
        trainer.train(&data(2, 4)).unwrap();

        assert!(sink.0.borrow().train.is_empty());
        assert!(sink.0.borrow().histograms.is_empty());
        assert_eq!(checkpoint::checkpoint_files(dir.path()).unwrap().len(), 1);
        // each rank counts the samples of all ranks, the sync averages them
        assert_eq!(trainer.state().unwrap().epoch_samples, 16);
    }

    #[test]
    fn test_resume_continues_after_checkpoint_epoch() {
        let dir = tempdir().unwrap();
        let config = TrainConfig {
            epochs: 3,
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..base_config()
        };
        let (model, _) = ScriptedModel::new(scripted_output());
        let mut first = trainer_with(
            TrainConfig { epochs: 1, ..config.clone() },
            Box::new(model),
            RecordingSink::default(),
        );
        first.train(&data(2, 4)).unwrap();
        let saved = checkpoint::load_checkpoint(checkpoint::checkpoint_path(
            dir.path(),
            "linear",
            "synthetic",
            1,
        ))
        .unwrap();

        let (model, log) = ScriptedModel::new(scripted_output());
        let sink = RecordingSink::default();
        let mut second = trainer_with(config, Box::new(model), sink.clone());
        second.resume(saved).unwrap();
        let outcome = second.train(&data(2, 4)).unwrap();

        assert_eq!(log.borrow().steps, 4);
        match outcome {
            TrainOutcome::Completed(summary) => assert_eq!(summary.epochs_completed, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(sink.0.borrow().train.iter().all(|r| r["epoch"] > 1.0));
        assert_eq!(checkpoint::checkpoint_files(dir.path()).unwrap().len(), 3);
    }

    #[test]
    fn test_validate_checkpoints_reports_each_file() {
        let dir = tempdir().unwrap();
        let config = TrainConfig {
            epochs: 2,
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..base_config()
        };
        let optimizer = Sgd::from_config(&config);
        let classifier = LinearClassifier::new((1, 4, 4), 3, Some(0)).unwrap();
        let model = ClassifierWithLoss::from_config(classifier.clone(), &config, &optimizer).unwrap();
        let mut trainer = Trainer::new(
            config.clone(),
            Box::new(model),
            Box::new(optimizer.clone()),
            Box::new(RecordingSink::default()),
            Box::new(SingleProcess),
        )
        .unwrap();
        trainer.train(&data(4, 4)).unwrap();

        let mut eval_model = ClassifierWithLoss::from_config(classifier, &config, &optimizer).unwrap();
        let mut validator = DatasetValidator::new(data(2, 4));
        let mut sink = RecordingSink::default();
        let accuracies =
            validate_checkpoints(dir.path(), &mut eval_model, &mut validator, &mut sink).unwrap();

        assert_eq!(accuracies.len(), 2);
        assert!(accuracies.iter().all(|(_, acc)| (0.0..=100.0).contains(acc)));
        let recorded = sink.0.borrow();
        assert_eq!(recorded.validation.len(), 2);
        assert_eq!(recorded.validation[1]["epoch"], 2.0);
    }

    #[test]
    fn test_empty_data_is_an_error() {
        let (model, _) = ScriptedModel::new(scripted_output());
        let mut trainer = trainer_with(base_config(), Box::new(model), RecordingSink::default());
        let empty = Dataset::synthetic(2, (1, 4, 4), 3, 4, 0).unwrap();
        assert!(matches!(
            trainer.train(&empty),
            Err(MixTrainError::Training(_))
        ));
    }
}
