use std::collections::BTreeMap;
use std::f64::consts::PI;
use thiserror::Error;

use crate::config::{LrScheduleKind, TrainConfig};

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid schedule: {0}")]
    Invalid(String),
}

/// Loss scaling ramp: the scaling doubles at evenly spaced epochs from
/// `initial` until it reaches `max` (or the last power of two below it).
#[derive(Debug, Clone, PartialEq)]
pub struct LossScalingSchedule {
    initial: f32,
    boundaries: BTreeMap<usize, f32>,
}

impl LossScalingSchedule {
    pub fn new(initial: f32, max: f32, total_epochs: usize) -> Result<Self, ScheduleError> {
        if !(initial > 0.0) || !(max >= initial) {
            return Err(ScheduleError::Invalid(format!(
                "loss scaling needs 0 < initial <= max, got initial {} and max {}",
                initial, max
            )));
        }
        let ratio = (max / initial).floor() as u64;
        let num_steps = ratio.max(1).ilog2() as usize + 1;
        let interval = total_epochs / num_steps;

        // Colliding epochs keep the later, larger value
        let boundaries = (0..num_steps)
            .map(|i| (i * interval + 1, initial * 2f32.powi(i as i32)))
            .collect();
        Ok(Self { initial, boundaries })
    }

    pub fn from_config(config: &TrainConfig) -> Result<Self, ScheduleError> {
        Self::new(config.initial_loss_scaling, config.loss_scaling, config.epochs)
    }

    /// New scaling taking effect at the start of `epoch` (1-based), if any
    pub fn scaling_at_boundary(&self, epoch: usize) -> Option<f32> {
        self.boundaries.get(&epoch).copied()
    }

    /// Scaling in effect during `epoch`
    pub fn scaling_for_epoch(&self, epoch: usize) -> f32 {
        self.boundaries
            .range(..=epoch)
            .next_back()
            .map_or(self.initial, |(_, &scaling)| scaling)
    }

    pub fn boundaries(&self) -> &BTreeMap<usize, f32> {
        &self.boundaries
    }
}

/// Learning rate as a function of the (fractional) epoch.
///
/// The underlying schedule advances in discrete scheduler steps, `freq` of
/// them per epoch, and is scaled linearly from zero during warmup.
#[derive(Debug, Clone, PartialEq)]
pub struct LrScheduler {
    kind: LrScheduleKind,
    base_lr: f64,
    decay: f64,
    milestones: Vec<f64>,
    total_epochs: f64,
    warmup_epochs: f64,
    freq: f64,
    last_lr: f64,
}

impl LrScheduler {
    pub fn new(
        kind: LrScheduleKind,
        base_lr: f64,
        decay: f64,
        milestones: Vec<f64>,
        total_epochs: usize,
        warmup_epochs: f64,
        freq: f64,
    ) -> Result<Self, ScheduleError> {
        if !(freq > 0.0) {
            return Err(ScheduleError::Invalid(format!(
                "scheduler frequency must be positive, got {}",
                freq
            )));
        }
        if total_epochs == 0 {
            return Err(ScheduleError::Invalid("total epochs must be positive".to_string()));
        }
        let mut scheduler = Self {
            kind,
            base_lr,
            decay,
            milestones,
            total_epochs: total_epochs as f64,
            warmup_epochs,
            freq,
            last_lr: base_lr,
        };
        scheduler.last_lr = scheduler.lr_at(0.0);
        Ok(scheduler)
    }

    /// `lr_scheduler_freq == 0` means one scheduler step per iteration.
    /// A resumed run starts at `start_epoch` instead of zero.
    pub fn from_config(
        config: &TrainConfig,
        iterations_per_epoch: usize,
        start_epoch: usize,
    ) -> Result<Self, ScheduleError> {
        let freq = if config.lr_scheduler_freq > 0.0 {
            config.lr_scheduler_freq
        } else {
            iterations_per_epoch as f64
        };
        let mut scheduler = Self::new(
            config.lr_schedule,
            config.lr,
            config.lr_decay,
            config.lr_epoch_decay.clone(),
            config.epochs,
            config.warmup_epochs,
            freq,
        )?;
        scheduler.last_lr = scheduler.lr_at(start_epoch as f64);
        Ok(scheduler)
    }

    pub fn lr_at(&self, epoch: f64) -> f64 {
        let steps = (epoch * self.freq).floor();
        let lr = match self.kind {
            LrScheduleKind::Step => {
                let passed = self
                    .milestones
                    .iter()
                    .filter(|&&m| steps >= (m * self.freq).floor())
                    .count();
                self.base_lr * self.decay.powi(passed as i32)
            }
            LrScheduleKind::Cosine => {
                let t_max = self.total_epochs * self.freq;
                self.base_lr * 0.5 * (1.0 + (PI * steps.min(t_max) / t_max).cos())
            }
            LrScheduleKind::Exponential => self.base_lr * self.decay.powf(steps),
        };
        if epoch < self.warmup_epochs {
            lr * epoch / self.warmup_epochs
        } else {
            lr
        }
    }

    /// Advances to `epoch` and returns the new learning rate
    pub fn step(&mut self, epoch: f64) -> f64 {
        self.last_lr = self.lr_at(epoch);
        self.last_lr
    }

    pub fn last_lr(&self) -> f64 {
        self.last_lr
    }

    pub fn kind(&self) -> LrScheduleKind {
        self.kind
    }
}
