use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::{OptimizerKind, TrainConfig};
use crate::model::ParamMut;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Optimization failed: {0}")]
    Optimization(String),
    #[error("Incompatible optimizer state: {0}")]
    State(String),
}

/// Per-group hyperparameters. Group 0 holds regularized parameters, group 1
/// holds 1-D parameters (biases, norm scales) which are never weight-decayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub weight_decay: f32,
    /// Scale of the stored velocity; only the combined SGD variant carries one
    pub velocity_scaling: Option<f32>,
}

/// Momentum buffer, stored multiplied by the velocity scaling it was built with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityBuffer {
    pub scaling: f32,
    pub value: ArrayD<f32>,
}

/// Serializable snapshot of an optimizer, stored in checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    pub momentum: f32,
    pub loss_scaling: f32,
    pub param_groups: Vec<ParamGroup>,
    pub step: u64,
    pub velocities: BTreeMap<String, VelocityBuffer>,
}

/// Optimizer driven by the training loop. Gradients handed to `step` are
/// assumed to be multiplied by `loss_scaling`.
pub trait Optimizer {
    fn kind(&self) -> OptimizerKind;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn loss_scaling(&self) -> f32;

    fn set_loss_scaling(&mut self, loss_scaling: f32);

    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Updates every parameter from its accumulated gradient
    fn step(&mut self, params: Vec<ParamMut<'_>>) -> Result<(), OptimizerError>;

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimizerError>;

    fn box_clone(&self) -> Box<dyn Optimizer>;

    fn uses_velocity_scaling(&self) -> bool {
        self.kind() == OptimizerKind::SgdCombined
    }

    /// Copies the live hyperparameters of `other`, keeping local buffers
    fn sync_hyperparameters(&mut self, other: &dyn Optimizer) -> Result<(), OptimizerError> {
        if self.param_groups().len() != other.param_groups().len() {
            return Err(OptimizerError::State(format!(
                "expected {} parameter groups, got {}",
                self.param_groups().len(),
                other.param_groups().len()
            )));
        }
        self.set_learning_rate(other.learning_rate());
        self.set_loss_scaling(other.loss_scaling());
        self.param_groups_mut().clone_from_slice(other.param_groups());
        Ok(())
    }
}

impl Clone for Box<dyn Optimizer> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// SGD with momentum, weight decay and loss scaling.
///
/// The combined variant keeps its velocity multiplied by the group's
/// `velocity_scaling`; buffers are rescaled whenever that value changes.
#[derive(Debug, Clone)]
pub struct Sgd {
    kind: OptimizerKind,
    learning_rate: f64,
    momentum: f32,
    loss_scaling: f32,
    param_groups: Vec<ParamGroup>,
    step: u64,
    velocities: BTreeMap<String, VelocityBuffer>,
}

impl Sgd {
    pub fn new(
        kind: OptimizerKind,
        learning_rate: f64,
        momentum: f32,
        weight_decay: f32,
        loss_scaling: f32,
        velocity_scaling: Option<f32>,
    ) -> Self {
        let velocity_scaling = match kind {
            OptimizerKind::Sgd => None,
            OptimizerKind::SgdCombined => Some(velocity_scaling.unwrap_or(1.0)),
        };
        Self {
            kind,
            learning_rate,
            momentum,
            loss_scaling,
            param_groups: vec![
                ParamGroup {
                    weight_decay,
                    velocity_scaling,
                },
                ParamGroup {
                    weight_decay: 0.0,
                    velocity_scaling,
                },
            ],
            step: 0,
            velocities: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &TrainConfig) -> Self {
        Self::new(
            config.optimizer,
            config.lr,
            config.momentum,
            config.weight_decay,
            config.initial_loss_scaling,
            Some(config.initial_loss_scaling / config.loss_velocity_scaling_ratio),
        )
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    fn group_index(param: &ParamMut<'_>) -> usize {
        if param.value.ndim() <= 1 {
            1
        } else {
            0
        }
    }
}

impl Optimizer for Sgd {
    fn kind(&self) -> OptimizerKind {
        self.kind
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn loss_scaling(&self) -> f32 {
        self.loss_scaling
    }

    fn set_loss_scaling(&mut self, loss_scaling: f32) {
        self.loss_scaling = loss_scaling;
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.param_groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.param_groups
    }

    fn step(&mut self, params: Vec<ParamMut<'_>>) -> Result<(), OptimizerError> {
        if !(self.loss_scaling > 0.0) {
            return Err(OptimizerError::Optimization(format!(
                "loss scaling must be positive, got {}",
                self.loss_scaling
            )));
        }
        let lr = self.learning_rate as f32;
        let loss_scaling = self.loss_scaling;
        let momentum = self.momentum;

        for mut param in params {
            let group = &self.param_groups[Self::group_index(&param)];
            let mut update = param.grad.mapv(|g| g / loss_scaling);
            if group.weight_decay != 0.0 {
                update.scaled_add(group.weight_decay, &param.value);
            }

            if momentum != 0.0 {
                let scaling = group.velocity_scaling.unwrap_or(1.0);
                let buffer = self
                    .velocities
                    .entry(param.name.to_string())
                    .or_insert_with(|| VelocityBuffer {
                        scaling,
                        value: ArrayD::zeros(param.value.raw_dim()),
                    });
                if buffer.value.shape() != param.value.shape() {
                    return Err(OptimizerError::State(format!(
                        "velocity of {} has shape {:?}, parameter has {:?}",
                        param.name,
                        buffer.value.shape(),
                        param.value.shape()
                    )));
                }
                if buffer.scaling != scaling {
                    let factor = scaling / buffer.scaling;
                    buffer.value.mapv_inplace(|v| v * factor);
                    buffer.scaling = scaling;
                }
                buffer.value.mapv_inplace(|v| v * momentum);
                buffer.value.scaled_add(scaling, &update);
                update = buffer.value.mapv(|v| v / scaling);
            }

            param.value.scaled_add(-lr, &update);
        }
        self.step += 1;
        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind,
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            loss_scaling: self.loss_scaling,
            param_groups: self.param_groups.clone(),
            step: self.step,
            velocities: self.velocities.clone(),
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), OptimizerError> {
        if state.kind != self.kind {
            return Err(OptimizerError::State(format!(
                "cannot load {:?} state into {:?} optimizer",
                state.kind, self.kind
            )));
        }
        self.learning_rate = state.learning_rate;
        self.momentum = state.momentum;
        self.loss_scaling = state.loss_scaling;
        self.param_groups = state.param_groups;
        self.step = state.step;
        self.velocities = state.velocities;
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classifier, LinearClassifier, Param};
    use ndarray::{array, Ix1, Ix2};

    fn params<'a>(w: &'a mut Param<Ix2>, b: &'a mut Param<Ix1>) -> Vec<ParamMut<'a>> {
        vec![w.view_mut("weight"), b.view_mut("bias")]
    }

    #[test]
    fn test_plain_sgd_step() {
        let mut opt = Sgd::new(OptimizerKind::Sgd, 0.1, 0.0, 0.0, 1.0, None);
        let mut w = Param::new(array![[1.0f32, 2.0]]);
        let mut b = Param::new(array![0.5f32]);
        w.grad = array![[1.0f32, -1.0]];
        b.grad = array![2.0f32];

        opt.step(params(&mut w, &mut b)).unwrap();
        assert!((w.value[[0, 0]] - 0.9).abs() < 1e-6);
        assert!((w.value[[0, 1]] - 2.1).abs() < 1e-6);
        assert!((b.value[0] - 0.3).abs() < 1e-6);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_loss_scaling_unscales_gradients() {
        let mut scaled = Sgd::new(OptimizerKind::Sgd, 0.1, 0.9, 0.0, 128.0, None);
        let mut unscaled = Sgd::new(OptimizerKind::Sgd, 0.1, 0.9, 0.0, 1.0, None);
        let mut w1 = Param::new(array![[1.0f32]]);
        let mut b1 = Param::new(array![0.0f32]);
        let mut w2 = w1.clone();
        let mut b2 = b1.clone();

        for _ in 0..3 {
            w1.grad = array![[0.5f32 * 128.0]];
            w2.grad = array![[0.5f32]];
            scaled.step(params(&mut w1, &mut b1)).unwrap();
            unscaled.step(params(&mut w2, &mut b2)).unwrap();
        }
        assert!((w1.value[[0, 0]] - w2.value[[0, 0]]).abs() < 1e-5);
    }

    #[test]
    fn test_bias_group_has_no_weight_decay() {
        let mut opt = Sgd::new(OptimizerKind::Sgd, 1.0, 0.0, 0.5, 1.0, None);
        let mut w = Param::new(array![[2.0f32]]);
        let mut b = Param::new(array![2.0f32]);

        opt.step(params(&mut w, &mut b)).unwrap();
        assert!((w.value[[0, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(b.value[0], 2.0);
        assert_eq!(opt.param_groups()[1].weight_decay, 0.0);
    }

    #[test]
    fn test_velocity_scaling_change_keeps_trajectory() {
        let mut combined = Sgd::new(OptimizerKind::SgdCombined, 0.1, 0.9, 0.0, 1.0, Some(1.0));
        let mut plain = Sgd::new(OptimizerKind::Sgd, 0.1, 0.9, 0.0, 1.0, None);
        let mut w1 = Param::new(array![[1.0f32]]);
        let mut b1 = Param::new(array![0.0f32]);
        let mut w2 = w1.clone();
        let mut b2 = b1.clone();

        for step in 0..4 {
            if step == 2 {
                for group in combined.param_groups_mut() {
                    group.velocity_scaling = Some(64.0);
                }
            }
            w1.grad = array![[0.25f32]];
            w2.grad = array![[0.25f32]];
            combined.step(params(&mut w1, &mut b1)).unwrap();
            plain.step(params(&mut w2, &mut b2)).unwrap();
        }
        assert!((w1.value[[0, 0]] - w2.value[[0, 0]]).abs() < 1e-5);
        assert_eq!(combined.state().velocities["weight"].scaling, 64.0);
    }

    #[test]
    fn test_state_round_trip_and_kind_check() {
        let mut model = LinearClassifier::new((1, 1, 2), 2, Some(0)).unwrap();
        let mut opt = Sgd::new(OptimizerKind::Sgd, 0.1, 0.9, 0.0, 1.0, None);
        model.weight.grad.fill(1.0);
        opt.step(model.params_mut()).unwrap();

        let mut restored = Sgd::new(OptimizerKind::Sgd, 0.5, 0.9, 0.0, 1.0, None);
        restored.load_state(opt.state()).unwrap();
        assert_eq!(restored.state(), opt.state());

        let mut other = Sgd::new(OptimizerKind::SgdCombined, 0.1, 0.9, 0.0, 1.0, None);
        assert!(matches!(
            other.load_state(opt.state()),
            Err(OptimizerError::State(_))
        ));
    }

    #[test]
    fn test_sync_hyperparameters() {
        let mut host = Sgd::new(OptimizerKind::SgdCombined, 0.1, 0.9, 0.0, 1.0, Some(1.0));
        let mut device = host.clone();
        host.set_learning_rate(0.01);
        host.set_loss_scaling(256.0);
        host.param_groups_mut()[0].velocity_scaling = Some(16.0);

        device.sync_hyperparameters(&host).unwrap();
        assert_eq!(device.learning_rate(), 0.01);
        assert_eq!(device.loss_scaling(), 256.0);
        assert_eq!(device.param_groups()[0].velocity_scaling, Some(16.0));
        assert!(device.uses_velocity_scaling());
    }

    #[test]
    fn test_from_config_velocity_scaling() {
        let config = TrainConfig {
            optimizer: OptimizerKind::SgdCombined,
            initial_loss_scaling: 64.0,
            loss_scaling: 64.0,
            loss_velocity_scaling_ratio: 4.0,
            ..TrainConfig::default()
        };
        let opt = Sgd::from_config(&config);
        assert_eq!(opt.loss_scaling(), 64.0);
        assert!(opt.param_groups().iter().all(|g| g.velocity_scaling == Some(16.0)));

        let plain = Sgd::from_config(&TrainConfig::default());
        assert!(plain.param_groups().iter().all(|g| g.velocity_scaling.is_none()));
    }
}
