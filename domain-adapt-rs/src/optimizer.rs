//! Optimizers over named parameter groups (SGD with momentum, Adam).
//!
//! Every sub-module of the model (feature extractor, bottleneck, classifier,
//! discriminator) becomes one [`ParamGroup`] with its own learning rate, so
//! the schedules in [`crate::scheduler`] can decay each group from its own
//! base rate. Parameters that received no gradient in a step are skipped and
//! keep their optimizer state untouched, which matters while the
//! discriminator sits idle during warm-up.

use std::collections::{HashMap, HashSet};

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};

use crate::config::TrainingConfig;
use crate::error::{AdaptError, Result};
use crate::model::AdaptationModel;

const MOMENTUM_SLOT: &str = "momentum_buffer";
const EXP_AVG_SLOT: &str = "exp_avg";
const EXP_AVG_SQ_SLOT: &str = "exp_avg_sq";

/// Optimizer algorithm and its hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerKind {
    /// Stochastic gradient descent with heavy-ball momentum and L2 decay.
    Sgd {
        /// Momentum factor (0 disables the buffer)
        momentum: f64,
        /// L2 penalty added to the gradient
        weight_decay: f64,
    },
    /// Adam with L2 decay added to the gradient.
    Adam {
        /// First moment decay
        beta1: f64,
        /// Second moment decay
        beta2: f64,
        /// Denominator epsilon
        eps: f64,
        /// L2 penalty added to the gradient
        weight_decay: f64,
    },
}

impl OptimizerKind {
    /// Resolve the optimizer named in the training configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] for anything but `sgd` or `adam`.
    pub fn from_training_config(config: &TrainingConfig) -> Result<Self> {
        match config.opt.as_str() {
            "sgd" => Ok(Self::Sgd {
                momentum: config.momentum,
                weight_decay: config.weight_decay,
            }),
            "adam" => Ok(Self::Adam {
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: config.weight_decay,
            }),
            other => Err(AdaptError::Config(format!(
                "unknown optimizer '{other}' (expected sgd or adam)"
            ))),
        }
    }

    /// Configuration name of the optimizer.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sgd { .. } => "sgd",
            Self::Adam { .. } => "adam",
        }
    }
}

/// A named set of parameters sharing one learning rate.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Group name (the sub-module prefix)
    pub name: String,
    /// Fully qualified parameter names and their variables
    pub params: Vec<(String, Var)>,
    /// Current learning rate
    pub lr: f64,
    /// Base learning rate the schedules decay from
    pub initial_lr: f64,
}

impl ParamGroup {
    /// Create a group at the given base learning rate.
    #[must_use]
    pub fn new(name: impl Into<String>, params: Vec<(String, Var)>, lr: f64) -> Self {
        Self {
            name: name.into(),
            params,
            lr,
            initial_lr: lr,
        }
    }

    /// Number of scalar parameters in the group.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }
}

/// Build one parameter group per model sub-module, all at `lr`.
///
/// # Errors
///
/// Returns an error if the model's variable map cannot be read.
pub fn build_param_groups(model: &AdaptationModel, lr: f64) -> Result<Vec<ParamGroup>> {
    model
        .module_names()
        .into_iter()
        .map(|module| Ok(ParamGroup::new(module, model.parameters_of(module)?, lr)))
        .collect()
}

/// Optimizer holding per-parameter state for a list of [`ParamGroup`]s.
pub struct GroupedOptimizer {
    kind: OptimizerKind,
    groups: Vec<ParamGroup>,
    /// Per-parameter buffers keyed by `"{slot}.{param}"`
    slots: HashMap<String, Tensor>,
    /// Per-parameter update counts (Adam bias correction)
    steps: HashMap<String, i64>,
}

impl GroupedOptimizer {
    /// Create an optimizer over the given groups.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] if no group is given or a parameter
    /// name appears twice.
    pub fn new(kind: OptimizerKind, groups: Vec<ParamGroup>) -> Result<Self> {
        if groups.is_empty() {
            return Err(AdaptError::Config(
                "optimizer needs at least one parameter group".into(),
            ));
        }
        let mut seen = HashSet::new();
        for (name, _) in groups.iter().flat_map(|g| g.params.iter()) {
            if !seen.insert(name.as_str()) {
                return Err(AdaptError::Config(format!(
                    "parameter '{name}' assigned to more than one group"
                )));
            }
        }

        Ok(Self {
            kind,
            groups,
            slots: HashMap::new(),
            steps: HashMap::new(),
        })
    }

    /// The optimizer algorithm.
    pub fn kind(&self) -> &OptimizerKind {
        &self.kind
    }

    /// Parameter groups.
    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Mutable parameter groups (used by the schedules).
    pub fn groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// Current learning rate of every group, in group order.
    pub fn learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.lr).collect()
    }

    /// Number of trainable scalars across all groups.
    pub fn param_count(&self) -> usize {
        self.groups.iter().map(ParamGroup::elem_count).sum()
    }

    /// Backpropagate `loss` and apply one update.
    ///
    /// Each call starts from a fresh gradient store, so there is nothing to
    /// zero between steps.
    ///
    /// # Errors
    ///
    /// Returns an error if backpropagation or a tensor update fails.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Apply one update from precomputed gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor update fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let groups = std::mem::take(&mut self.groups);
        let result = self.update_groups(&groups, grads);
        self.groups = groups;
        result
    }

    fn update_groups(&mut self, groups: &[ParamGroup], grads: &GradStore) -> Result<()> {
        let kind = self.kind.clone();
        for group in groups {
            for (name, var) in &group.params {
                let Some(grad) = grads.get(var) else {
                    continue;
                };
                let grad = grad.detach();
                let param = var.as_tensor().detach();
                let updated = match kind {
                    OptimizerKind::Sgd {
                        momentum,
                        weight_decay,
                    } => self.sgd_update(name, &param, grad, group.lr, momentum, weight_decay)?,
                    OptimizerKind::Adam {
                        beta1,
                        beta2,
                        eps,
                        weight_decay,
                    } => self.adam_update(
                        name,
                        &param,
                        grad,
                        group.lr,
                        (beta1, beta2, eps),
                        weight_decay,
                    )?,
                };
                var.set(&updated)?;
            }
        }
        Ok(())
    }

    fn sgd_update(
        &mut self,
        name: &str,
        param: &Tensor,
        grad: Tensor,
        lr: f64,
        momentum: f64,
        weight_decay: f64,
    ) -> Result<Tensor> {
        let mut d_p = grad;
        if weight_decay != 0.0 {
            d_p = d_p.add(&param.affine(weight_decay, 0.0)?)?;
        }
        if momentum != 0.0 {
            let key = slot_key(MOMENTUM_SLOT, name);
            let buf = match self.slots.get(&key) {
                Some(buf) => buf.affine(momentum, 0.0)?.add(&d_p)?,
                None => d_p.clone(),
            };
            self.slots.insert(key, buf.clone());
            d_p = buf;
        }
        *self.steps.entry(name.to_string()).or_insert(0) += 1;
        Ok(param.sub(&d_p.affine(lr, 0.0)?)?)
    }

    fn adam_update(
        &mut self,
        name: &str,
        param: &Tensor,
        grad: Tensor,
        lr: f64,
        (beta1, beta2, eps): (f64, f64, f64),
        weight_decay: f64,
    ) -> Result<Tensor> {
        let mut g = grad;
        if weight_decay != 0.0 {
            g = g.add(&param.affine(weight_decay, 0.0)?)?;
        }

        let m_key = slot_key(EXP_AVG_SLOT, name);
        let v_key = slot_key(EXP_AVG_SQ_SLOT, name);
        let m = match self.slots.get(&m_key) {
            Some(m) => m.clone(),
            None => g.zeros_like()?,
        };
        let v = match self.slots.get(&v_key) {
            Some(v) => v.clone(),
            None => g.zeros_like()?,
        };

        // m = b1 * m + (1 - b1) * g ; v = b2 * v + (1 - b2) * g^2
        let m = m.affine(beta1, 0.0)?.add(&g.affine(1.0 - beta1, 0.0)?)?;
        let v = v.affine(beta2, 0.0)?.add(&g.sqr()?.affine(1.0 - beta2, 0.0)?)?;

        let step = self.steps.entry(name.to_string()).or_insert(0);
        *step += 1;
        let t = *step as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        let denom = v
            .sqrt()?
            .affine(1.0 / bias_correction2.sqrt(), eps)?;
        let update = m.div(&denom)?.affine(lr / bias_correction1, 0.0)?;

        self.slots.insert(m_key, m);
        self.slots.insert(v_key, v);
        Ok(param.sub(&update)?)
    }

    /// Snapshot of the optimizer state as named tensors.
    ///
    /// Keys: `"{slot}.{param}"` for buffers, `"step.{param}"` for update
    /// counts, `"lr.{group}"` and `"initial_lr.{group}"` for the rates.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state: HashMap<String, Tensor> = self
            .slots
            .iter()
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        for (name, step) in &self.steps {
            state.insert(format!("step.{name}"), Tensor::new(*step, &Device::Cpu)?);
        }
        for group in &self.groups {
            state.insert(
                format!("lr.{}", group.name),
                Tensor::new(group.lr, &Device::Cpu)?,
            );
            state.insert(
                format!("initial_lr.{}", group.name),
                Tensor::new(group.initial_lr, &Device::Cpu)?,
            );
        }
        Ok(state)
    }

    /// Replace the optimizer state with a snapshot from [`Self::state_dict`].
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Checkpoint`] for entries that do not match this
    /// optimizer's parameters or groups.
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let devices: HashMap<String, Device> = self
            .groups
            .iter()
            .flat_map(|g| g.params.iter())
            .map(|(name, var)| (name.clone(), var.device().clone()))
            .collect();

        let mut slots = HashMap::new();
        let mut steps = HashMap::new();
        for (key, tensor) in state {
            let (kind, target) = key.split_once('.').ok_or_else(|| {
                AdaptError::Checkpoint(format!("malformed optimizer entry '{key}'"))
            })?;
            match kind {
                "lr" | "initial_lr" => {
                    let value = tensor.to_scalar::<f64>()?;
                    let group = self
                        .groups
                        .iter_mut()
                        .find(|g| g.name == target)
                        .ok_or_else(|| {
                            AdaptError::Checkpoint(format!("unknown parameter group '{target}'"))
                        })?;
                    if kind == "lr" {
                        group.lr = value;
                    } else {
                        group.initial_lr = value;
                    }
                }
                "step" => {
                    if !devices.contains_key(target) {
                        return Err(AdaptError::Checkpoint(format!(
                            "unknown parameter '{target}' in optimizer state"
                        )));
                    }
                    steps.insert(target.to_string(), tensor.to_scalar::<i64>()?);
                }
                MOMENTUM_SLOT | EXP_AVG_SLOT | EXP_AVG_SQ_SLOT => {
                    let device = devices.get(target).ok_or_else(|| {
                        AdaptError::Checkpoint(format!(
                            "unknown parameter '{target}' in optimizer state"
                        ))
                    })?;
                    slots.insert(key.clone(), tensor.to_device(device)?);
                }
                other => {
                    return Err(AdaptError::Checkpoint(format!(
                        "unknown optimizer slot '{other}'"
                    )))
                }
            }
        }

        self.slots = slots;
        self.steps = steps;
        Ok(())
    }
}

fn slot_key(slot: &str, param: &str) -> String {
    format!("{slot}.{param}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn scalar_var(value: f32) -> Var {
        Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).unwrap()).unwrap()
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    fn sgd(momentum: f64, weight_decay: f64) -> OptimizerKind {
        OptimizerKind::Sgd {
            momentum,
            weight_decay,
        }
    }

    #[test]
    fn test_kind_from_config() {
        let mut config = TrainingConfig::default();
        config.opt = "sgd".into();
        assert_eq!(
            OptimizerKind::from_training_config(&config).unwrap().name(),
            "sgd"
        );
        config.opt = "adam".into();
        assert_eq!(
            OptimizerKind::from_training_config(&config).unwrap().name(),
            "adam"
        );
        config.opt = "lbfgs".into();
        assert!(matches!(
            OptimizerKind::from_training_config(&config),
            Err(AdaptError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_empty_and_duplicate_groups() {
        assert!(GroupedOptimizer::new(sgd(0.0, 0.0), vec![]).is_err());

        let var = scalar_var(1.0);
        let groups = vec![
            ParamGroup::new("a", vec![("w".into(), var.clone())], 0.1),
            ParamGroup::new("b", vec![("w".into(), var)], 0.1),
        ];
        assert!(GroupedOptimizer::new(sgd(0.0, 0.0), groups).is_err());
    }

    #[test]
    fn test_plain_sgd_step() -> Result<()> {
        // loss = 3w, grad = 3, w <- 1 - 0.1 * 3
        let w = scalar_var(1.0);
        let mut opt = GroupedOptimizer::new(
            sgd(0.0, 0.0),
            vec![ParamGroup::new("g", vec![("w".into(), w.clone())], 0.1)],
        )?;
        let loss = w.as_tensor().affine(3.0, 0.0)?.sum_all()?;
        opt.backward_step(&loss)?;
        assert!((value(&w) - 0.7).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_step_keeps_groups_and_their_rates() -> Result<()> {
        let a = scalar_var(1.0);
        let b = scalar_var(1.0);
        let mut opt = GroupedOptimizer::new(
            sgd(0.0, 0.0),
            vec![
                ParamGroup::new("a", vec![("a.w".into(), a.clone())], 0.1),
                ParamGroup::new("b", vec![("b.w".into(), b.clone())], 0.01),
            ],
        )?;
        for _ in 0..2 {
            let loss = a.as_tensor().add(b.as_tensor())?.sum_all()?;
            opt.backward_step(&loss)?;
        }
        assert_eq!(opt.groups().len(), 2);
        assert_eq!(opt.learning_rates(), vec![0.1, 0.01]);
        assert!((value(&a) - 0.8).abs() < 1e-6);
        assert!((value(&b) - 0.98).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_sgd_momentum_accumulates() -> Result<()> {
        let w = scalar_var(0.0);
        let mut opt = GroupedOptimizer::new(
            sgd(0.9, 0.0),
            vec![ParamGroup::new("g", vec![("w".into(), w.clone())], 1.0)],
        )?;
        // Constant gradient 1: buffers 1, 1.9 -> w = -1, -2.9
        for _ in 0..2 {
            let loss = w.as_tensor().sum_all()?;
            opt.backward_step(&loss)?;
        }
        assert!((value(&w) + 2.9).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() -> Result<()> {
        // With bias correction the first Adam step has magnitude ~lr.
        let w = scalar_var(1.0);
        let kind = OptimizerKind::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let mut opt = GroupedOptimizer::new(
            kind,
            vec![ParamGroup::new("g", vec![("w".into(), w.clone())], 0.01)],
        )?;
        let loss = w.as_tensor().affine(5.0, 0.0)?.sum_all()?;
        opt.backward_step(&loss)?;
        assert!((value(&w) - 0.99).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_params_without_grad_are_skipped() -> Result<()> {
        let used = scalar_var(1.0);
        let idle = scalar_var(1.0);
        let mut opt = GroupedOptimizer::new(
            sgd(0.9, 0.1),
            vec![
                ParamGroup::new("used", vec![("used.w".into(), used.clone())], 0.1),
                ParamGroup::new("idle", vec![("idle.w".into(), idle.clone())], 0.1),
            ],
        )?;
        let loss = used.as_tensor().sum_all()?;
        opt.backward_step(&loss)?;

        assert_eq!(value(&idle), 1.0);
        let state = opt.state_dict()?;
        assert!(state.contains_key("momentum_buffer.used.w"));
        assert!(!state.contains_key("momentum_buffer.idle.w"));
        Ok(())
    }

    #[test]
    fn test_state_dict_roundtrip() -> Result<()> {
        let w = Var::from_tensor(&Tensor::new(&[0.5f32, -0.25], &Device::Cpu)?)?;
        let kind = OptimizerKind::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-4,
        };
        let groups = vec![ParamGroup::new("g", vec![("g.w".into(), w.clone())], 1e-3)];
        let mut opt = GroupedOptimizer::new(kind.clone(), groups.clone())?;
        for _ in 0..3 {
            let loss = w.as_tensor().sqr()?.sum_all()?;
            opt.backward_step(&loss)?;
        }
        opt.groups_mut()[0].lr = 5e-4;

        let state = opt.state_dict()?;
        let mut restored = GroupedOptimizer::new(kind, groups)?;
        restored.load_state_dict(&state)?;

        assert_eq!(restored.learning_rates(), vec![5e-4]);
        let restored_state = restored.state_dict()?;
        assert_eq!(state.len(), restored_state.len());
        for (key, tensor) in &state {
            let other = &restored_state[key];
            match tensor.dtype() {
                DType::F32 => assert_eq!(
                    tensor.flatten_all()?.to_vec1::<f32>()?,
                    other.flatten_all()?.to_vec1::<f32>()?
                ),
                DType::I64 => assert_eq!(tensor.to_scalar::<i64>()?, other.to_scalar::<i64>()?),
                DType::F64 => assert_eq!(tensor.to_scalar::<f64>()?, other.to_scalar::<f64>()?),
                other => panic!("unexpected dtype {other:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn test_load_rejects_unknown_param() -> Result<()> {
        let w = scalar_var(1.0);
        let mut opt = GroupedOptimizer::new(
            sgd(0.9, 0.0),
            vec![ParamGroup::new("g", vec![("g.w".into(), w)], 0.1)],
        )?;
        let mut state = HashMap::new();
        state.insert(
            "momentum_buffer.other.w".to_string(),
            Tensor::new(&[1f32], &Device::Cpu)?,
        );
        assert!(matches!(
            opt.load_state_dict(&state),
            Err(AdaptError::Checkpoint(_))
        ));
        Ok(())
    }
}
