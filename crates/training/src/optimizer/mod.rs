use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    config::{self, to_runtime_error, OptimizerType},
    TrainingError,
};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    /// Adam with L2 penalty folded into the gradient.
    Adam(AdamConfig),
    /// Adam with decoupled weight decay.
    AdamW(AdamConfig),
    RmsProp(RmsPropConfig),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmsPropConfig {
    pub learning_rate: f64,
    pub alpha: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    /// Builds the update rule described by `settings` at `learning_rate`.
    ///
    /// Generator, discriminator and forward model share one settings block but
    /// each carries its own learning rate.
    pub fn from_settings(settings: &config::OptimizerConfig, learning_rate: f64) -> Self {
        let adam = AdamConfig {
            learning_rate,
            beta1: settings.beta1,
            beta2: settings.beta2,
            epsilon: settings.epsilon,
            weight_decay: settings.weight_decay,
        };
        match settings.algorithm {
            OptimizerType::Adam => OptimizerConfig::Adam(adam),
            OptimizerType::AdamW => OptimizerConfig::AdamW(adam),
            OptimizerType::RmsProp => OptimizerConfig::RmsProp(RmsPropConfig {
                learning_rate,
                alpha: settings.rms_alpha,
                epsilon: settings.epsilon,
                weight_decay: 0.0,
            }),
        }
    }

    pub fn algorithm(&self) -> OptimizerType {
        match self {
            OptimizerConfig::Adam(_) => OptimizerType::Adam,
            OptimizerConfig::AdamW(_) => OptimizerType::AdamW,
            OptimizerConfig::RmsProp(_) => OptimizerType::RmsProp,
        }
    }
}

/// Optimizer over an explicit list of named parameters.
///
/// Gradients for parameters outside the list are left in the [`GradStore`],
/// so two optimizers can share one backward pass without touching each
/// other's weights.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    /// Adam first moment; unused by RMSProp.
    first_moment: Tensor,
    /// Adam second moment or RMSProp squared average.
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let second_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn algorithm(&self) -> OptimizerType {
        self.config.algorithm()
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
            OptimizerConfig::RmsProp(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::RmsProp(cfg) => cfg.learning_rate = lr,
        }
    }

    /// Applies one update using (and consuming) this optimizer's gradients.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
                processed.push((index, grad));
            }
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Adam(cfg) => self.step_adam(cfg, processed, false),
            OptimizerConfig::AdamW(cfg) => self.step_adam(cfg, processed, true),
            OptimizerConfig::RmsProp(cfg) => self.step_rms_prop(cfg, processed),
        }
    }

    fn step_adam(
        &mut self,
        cfg: AdamConfig,
        processed: Vec<(usize, Tensor)>,
        decoupled_decay: bool,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let param = slot.param.as_tensor();

            let grad = if !decoupled_decay && cfg.weight_decay != 0.0 {
                grad.add(&param.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?)
                    .map_err(to_runtime_error)?
            } else {
                grad
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - cfg.beta1, 0.0)?))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = if decoupled_decay && cfg.weight_decay != 0.0 {
                param
                    .affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                param.clone()
            };
            let next = base.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }
        Ok(())
    }

    fn step_rms_prop(
        &mut self,
        cfg: RmsPropConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        for (index, grad) in processed {
            let slot = &mut self.params[index];
            let param = slot.param.as_tensor();

            let grad = if cfg.weight_decay != 0.0 {
                grad.add(&param.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?)
                    .map_err(to_runtime_error)?
            } else {
                grad
            };

            let square_avg = slot
                .second_moment
                .affine(cfg.alpha, 0.0)
                .and_then(|s| s.add(&grad.sqr()?.affine(1.0 - cfg.alpha, 0.0)?))
                .map_err(to_runtime_error)?;
            let denom = square_avg
                .sqrt()
                .and_then(|s| s.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = grad
                .div(&denom)
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;
            let next = param.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.second_moment = square_avg;
        }
        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            parameters.push(ParameterState {
                name: slot.name.clone(),
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                shape,
            });
        }

        Ok(OptimizerState {
            algorithm: self.algorithm(),
            step: self.step,
            learning_rate: self.learning_rate(),
            parameters,
        })
    }

    /// Restores moments, step count and learning rate.
    ///
    /// The state must cover exactly this optimizer's parameters with matching
    /// shapes and the same algorithm.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        if state.algorithm != self.algorithm() {
            return Err(TrainingError::runtime(format!(
                "optimizer state was written by {} but the optimizer is {}",
                state.algorithm,
                self.algorithm()
            )));
        }

        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let param_state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != param_state.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}': expected {:?}, found {:?}",
                    slot.name, dims, param_state.shape
                )));
            }
            let expected = numel(dims);
            if expected != param_state.first_moment.len()
                || expected != param_state.second_moment.len()
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            let first = Tensor::from_vec(param_state.first_moment, dims, device)
                .map_err(to_runtime_error)?;
            let second = Tensor::from_vec(param_state.second_moment, dims, device)
                .map_err(to_runtime_error)?;
            restored.push((first, second));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = state.step;
        self.set_learning_rate(state.learning_rate);
        Ok(())
    }
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub algorithm: OptimizerType,
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar_param(value: f32) -> Var {
        Var::from_tensor(&Tensor::new(&[value], &Device::Cpu).expect("tensor")).expect("var")
    }

    fn adam(weight_decay: f64) -> AdamConfig {
        AdamConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
        }
    }

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().expect("vec")[0]
    }

    fn quadratic_grads(var: &Var) -> GradStore {
        // d/dw (w^2) = 2w
        var.as_tensor()
            .sqr()
            .and_then(|t| t.sum_all())
            .and_then(|t| t.backward())
            .expect("backward")
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() -> Result<(), TrainingError> {
        let w = scalar_param(1.0);
        let mut opt =
            TrainerOptimizer::new(vec![("w".into(), w.clone())], OptimizerConfig::Adam(adam(0.0)))?;
        let mut grads = quadratic_grads(&w);
        opt.step(&mut grads)?;
        assert!((value(&w) - 0.9).abs() < 1e-5);
        assert_eq!(opt.steps_taken(), 1);
        Ok(())
    }

    #[test]
    fn adam_w_decays_weights_before_update() -> Result<(), TrainingError> {
        let w = scalar_param(1.0);
        let mut opt = TrainerOptimizer::new(
            vec![("w".into(), w.clone())],
            OptimizerConfig::AdamW(adam(0.5)),
        )?;
        let mut grads = quadratic_grads(&w);
        opt.step(&mut grads)?;
        // 1 * (1 - 0.1 * 0.5) - 0.1
        assert!((value(&w) - 0.85).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn rms_prop_normalizes_by_square_average() -> Result<(), TrainingError> {
        let w = scalar_param(1.0);
        let cfg = RmsPropConfig {
            learning_rate: 0.01,
            alpha: 0.99,
            epsilon: 1e-8,
            weight_decay: 0.0,
        };
        let mut opt =
            TrainerOptimizer::new(vec![("w".into(), w.clone())], OptimizerConfig::RmsProp(cfg))?;
        let mut grads = quadratic_grads(&w);
        opt.step(&mut grads)?;
        // g = 2, square_avg = 0.01 * 4 = 0.04, update = 0.01 * 2 / 0.2 = 0.1
        assert!((value(&w) - 0.9).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn step_ignores_parameters_it_does_not_own() -> Result<(), TrainingError> {
        let owned = scalar_param(1.0);
        let foreign = scalar_param(2.0);
        let mut opt = TrainerOptimizer::new(
            vec![("owned".into(), owned.clone())],
            OptimizerConfig::Adam(adam(0.0)),
        )?;
        let mut grads = owned
            .as_tensor()
            .mul(foreign.as_tensor())
            .and_then(|t| t.sum_all())
            .and_then(|t| t.backward())
            .map_err(to_runtime_error)?;
        opt.step(&mut grads)?;
        assert_eq!(value(&foreign), 2.0);
        assert!(grads.get(foreign.as_tensor()).is_some());
        assert!(grads.get(owned.as_tensor()).is_none());
        Ok(())
    }

    #[test]
    fn state_round_trips_through_load() -> Result<(), TrainingError> {
        let w = scalar_param(1.0);
        let mut opt =
            TrainerOptimizer::new(vec![("w".into(), w.clone())], OptimizerConfig::Adam(adam(0.0)))?;
        let mut grads = quadratic_grads(&w);
        opt.step(&mut grads)?;
        opt.set_learning_rate(0.02);
        let state = opt.state()?;

        let mut fresh =
            TrainerOptimizer::new(vec![("w".into(), w.clone())], OptimizerConfig::Adam(adam(0.0)))?;
        fresh.load_state(state.clone())?;
        assert_eq!(fresh.state()?, state);
        assert_eq!(fresh.learning_rate(), 0.02);
        Ok(())
    }

    #[test]
    fn load_rejects_foreign_parameters() -> Result<(), TrainingError> {
        let w = scalar_param(1.0);
        let opt =
            TrainerOptimizer::new(vec![("w".into(), w.clone())], OptimizerConfig::Adam(adam(0.0)))?;
        let mut state = opt.state()?;
        state.parameters[0].name = "other".into();

        let mut target =
            TrainerOptimizer::new(vec![("w".into(), w)], OptimizerConfig::Adam(adam(0.0)))?;
        assert!(target.load_state(state).is_err());
        Ok(())
    }
}
