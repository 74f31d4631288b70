use crate::{config, TrainingError};

/// Per-epoch learning rate policy.
pub trait LRScheduler: Send {
    /// Advances one epoch and returns the learning rate for the next one.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn steps_taken(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerConfig {
    Constant {
        base_lr: f64,
    },
    StepDecay {
        base_lr: f64,
        gamma: f64,
        step_size: usize,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        step_size: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires a positive base learning rate",
            ));
        }
        if !cfg.enabled {
            return Ok(SchedulerConfig::Constant { base_lr });
        }
        if step_size == 0 {
            return Err(TrainingError::initialization(
                "step decay requires step_size greater than zero",
            ));
        }
        Ok(SchedulerConfig::StepDecay {
            base_lr,
            gamma: cfg.gamma,
            step_size,
        })
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        match self {
            SchedulerConfig::Constant { base_lr } => Ok(Box::new(Constant::new(base_lr))),
            SchedulerConfig::StepDecay {
                base_lr,
                gamma,
                step_size,
            } => Ok(Box::new(StepDecay::new(base_lr, gamma, step_size)?)),
        }
    }
}

#[derive(Debug, Clone)]
struct Constant {
    base_lr: f64,
    step: usize,
}

impl Constant {
    fn new(base_lr: f64) -> Self {
        Self { base_lr, step: 0 }
    }
}

impl LRScheduler for Constant {
    fn step(&mut self) -> f64 {
        self.step += 1;
        self.base_lr
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr
    }

    fn steps_taken(&self) -> usize {
        self.step
    }
}

/// Multiplies the rate by `gamma` every `step_size` epochs:
/// `lr = base_lr * gamma^(steps / step_size)`.
#[derive(Debug, Clone)]
pub struct StepDecay {
    base_lr: f64,
    gamma: f64,
    step_size: usize,
    step: usize,
}

impl StepDecay {
    pub fn new(base_lr: f64, gamma: f64, step_size: usize) -> Result<Self, TrainingError> {
        if step_size == 0 {
            return Err(TrainingError::initialization(
                "step decay requires step_size greater than zero",
            ));
        }
        if !(gamma > 0.0 && gamma.is_finite()) {
            return Err(TrainingError::initialization(format!(
                "step decay gamma must be positive (got {gamma})"
            )));
        }
        Ok(Self {
            base_lr,
            gamma,
            step_size,
            step: 0,
        })
    }

    fn compute_lr(&self, step: usize) -> f64 {
        let decays = (step / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }
}

impl LRScheduler for StepDecay {
    fn step(&mut self) -> f64 {
        self.step += 1;
        self.compute_lr(self.step)
    }

    fn learning_rate(&self) -> f64 {
        self.compute_lr(self.step)
    }

    fn steps_taken(&self) -> usize {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decay_drops_at_period_boundaries() -> Result<(), TrainingError> {
        let mut scheduler = StepDecay::new(1e-3, 0.2, 3)?;
        let rates: Vec<f64> = (0..7).map(|_| scheduler.step()).collect();
        let expected = [1e-3, 1e-3, 2e-4, 2e-4, 2e-4, 4e-5, 4e-5];
        for (got, want) in rates.iter().zip(expected) {
            assert!((got - want).abs() < 1e-15, "got {got} want {want}");
        }
        assert_eq!(scheduler.steps_taken(), 7);
        Ok(())
    }

    #[test]
    fn disabled_decay_builds_constant_schedule() -> Result<(), TrainingError> {
        let cfg = config::SchedulerConfig {
            enabled: false,
            ..config::SchedulerConfig::default()
        };
        let mut scheduler = SchedulerConfig::from_training_config(&cfg, 0.01, 5)?.build()?;
        for _ in 0..20 {
            assert_eq!(scheduler.step(), 0.01);
        }
        Ok(())
    }

    #[test]
    fn enabled_decay_uses_configured_gamma() -> Result<(), TrainingError> {
        let cfg = config::SchedulerConfig::default();
        let built = SchedulerConfig::from_training_config(&cfg, 0.5, 2)?;
        assert_eq!(
            built,
            SchedulerConfig::StepDecay {
                base_lr: 0.5,
                gamma: 0.2,
                step_size: 2
            }
        );
        Ok(())
    }

    #[test]
    fn zero_step_size_is_rejected() {
        assert!(StepDecay::new(1.0, 0.5, 0).is_err());
    }
}
