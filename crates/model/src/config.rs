use candle_core::{Error, Result};

use crate::activation::Activation;
use crate::linear::LinearInit;

/// Shape and non-linearities of a plain multilayer perceptron.
#[derive(Debug, Clone, PartialEq)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub hidden_activation: Activation,
    pub output_activation: Activation,
    pub init: LinearInit,
}

impl MlpConfig {
    /// Regression surrogate mapping structure parameters to optical response.
    pub fn forward_surrogate(input_dim: usize, output_dim: usize, hidden_dims: Vec<usize>) -> Self {
        Self {
            input_dim,
            output_dim,
            hidden_dims,
            hidden_activation: Activation::Relu,
            output_activation: Activation::Identity,
            init: LinearInit::FanInUniform,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::Msg("input_dim must be greater than zero".into()));
        }
        if self.output_dim == 0 {
            return Err(Error::Msg("output_dim must be greater than zero".into()));
        }
        if let Some(position) = self.hidden_dims.iter().position(|dim| *dim == 0) {
            return Err(Error::Msg(format!(
                "hidden_dims[{position}] must be greater than zero"
            )));
        }
        Ok(())
    }

    /// `(in, out)` pairs for every dense layer, input first.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut widths = Vec::with_capacity(self.hidden_dims.len() + 2);
        widths.push(self.input_dim);
        widths.extend(self.hidden_dims.iter().copied());
        widths.push(self.output_dim);
        widths.windows(2).map(|pair| (pair[0], pair[1])).collect()
    }
}

/// Conditional GAN dimensions.
///
/// The generator maps `(condition, noise)` to a sample; the critic scores a
/// `(sample, condition)` pair with a single unbounded logit.
#[derive(Debug, Clone, PartialEq)]
pub struct GanConfig {
    pub condition_dim: usize,
    pub output_dim: usize,
    pub noise_dim: usize,
    pub generator_hidden_dims: Vec<usize>,
    pub critic_hidden_dims: Vec<usize>,
}

impl GanConfig {
    pub fn new(condition_dim: usize, output_dim: usize, noise_dim: usize) -> Self {
        Self {
            condition_dim,
            output_dim,
            noise_dim,
            generator_hidden_dims: vec![128, 128],
            critic_hidden_dims: vec![128, 128],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.condition_dim == 0 {
            return Err(Error::Msg("condition_dim must be greater than zero".into()));
        }
        if self.output_dim == 0 {
            return Err(Error::Msg("output_dim must be greater than zero".into()));
        }
        if self.noise_dim == 0 {
            return Err(Error::Msg("noise_dim must be greater than zero".into()));
        }
        self.generator().validate()?;
        self.critic().validate()
    }

    /// Generator: `condition ++ noise -> sample`, squashed into `(0, 1)`.
    pub fn generator(&self) -> MlpConfig {
        MlpConfig {
            input_dim: self.condition_dim + self.noise_dim,
            output_dim: self.output_dim,
            hidden_dims: self.generator_hidden_dims.clone(),
            hidden_activation: Activation::leaky(),
            output_activation: Activation::Sigmoid,
            init: LinearInit::gan(),
        }
    }

    /// Critic: `sample ++ condition -> score`.
    pub fn critic(&self) -> MlpConfig {
        MlpConfig {
            input_dim: self.output_dim + self.condition_dim,
            output_dim: 1,
            hidden_dims: self.critic_hidden_dims.clone(),
            hidden_activation: Activation::leaky(),
            output_activation: Activation::Identity,
            init: LinearInit::gan(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_dims_chain_widths() {
        let config = MlpConfig::forward_surrogate(4, 3, vec![16, 8]);
        assert_eq!(config.layer_dims(), vec![(4, 16), (16, 8), (8, 3)]);
    }

    #[test]
    fn gan_subnetworks_concatenate_inputs() {
        let config = GanConfig::new(3, 4, 2);
        assert_eq!(config.generator().input_dim, 5);
        assert_eq!(config.critic().input_dim, 7);
        assert_eq!(config.critic().output_dim, 1);
    }

    #[test]
    fn zero_noise_is_rejected() {
        assert!(GanConfig::new(3, 4, 0).validate().is_err());
    }
}
