//! Dense affine projection backed by trainable [`Var`]s.
//!
//! Inputs are shaped `(batch, input_dim)` and outputs `(batch, output_dim)`.
//! Weights are stored `(output_dim, input_dim)` so checkpoints keep the usual
//! row-per-output layout. Initialisation draws from a caller supplied RNG so a
//! run is reproducible from a single seed.

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::Rng;
use rand_distr::StandardNormal;

/// Supported weight initialisation policies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinearInit {
    /// Weights ~ N(mean, std), biases zero. The usual DCGAN/WGAN recipe.
    Normal { mean: f32, std: f32 },
    /// Weights and biases ~ U(-1/sqrt(fan_in), 1/sqrt(fan_in)).
    FanInUniform,
}

impl LinearInit {
    /// N(0, 0.02) initialisation applied to adversarial networks.
    pub const fn gan() -> Self {
        Self::Normal {
            mean: 0.0,
            std: 0.02,
        }
    }

    fn sample_weight<R: Rng + ?Sized>(&self, rng: &mut R, fan_in: usize, len: usize) -> Vec<f32> {
        match *self {
            LinearInit::Normal { mean, std } => (0..len)
                .map(|_| mean + std * rng.sample::<f32, _>(StandardNormal))
                .collect(),
            LinearInit::FanInUniform => {
                let bound = fan_in_bound(fan_in);
                (0..len).map(|_| rng.random_range(-bound..=bound)).collect()
            }
        }
    }

    fn sample_bias<R: Rng + ?Sized>(&self, rng: &mut R, fan_in: usize, len: usize) -> Vec<f32> {
        match *self {
            LinearInit::Normal { .. } => vec![0.0; len],
            LinearInit::FanInUniform => {
                let bound = fan_in_bound(fan_in);
                (0..len).map(|_| rng.random_range(-bound..=bound)).collect()
            }
        }
    }
}

fn fan_in_bound(fan_in: usize) -> f32 {
    1.0 / (fan_in.max(1) as f32).sqrt()
}

#[derive(Debug, Clone)]
pub struct Linear {
    input_dim: usize,
    output_dim: usize,
    weight: Var,
    bias: Var,
}

impl Linear {
    /// Builds a layer with parameters drawn according to `init`.
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        output_dim: usize,
        init: &LinearInit,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(Error::Msg(format!(
                "linear dimensions must be non-zero (got {input_dim} -> {output_dim})"
            )));
        }
        let weight = init.sample_weight(rng, input_dim, input_dim * output_dim);
        let bias = init.sample_bias(rng, input_dim, output_dim);

        let weight = Tensor::from_vec(weight, (output_dim, input_dim), device)?;
        let bias = Tensor::from_vec(bias, output_dim, device)?;

        Ok(Self {
            input_dim,
            output_dim,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let (_, features) = hidden.dims2()?;
        if features != self.input_dim {
            return Err(Error::Msg(format!(
                "linear expected {} input features, got {}",
                self.input_dim, features
            )));
        }
        let hidden = if hidden.dtype() == DType::F32 {
            hidden.clone()
        } else {
            hidden.to_dtype(DType::F32)?
        };
        hidden
            .matmul(&self.weight.as_tensor().t()?)?
            .broadcast_add(self.bias.as_tensor())
    }

    /// Named parameters in a stable order (weight before bias).
    pub fn parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{prefix}.weight"), self.weight.clone()),
            (format!("{prefix}.bias"), self.bias.clone()),
        ]
    }
}
