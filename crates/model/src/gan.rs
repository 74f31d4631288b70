//! Conditional Wasserstein GAN: a generator and a critic sharing a condition.
//!
//! The generator receives `(condition, noise)` and proposes a sample. The
//! critic receives `(sample, condition)` and returns an unbounded score per
//! row; Lipschitz control is enforced by clamping critic weights after every
//! update via [`ConditionalGan::clip_discriminator`].

use candle_core::{Device, Error, Result, Tensor, Var};
use rand::Rng;

use crate::config::GanConfig;
use crate::mlp::Mlp;

pub const GENERATOR_PREFIX: &str = "generator.";
pub const DISCRIMINATOR_PREFIX: &str = "discriminator.";

#[derive(Debug, Clone)]
pub struct ConditionalGan {
    config: GanConfig,
    generator: Mlp,
    discriminator: Mlp,
}

impl ConditionalGan {
    pub fn new<R: Rng + ?Sized>(config: GanConfig, rng: &mut R, device: &Device) -> Result<Self> {
        config.validate()?;
        let generator = Mlp::new(config.generator(), rng, device)?;
        let discriminator = Mlp::new(config.critic(), rng, device)?;
        Ok(Self {
            config,
            generator,
            discriminator,
        })
    }

    pub fn config(&self) -> &GanConfig {
        &self.config
    }

    pub fn noise_dim(&self) -> usize {
        self.config.noise_dim
    }

    /// `G(condition, noise)`, differentiable w.r.t. generator parameters.
    pub fn generate(&self, condition: &Tensor, noise: &Tensor) -> Result<Tensor> {
        let (rows, _) = condition.dims2()?;
        let (noise_rows, noise_dim) = noise.dims2()?;
        if rows != noise_rows || noise_dim != self.config.noise_dim {
            return Err(Error::Msg(format!(
                "noise shape ({noise_rows}, {noise_dim}) does not match condition batch {rows} \
                 with noise_dim {}",
                self.config.noise_dim
            )));
        }
        let input = Tensor::cat(&[condition, noise], 1)?;
        self.generator.forward(&input)
    }

    /// Generator sample cut from the autograd graph, for critic updates and
    /// evaluation.
    pub fn generate_detached(&self, condition: &Tensor, noise: &Tensor) -> Result<Tensor> {
        Ok(self.generate(condition, noise)?.detach())
    }

    /// `D(sample, condition)` with shape `(batch, 1)`.
    pub fn score(&self, sample: &Tensor, condition: &Tensor) -> Result<Tensor> {
        let input = Tensor::cat(&[sample, condition], 1)?;
        self.discriminator.forward(&input)
    }

    pub fn generator_parameters(&self) -> Vec<(String, Var)> {
        self.generator.parameters(GENERATOR_PREFIX)
    }

    pub fn discriminator_parameters(&self) -> Vec<(String, Var)> {
        self.discriminator.parameters(DISCRIMINATOR_PREFIX)
    }

    /// Generator parameters followed by critic parameters.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.generator_parameters();
        params.extend(self.discriminator_parameters());
        params
    }

    /// Clamps every critic parameter element into `[-clip_value, clip_value]`.
    pub fn clip_discriminator(&self, clip_value: f64) -> Result<()> {
        if !(clip_value.is_finite() && clip_value > 0.0) {
            return Err(Error::Msg(format!(
                "clip_value must be positive and finite (got {clip_value})"
            )));
        }
        let bound = clip_value as f32;
        for (_, var) in self.discriminator_parameters() {
            let clamped = var.as_tensor().clamp(-bound, bound)?;
            var.set(&clamped)?;
        }
        Ok(())
    }
}
