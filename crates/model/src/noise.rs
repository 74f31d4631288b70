//! Latent noise fed to the generator alongside the condition.

use std::fmt;

use candle_core::{Device, Error, Result, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

/// Distribution the latent code is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoisePrior {
    /// i.i.d. U(0, 1).
    Uniform,
    /// i.i.d. N(0, 1).
    Normal,
}

impl NoisePrior {
    pub fn code(self) -> u8 {
        match self {
            NoisePrior::Uniform => 0,
            NoisePrior::Normal => 1,
        }
    }
}

impl TryFrom<u8> for NoisePrior {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(NoisePrior::Uniform),
            1 => Ok(NoisePrior::Normal),
            other => Err(Error::Msg(format!(
                "unknown noise prior {other} (expected 0 = uniform or 1 = normal)"
            ))),
        }
    }
}

impl fmt::Display for NoisePrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoisePrior::Uniform => write!(f, "uniform"),
            NoisePrior::Normal => write!(f, "normal"),
        }
    }
}

/// Draws a `(batch_size, noise_dim)` f32 tensor from `prior`.
pub fn sample_noise<R: Rng + ?Sized>(
    batch_size: usize,
    noise_dim: usize,
    prior: NoisePrior,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let len = batch_size * noise_dim;
    let values: Vec<f32> = match prior {
        NoisePrior::Uniform => (0..len).map(|_| rng.random::<f32>()).collect(),
        NoisePrior::Normal => (0..len)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect(),
    };
    Tensor::from_vec(values, (batch_size, noise_dim), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn prior_codes_round_trip() -> Result<()> {
        for prior in [NoisePrior::Uniform, NoisePrior::Normal] {
            assert_eq!(NoisePrior::try_from(prior.code())?, prior);
        }
        assert!(NoisePrior::try_from(2).is_err());
        Ok(())
    }

    #[test]
    fn uniform_noise_stays_in_unit_interval() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let noise = sample_noise(64, 2, NoisePrior::Uniform, &mut rng, &Device::Cpu)?;
        assert_eq!(noise.dims(), &[64, 2]);
        let values = noise.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
        Ok(())
    }
}
