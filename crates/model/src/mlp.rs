//! Stack of dense layers with a shared hidden activation.

use candle_core::{Device, Result, Tensor, Var};
use rand::Rng;

use crate::activation::Activation;
use crate::config::MlpConfig;
use crate::linear::Linear;

#[derive(Debug, Clone)]
pub struct Mlp {
    config: MlpConfig,
    layers: Vec<Linear>,
}

impl Mlp {
    pub fn new<R: Rng + ?Sized>(config: MlpConfig, rng: &mut R, device: &Device) -> Result<Self> {
        config.validate()?;
        let layers = config
            .layer_dims()
            .into_iter()
            .map(|(input, output)| Linear::new(input, output, &config.init, rng, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut hidden = input.clone();
        for (index, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            let activation: &Activation = if index == last {
                &self.config.output_activation
            } else {
                &self.config.hidden_activation
            };
            hidden = activation.forward(&hidden)?;
        }
        Ok(hidden)
    }

    /// Parameters named `<prefix>layers.{i}.weight|bias`.
    ///
    /// An empty prefix yields bare `layers.{i}.*` names.
    pub fn parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(index, layer)| layer.parameters(&format!("{prefix}layers.{index}")))
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters("")
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn parameter_names_follow_layer_index() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let mlp = Mlp::new(MlpConfig::forward_surrogate(4, 3, vec![8]), &mut rng, &Device::Cpu)?;
        let names: Vec<_> = mlp.parameters("").into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec!["layers.0.weight", "layers.0.bias", "layers.1.weight", "layers.1.bias"]
        );
        assert_eq!(mlp.num_parameters(), 4 * 8 + 8 + 8 * 3 + 3);
        Ok(())
    }

    #[test]
    fn forward_keeps_batch_dimension() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let mlp = Mlp::new(MlpConfig::forward_surrogate(4, 3, vec![8, 8]), &mut rng, &Device::Cpu)?;
        let input = Tensor::zeros((5, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(mlp.forward(&input)?.dims(), &[5, 3]);
        Ok(())
    }
}
