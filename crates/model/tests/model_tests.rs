use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{sample_noise, ConditionalGan, GanConfig, NoisePrior};
use rand::{rngs::StdRng, SeedableRng};

fn build_gan(seed: u64) -> Result<ConditionalGan> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut config = GanConfig::new(3, 4, 2);
    config.generator_hidden_dims = vec![16, 16];
    config.critic_hidden_dims = vec![16];
    Ok(ConditionalGan::new(config, &mut rng, &Device::Cpu)?)
}

#[test]
fn generator_output_matches_structure_dim() -> Result<()> {
    let gan = build_gan(1)?;
    let mut rng = StdRng::seed_from_u64(2);
    let condition = Tensor::rand(0f32, 1., (6, 3), &Device::Cpu)?;
    let noise = sample_noise(6, gan.noise_dim(), NoisePrior::Normal, &mut rng, &Device::Cpu)?;

    let sample = gan.generate(&condition, &noise)?;
    assert_eq!(sample.dims(), &[6, 4]);
    let values = sample.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

    let score = gan.score(&sample, &condition)?;
    assert_eq!(score.dims(), &[6, 1]);
    Ok(())
}

#[test]
fn noise_batch_must_match_condition() -> Result<()> {
    let gan = build_gan(1)?;
    let condition = Tensor::zeros((4, 3), DType::F32, &Device::Cpu)?;
    let noise = Tensor::zeros((3, 2), DType::F32, &Device::Cpu)?;
    assert!(gan.generate(&condition, &noise).is_err());
    Ok(())
}

#[test]
fn clipping_bounds_every_critic_parameter() -> Result<()> {
    let gan = build_gan(4)?;
    for (_, var) in gan.discriminator_parameters() {
        let inflated = var.as_tensor().affine(0.0, 5.0)?;
        var.set(&inflated)?;
    }
    let generator_before: Vec<Vec<f32>> = gan
        .generator_parameters()
        .iter()
        .map(|(_, var)| var.as_tensor().flatten_all()?.to_vec1::<f32>())
        .collect::<candle_core::Result<_>>()?;

    gan.clip_discriminator(0.01)?;

    for (name, var) in gan.discriminator_parameters() {
        let values = var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert!(
            values.iter().all(|v| (-0.01..=0.01).contains(v)),
            "{name} escaped the clip range"
        );
    }
    let generator_after: Vec<Vec<f32>> = gan
        .generator_parameters()
        .iter()
        .map(|(_, var)| var.as_tensor().flatten_all()?.to_vec1::<f32>())
        .collect::<candle_core::Result<_>>()?;
    assert_eq!(generator_before, generator_after);
    Ok(())
}

#[test]
fn parameter_names_are_prefixed_per_network() -> Result<()> {
    let gan = build_gan(0)?;
    assert!(gan
        .generator_parameters()
        .iter()
        .all(|(name, _)| name.starts_with("generator.layers.")));
    assert!(gan
        .discriminator_parameters()
        .iter()
        .all(|(name, _)| name.starts_with("discriminator.layers.")));
    assert_eq!(
        gan.parameters().len(),
        gan.generator_parameters().len() + gan.discriminator_parameters().len()
    );
    Ok(())
}

#[test]
fn non_positive_clip_value_is_rejected() -> Result<()> {
    let gan = build_gan(0)?;
    assert!(gan.clip_discriminator(0.0).is_err());
    Ok(())
}
