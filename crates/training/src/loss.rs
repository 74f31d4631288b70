use candle_core::Tensor;

use crate::config::to_runtime_error;
use crate::TrainingError;

/// Wasserstein critic objective `mean(D(fake)) - mean(D(real))`.
///
/// Minimizing it widens the score gap between real and generated samples.
pub fn critic_loss(real_scores: &Tensor, fake_scores: &Tensor) -> Result<Tensor, TrainingError> {
    ensure_scores(real_scores)?;
    ensure_scores(fake_scores)?;
    let real = real_scores.mean_all().map_err(to_runtime_error)?;
    let fake = fake_scores.mean_all().map_err(to_runtime_error)?;
    fake.sub(&real).map_err(to_runtime_error)
}

/// Generator objective `-mean(D(fake))`.
pub fn generator_loss(fake_scores: &Tensor) -> Result<Tensor, TrainingError> {
    ensure_scores(fake_scores)?;
    fake_scores
        .mean_all()
        .and_then(|mean| mean.neg())
        .map_err(to_runtime_error)
}

/// Mean squared error averaged over every element.
pub fn mse(predictions: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    if predictions.dims() != targets.dims() {
        return Err(TrainingError::runtime(format!(
            "mse shape mismatch: predictions {:?} vs targets {:?}",
            predictions.dims(),
            targets.dims()
        )));
    }
    predictions
        .sub(targets)
        .and_then(|diff| diff.sqr())
        .and_then(|sq| sq.mean_all())
        .map_err(to_runtime_error)
}

/// Reads a finite scalar out of a zero-dimensional loss tensor.
pub fn scalar(loss: &Tensor, label: &str) -> Result<f64, TrainingError> {
    let value = loss
        .to_dtype(candle_core::DType::F64)
        .and_then(|t| t.to_scalar::<f64>())
        .map_err(to_runtime_error)?;
    if !value.is_finite() {
        return Err(TrainingError::runtime(format!(
            "{label} became non-finite ({value})"
        )));
    }
    Ok(value)
}

fn ensure_scores(scores: &Tensor) -> Result<(), TrainingError> {
    if scores.elem_count() == 0 {
        return Err(TrainingError::runtime("critic produced no scores"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn column(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, (values.len(), 1), &Device::Cpu).expect("tensor")
    }

    #[test]
    fn critic_loss_is_fake_minus_real() -> Result<(), TrainingError> {
        let loss = critic_loss(&column(&[1.0, 3.0]), &column(&[0.5, 0.5]))?;
        assert!((scalar(&loss, "d_loss")? - (0.5 - 2.0)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn generator_loss_negates_fake_mean() -> Result<(), TrainingError> {
        let loss = generator_loss(&column(&[2.0, -1.0, 5.0]))?;
        assert!((scalar(&loss, "g_loss")? + 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn mse_averages_all_elements() -> Result<(), TrainingError> {
        let pred = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu)
            .map_err(to_runtime_error)?;
        let target = Tensor::from_slice(&[1.0f32, 0.0, 3.0, 2.0], (2, 2), &Device::Cpu)
            .map_err(to_runtime_error)?;
        assert!((scalar(&mse(&pred, &target)?, "mse")? - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn non_finite_scalar_is_an_error() {
        let nan = Tensor::new(f32::NAN, &Device::Cpu).expect("tensor");
        assert!(scalar(&nan, "loss").is_err());
    }
}
