use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::config::to_runtime_error;
use crate::TrainingError;

/// Batch-size weighted running mean over one pass of a loader.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    weighted_sum: f64,
    samples: usize,
}

impl EpochAccumulator {
    pub fn add(&mut self, value: f64, batch_len: usize) {
        self.weighted_sum += value * batch_len as f64;
        self.samples += batch_len;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Weighted mean, `0.0` for an empty pass.
    pub fn mean(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.weighted_sum / self.samples as f64
        }
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSummary {
    pub loss: f64,
    /// Inverse-design RMSE in raw response units (GAN runs only).
    pub rmse: Option<f64>,
}

/// Per-epoch loss history laid out `[channels, epochs]`.
///
/// GAN runs use three channels (train loss, validation loss, validation
/// RMSE); forward-surrogate runs use two (train loss, validation loss).
#[derive(Debug, Clone, PartialEq)]
pub struct LossHistory {
    channels: usize,
    epochs: usize,
    values: Vec<f64>,
    recorded: usize,
}

impl LossHistory {
    pub fn new(channels: usize, epochs: usize) -> Self {
        Self {
            channels,
            epochs,
            values: vec![0.0; channels * epochs],
            recorded: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    /// Number of leading epochs that have been written.
    pub fn recorded_epochs(&self) -> usize {
        self.recorded
    }

    pub fn record(&mut self, epoch: usize, row: &[f64]) -> Result<(), TrainingError> {
        if epoch >= self.epochs {
            return Err(TrainingError::runtime(format!(
                "epoch {epoch} is outside the loss history ({} epochs)",
                self.epochs
            )));
        }
        if row.len() != self.channels {
            return Err(TrainingError::runtime(format!(
                "loss history expects {} channels, got {}",
                self.channels,
                row.len()
            )));
        }
        for (channel, value) in row.iter().enumerate() {
            self.values[channel * self.epochs + epoch] = *value;
        }
        self.recorded = self.recorded.max(epoch + 1);
        Ok(())
    }

    pub fn get(&self, channel: usize, epoch: usize) -> Option<f64> {
        (channel < self.channels && epoch < self.epochs)
            .then(|| self.values[channel * self.epochs + epoch])
    }

    pub fn channel(&self, channel: usize) -> &[f64] {
        &self.values[channel * self.epochs..(channel + 1) * self.epochs]
    }

    /// Smallest value of `channel` among the recorded epochs.
    pub fn best(&self, channel: usize) -> Option<f64> {
        if channel >= self.channels {
            return None;
        }
        self.channel(channel)[..self.recorded]
            .iter()
            .copied()
            .reduce(f64::min)
    }

    /// Grows (or keeps) the epoch axis, preserving recorded values.
    pub fn with_epochs(&self, epochs: usize) -> Self {
        let epochs = epochs.max(self.recorded);
        let mut resized = Self::new(self.channels, epochs);
        for channel in 0..self.channels {
            let keep = self.epochs.min(epochs);
            resized.values[channel * epochs..channel * epochs + keep]
                .copy_from_slice(&self.channel(channel)[..keep]);
        }
        resized.recorded = self.recorded;
        resized
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor, TrainingError> {
        Tensor::from_vec(self.values.clone(), (self.channels, self.epochs), device)
            .map_err(to_runtime_error)
    }

    /// Rebuilds a history from a `[channels, epochs]` tensor plus the number
    /// of epochs that were written.
    pub fn from_tensor(tensor: &Tensor, recorded: usize) -> Result<Self, TrainingError> {
        let (channels, epochs) = tensor.dims2().map_err(to_runtime_error)?;
        if recorded > epochs {
            return Err(TrainingError::runtime(format!(
                "loss history records {recorded} epochs but only holds {epochs}"
            )));
        }
        let values = tensor
            .to_dtype(DType::F64)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f64>())
            .map_err(to_runtime_error)?;
        Ok(Self {
            channels,
            epochs,
            values,
            recorded,
        })
    }

    /// Writes `epoch,<names...>` rows for every recorded epoch.
    pub fn write_csv(&self, path: &Path, names: &[&str]) -> Result<(), TrainingError> {
        if names.len() != self.channels {
            return Err(TrainingError::runtime(format!(
                "expected {} channel names, got {}",
                self.channels,
                names.len()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["epoch"];
        header.extend_from_slice(names);
        writer.write_record(&header)?;
        for epoch in 0..self.recorded {
            let mut record = vec![epoch.to_string()];
            record.extend((0..self.channels).map(|c| self.values[c * self.epochs + epoch].to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// `sqrt(sum over channels of mean over samples of (truth - prediction)^2)`.
///
/// Both slices are row-major with `width` values per sample.
pub fn inverse_design_rmse(
    truth: &[f32],
    prediction: &[f32],
    width: usize,
) -> Result<f64, TrainingError> {
    if width == 0 || truth.len() != prediction.len() || truth.len() % width != 0 {
        return Err(TrainingError::runtime(format!(
            "rmse inputs disagree: {} truth values, {} predictions, width {}",
            truth.len(),
            prediction.len(),
            width
        )));
    }
    let samples = truth.len() / width;
    if samples == 0 {
        return Err(TrainingError::runtime("rmse requires at least one sample"));
    }
    let mut per_channel = vec![0.0f64; width];
    for (index, (t, p)) in truth.iter().zip(prediction).enumerate() {
        let diff = f64::from(*t) - f64::from(*p);
        per_channel[index % width] += diff * diff;
    }
    let total: f64 = per_channel.iter().map(|sum| sum / samples as f64).sum();
    Ok(total.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_weights_by_batch_length() {
        let mut acc = EpochAccumulator::default();
        acc.add(1.0, 4);
        acc.add(4.0, 2);
        assert_eq!(acc.samples(), 6);
        assert!((acc.mean() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rmse_is_zero_for_identical_inputs() -> Result<(), TrainingError> {
        let values = [0.2f32, 0.4, 0.6, 0.1, 0.3, 0.5];
        assert_eq!(inverse_design_rmse(&values, &values, 3)?, 0.0);
        Ok(())
    }

    #[test]
    fn rmse_sums_channel_means() -> Result<(), TrainingError> {
        let truth = [0.0f32, 0.0, 0.0, 0.0];
        let pred = [1.0f32, 2.0, 3.0, 2.0];
        // channel 0: (1 + 9) / 2 = 5, channel 1: (4 + 4) / 2 = 4
        let rmse = inverse_design_rmse(&truth, &pred, 2)?;
        assert!((rmse - 3.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn history_tracks_best_over_recorded_epochs() -> Result<(), TrainingError> {
        let mut history = LossHistory::new(3, 5);
        history.record(0, &[1.0, 0.9, 0.7])?;
        history.record(1, &[0.8, 0.7, 0.4])?;
        history.record(2, &[0.6, 0.5, 0.6])?;
        assert_eq!(history.recorded_epochs(), 3);
        assert_eq!(history.best(2), Some(0.4));
        assert_eq!(history.get(1, 2), Some(0.5));
        assert!(history.record(5, &[0.0, 0.0, 0.0]).is_err());
        assert!(history.record(3, &[0.0]).is_err());
        Ok(())
    }

    #[test]
    fn history_survives_tensor_conversion() -> Result<(), TrainingError> {
        let mut history = LossHistory::new(2, 4);
        history.record(0, &[0.123456789012345, 1e-17])?;
        history.record(1, &[3.5, -2.25])?;
        let tensor = history.to_tensor(&Device::Cpu)?;
        assert_eq!(tensor.dtype(), DType::F64);
        let restored = LossHistory::from_tensor(&tensor, history.recorded_epochs())?;
        assert_eq!(restored, history);
        Ok(())
    }

    #[test]
    fn growing_history_keeps_values() -> Result<(), TrainingError> {
        let mut history = LossHistory::new(2, 2);
        history.record(1, &[5.0, 6.0])?;
        let grown = history.with_epochs(4);
        assert_eq!(grown.epochs(), 4);
        assert_eq!(grown.get(0, 1), Some(5.0));
        assert_eq!(grown.get(1, 1), Some(6.0));
        assert_eq!(grown.get(1, 3), Some(0.0));
        Ok(())
    }

    #[test]
    fn csv_export_lists_recorded_epochs() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run_loss.csv");
        let mut history = LossHistory::new(2, 10);
        history.record(0, &[1.0, 2.0])?;
        history.record(1, &[0.5, 1.5])?;
        history.write_csv(&path, &["train_loss", "val_loss"])?;
        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(
            contents.lines().collect::<Vec<_>>(),
            vec!["epoch,train_loss,val_loss", "0,1,2", "1,0.5,1.5"]
        );
        Ok(())
    }
}
