//! Epoch drivers for the forward surrogate and the conditional WGAN.
//!
//! Both trainers run a single-threaded loop: one pass over the training
//! loader, one evaluation pass, a loss-history row, the best/temp checkpoint
//! policy and a learning-rate step. A shutdown predicate is polled between
//! epochs so an interrupted run leaves consistent checkpoints behind.

mod forward;
mod gan;

pub use forward::ForwardTrainer;
pub use gan::{AdversarialEpoch, BatchLosses, GanTrainer};

use std::path::{Path, PathBuf};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use model::{Mlp, MlpConfig};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint::{CheckpointRecord, BEST_METRIC_SENTINEL},
    config::{to_runtime_error, DevicePreference, ModelKind, ResolvedHyperparameters},
    data::{get_dataloaders, DataLoaders, LoaderSettings, PairedDataset},
    logging::{Logger, LoggingSettings},
    metrics::LossHistory,
    TrainingConfig, TrainingError,
};

/// How a call to `train_with_shutdown` ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub epochs_completed: usize,
    pub best_metric: f64,
    pub interrupted: bool,
    pub best_path: PathBuf,
    pub temp_path: PathBuf,
}

/// Either trainer, chosen by [`ModelKind`].
pub enum Trainer {
    Forward(ForwardTrainer),
    Gan(GanTrainer),
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        match config.kind {
            ModelKind::ForwardModel => Ok(Trainer::Forward(ForwardTrainer::new(config)?)),
            ModelKind::Gan => Ok(Trainer::Gan(GanTrainer::new(config)?)),
        }
    }

    /// Continues from the run's temp checkpoint when one exists, returning the
    /// epoch it was written at.
    pub fn resume_from_temp(&mut self) -> Result<Option<usize>, TrainingError> {
        match self {
            Trainer::Forward(trainer) => trainer.resume_from_temp(),
            Trainer::Gan(trainer) => trainer.resume_from_temp(),
        }
    }

    pub fn train(&mut self) -> Result<RunSummary, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    pub fn train_with_shutdown<F>(&mut self, should_stop: F) -> Result<RunSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        match self {
            Trainer::Forward(trainer) => trainer.train_with_shutdown(should_stop),
            Trainer::Gan(trainer) => trainer.train_with_shutdown(should_stop),
        }
    }
}

pub fn select_device(preference: DevicePreference) -> Device {
    if preference == DevicePreference::Cpu {
        println!("device: using CPU (requested)");
        return Device::Cpu;
    }

    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    println!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available, metal_available
    );

    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                println!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => eprintln!(
                "failed to initialize metal device, falling back to CPU: {}",
                err
            ),
        }
    } else if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                println!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => eprintln!("cuda reported available but initialization failed: {err}"),
        }
    } else {
        eprintln!("no GPU backend available; using CPU");
    }
    Device::Cpu
}

/// Loads the frozen structure -> response surrogate from a forward-model
/// checkpoint. The architecture comes from the configuration embedded in the
/// checkpoint.
pub fn load_forward_surrogate(path: &Path, device: &Device) -> Result<Mlp, TrainingError> {
    let record = CheckpointRecord::load(path, device).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to load forward model {}: {err}",
            path.display()
        ))
    })?;
    if record.config.kind != ModelKind::ForwardModel {
        return Err(TrainingError::initialization(format!(
            "{} was written by a {} run, expected forward_model",
            path.display(),
            record.config.kind
        )));
    }
    let resolved = record.config.resolve()?;
    let mlp_config =
        MlpConfig::forward_surrogate(resolved.input_dim, resolved.output_dim, resolved.hidden_dims);
    // Weights are overwritten below; the seed only fixes the throwaway init.
    let mut rng = StdRng::seed_from_u64(0);
    let surrogate = Mlp::new(mlp_config, &mut rng, device).map_err(to_runtime_error)?;
    record.apply_model_state(&surrogate.parameters(""))?;
    Ok(surrogate)
}

/// Reads the configured CSV and builds the three loaders for `config.kind`.
pub fn build_dataloaders(
    config: &TrainingConfig,
    device: &Device,
) -> Result<DataLoaders, TrainingError> {
    let dataset = PairedDataset::from_csv(
        &config.data.path,
        config.data.structure_dim,
        config.data.response_dim,
        config.data.has_headers,
    )?;
    let settings = LoaderSettings {
        batch_size: config.data.batch_size,
        shuffle: config.data.shuffle,
        validation_fraction: config.data.validation_fraction,
        test_fraction: config.data.test_fraction,
        seed: config.runtime.seed,
    };
    get_dataloaders(config.kind, &dataset, &settings, device)
}

pub(crate) fn build_logger(config: &TrainingConfig) -> Result<Logger, TrainingError> {
    let logging = &config.runtime.logging;
    Logger::new(LoggingSettings::from_config(
        logging.enable_stdout,
        logging.tensorboard_dir.clone(),
        logging.tensorboard_flush_every_n,
    ))
}

/// RNG stream for a run resumed at `epoch`, distinct from the fresh-run stream.
pub(crate) fn resumed_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_add((epoch as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

/// Threshold a resumed run continues from: the lower of the resumed history's
/// best and the metric the run's best checkpoint was saved with. The temp
/// file may predate the best file by several epochs.
pub(crate) fn resumed_best_metric(
    history: &LossHistory,
    channel: usize,
    best_path: &Path,
    device: &Device,
) -> Result<f64, TrainingError> {
    let mut best = history.best(channel).unwrap_or(BEST_METRIC_SENTINEL);
    if best_path.is_file() {
        let record = CheckpointRecord::load(best_path, device)?;
        if let Some(stored) = record.loss_history.get(channel, record.epoch) {
            best = best.min(stored);
        }
    }
    Ok(best.min(BEST_METRIC_SENTINEL))
}

pub(crate) fn ensure_kind(
    resolved: &ResolvedHyperparameters,
    expected: ModelKind,
) -> Result<(), TrainingError> {
    if resolved.kind != expected {
        return Err(TrainingError::initialization(format!(
            "configuration describes a {} run, expected {}",
            resolved.kind, expected
        )));
    }
    Ok(())
}
