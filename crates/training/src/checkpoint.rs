//! Single-file training checkpoints.
//!
//! A checkpoint is one safetensors file. Tensors hold model parameters
//! (`model.<param>`), optimizer moments
//! (`optimizer.<name>.<param>.first_moment|second_moment`) and the loss
//! history (`loss_all`, f64 `[channels, epochs]`). Scalars and the training
//! configuration travel in the string metadata header.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load_buffer, Device, Tensor, Var};
use hex::encode as hex_encode;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::{to_runtime_error, OptimizerType},
    metrics::LossHistory,
    optimizer::{OptimizerState, ParameterState, TrainerOptimizer},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_FORMAT: &str = "inverse-design-checkpoint";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const LOSS_TENSOR: &str = "loss_all";

const META_FORMAT: &str = "format";
const META_VERSION: &str = "version";
const META_EPOCH: &str = "epoch";
const META_RECORDED_EPOCHS: &str = "loss_epochs_recorded";
const META_OPTIMIZERS: &str = "optimizers";
const META_CONFIG: &str = "config";
const META_CONFIG_SHA256: &str = "config_sha256";
const META_CREATED: &str = "created_unix_timestamp";

/// Everything needed to resume or reuse a run at the end of an epoch.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub version: u32,
    pub epoch: usize,
    /// Parameter tensors sorted by name.
    pub model_state: Vec<(String, Tensor)>,
    pub optimizers: Vec<NamedOptimizerState>,
    pub loss_history: LossHistory,
    pub config: TrainingConfig,
    pub config_sha256: String,
    pub created_unix_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedOptimizerState {
    pub name: String,
    pub state: OptimizerState,
}

/// Optimizer scalars stored in the metadata header. Moments live in tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OptimizerHeader {
    name: String,
    algorithm: OptimizerType,
    step: usize,
    learning_rate: f64,
    parameters: Vec<ParameterHeader>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParameterHeader {
    name: String,
    shape: Vec<usize>,
}

impl CheckpointRecord {
    /// Snapshots parameters, optimizer state and history at the end of `epoch`.
    pub fn capture(
        epoch: usize,
        parameters: &[(String, Var)],
        optimizers: &[(&str, &TrainerOptimizer)],
        loss_history: &LossHistory,
        config: &TrainingConfig,
    ) -> Result<Self, TrainingError> {
        if parameters.is_empty() {
            return Err(TrainingError::runtime(
                "model contains no parameters to checkpoint",
            ));
        }
        // Vars are updated in place, so the snapshot needs its own storage.
        let mut model_state = parameters
            .iter()
            .map(|(name, var)| {
                let tensor = var.as_tensor().copy().map_err(to_runtime_error)?;
                Ok((name.clone(), tensor.detach()))
            })
            .collect::<Result<Vec<(String, Tensor)>, TrainingError>>()?;
        model_state.sort_by(|a, b| a.0.cmp(&b.0));

        let optimizers = optimizers
            .iter()
            .map(|(name, optimizer)| {
                Ok(NamedOptimizerState {
                    name: (*name).to_string(),
                    state: optimizer.state()?,
                })
            })
            .collect::<Result<Vec<_>, TrainingError>>()?;

        Ok(Self {
            version: CHECKPOINT_VERSION,
            epoch,
            model_state,
            optimizers,
            loss_history: loss_history.clone(),
            config: config.clone(),
            config_sha256: fingerprint_config(config)?,
            created_unix_timestamp: unix_timestamp(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to create checkpoint directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let device = self
            .model_state
            .first()
            .map(|(_, tensor)| tensor.device().clone())
            .unwrap_or(Device::Cpu);

        let mut tensors: Vec<(String, Tensor)> = self
            .model_state
            .iter()
            .map(|(name, tensor)| (format!("{MODEL_PREFIX}{name}"), tensor.clone()))
            .collect();

        let mut headers = Vec::with_capacity(self.optimizers.len());
        for named in &self.optimizers {
            let mut parameters = Vec::with_capacity(named.state.parameters.len());
            for param in &named.state.parameters {
                let key = moment_key(&named.name, &param.name);
                tensors.push((
                    format!("{key}.first_moment"),
                    Tensor::from_vec(param.first_moment.clone(), param.shape.as_slice(), &device)
                        .map_err(to_runtime_error)?,
                ));
                tensors.push((
                    format!("{key}.second_moment"),
                    Tensor::from_vec(param.second_moment.clone(), param.shape.as_slice(), &device)
                        .map_err(to_runtime_error)?,
                ));
                parameters.push(ParameterHeader {
                    name: param.name.clone(),
                    shape: param.shape.clone(),
                });
            }
            headers.push(OptimizerHeader {
                name: named.name.clone(),
                algorithm: named.state.algorithm,
                step: named.state.step,
                learning_rate: named.state.learning_rate,
                parameters,
            });
        }
        tensors.push((LOSS_TENSOR.to_string(), self.loss_history.to_tensor(&device)?));

        let config_json = serde_json::to_string(&self.config)
            .map_err(|err| TrainingError::runtime(format!("failed to serialize config: {err}")))?;
        let optimizers_json = serde_json::to_string(&headers).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize optimizer state: {err}"))
        })?;

        let metadata: HashMap<String, String> = [
            (META_FORMAT, CHECKPOINT_FORMAT.to_string()),
            (META_VERSION, self.version.to_string()),
            (META_EPOCH, self.epoch.to_string()),
            (
                META_RECORDED_EPOCHS,
                self.loss_history.recorded_epochs().to_string(),
            ),
            (META_OPTIMIZERS, optimizers_json),
            (META_CONFIG_SHA256, sha256_hex(config_json.as_bytes())),
            (META_CONFIG, config_json),
            (META_CREATED, self.created_unix_timestamp.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        safetensors::serialize_to_file(
            tensors.iter().map(|(name, tensor)| (name.as_str(), tensor)),
            Some(metadata),
            path,
        )
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write checkpoint {}: {err}",
                path.display()
            ))
        })
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self, TrainingError> {
        if !path.is_file() {
            return Err(TrainingError::runtime(format!(
                "checkpoint not found at {}",
                path.display()
            )));
        }
        let bytes = fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to read checkpoint header {}: {err}",
                path.display()
            ))
        })?;
        let metadata = header.metadata().clone().ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint {} has no metadata", path.display()))
        })?;

        let format = required(&metadata, META_FORMAT)?;
        if format != CHECKPOINT_FORMAT {
            return Err(TrainingError::runtime(format!(
                "{} is not a training checkpoint (format '{format}')",
                path.display()
            )));
        }
        let version: u32 = parse_field(&metadata, META_VERSION)?;
        ensure_version_supported(version)?;
        let epoch: usize = parse_field(&metadata, META_EPOCH)?;
        let recorded: usize = parse_field(&metadata, META_RECORDED_EPOCHS)?;
        let created_unix_timestamp: u64 = parse_field(&metadata, META_CREATED)?;

        let config_json = required(&metadata, META_CONFIG)?;
        let config_sha256 = required(&metadata, META_CONFIG_SHA256)?.to_string();
        if sha256_hex(config_json.as_bytes()) != config_sha256 {
            return Err(TrainingError::runtime(format!(
                "checkpoint {} failed config checksum validation",
                path.display()
            )));
        }
        let config: TrainingConfig = serde_json::from_str(config_json).map_err(|err| {
            TrainingError::runtime(format!("failed to parse checkpoint config: {err}"))
        })?;
        let headers: Vec<OptimizerHeader> =
            serde_json::from_str(required(&metadata, META_OPTIMIZERS)?).map_err(|err| {
                TrainingError::runtime(format!("failed to parse optimizer header: {err}"))
            })?;

        let mut tensors = load_buffer(&bytes, device).map_err(to_runtime_error)?;

        let loss_tensor = tensors.remove(LOSS_TENSOR).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint {} lacks {LOSS_TENSOR}", path.display()))
        })?;
        let loss_history = LossHistory::from_tensor(&loss_tensor, recorded)?;

        let mut optimizers = Vec::with_capacity(headers.len());
        for header in headers {
            let mut parameters = Vec::with_capacity(header.parameters.len());
            for param in header.parameters {
                let key = moment_key(&header.name, &param.name);
                let first_moment = take_moment(&mut tensors, &format!("{key}.first_moment"))?;
                let second_moment = take_moment(&mut tensors, &format!("{key}.second_moment"))?;
                parameters.push(ParameterState {
                    name: param.name,
                    shape: param.shape,
                    first_moment,
                    second_moment,
                });
            }
            optimizers.push(NamedOptimizerState {
                name: header.name,
                state: OptimizerState {
                    algorithm: header.algorithm,
                    step: header.step,
                    learning_rate: header.learning_rate,
                    parameters,
                },
            });
        }

        let mut model_state = Vec::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            match name.strip_prefix(MODEL_PREFIX) {
                Some(param) => model_state.push((param.to_string(), tensor)),
                None => {
                    return Err(TrainingError::runtime(format!(
                        "checkpoint {} contains unexpected tensor {name}",
                        path.display()
                    )))
                }
            }
        }
        model_state.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            version,
            epoch,
            model_state,
            optimizers,
            loss_history,
            config,
            config_sha256,
            created_unix_timestamp,
        })
    }

    /// Copies stored tensors into `parameters`, requiring an exact name and
    /// shape match in both directions.
    pub fn apply_model_state(&self, parameters: &[(String, Var)]) -> Result<(), TrainingError> {
        let mut by_name: HashMap<&str, &Tensor> = self
            .model_state
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect();

        let mut staged = Vec::with_capacity(parameters.len());
        for (name, var) in parameters {
            let tensor = by_name.remove(name.as_str()).ok_or_else(|| {
                TrainingError::runtime(format!("checkpoint missing parameter {name}"))
            })?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(TrainingError::runtime(format!(
                    "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
            let tensor = tensor
                .to_dtype(var.as_tensor().dtype())
                .and_then(|t| t.to_device(var.as_tensor().device()))
                .map_err(to_runtime_error)?;
            staged.push((var, tensor));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort_unstable();
            return Err(TrainingError::runtime(format!(
                "checkpoint contains unused parameters: {}",
                extra.join(", ")
            )));
        }

        for (var, tensor) in staged {
            var.set(&tensor).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    /// Restores the optimizer saved under `name`.
    pub fn apply_optimizer_state(
        &self,
        name: &str,
        optimizer: &mut TrainerOptimizer,
    ) -> Result<(), TrainingError> {
        let named = self
            .optimizers
            .iter()
            .find(|named| named.name == name)
            .ok_or_else(|| {
                TrainingError::runtime(format!("checkpoint has no optimizer named '{name}'"))
            })?;
        optimizer.load_state(named.state.clone())
    }
}

/// Best/temp file policy for one run.
///
/// The best file is rewritten whenever the tracked metric is at least as good
/// as the best seen so far (ties overwrite). The temp file is rewritten every
/// `every_n_epochs` epochs starting at epoch 0.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
    run_name: String,
    every_n_epochs: usize,
    best_metric: f64,
}

/// Initial "best" metric; any realistic first epoch beats it.
pub const BEST_METRIC_SENTINEL: f64 = 100.0;

impl CheckpointManager {
    pub fn new(directory: impl Into<PathBuf>, run_name: impl Into<String>, every_n_epochs: usize) -> Self {
        Self {
            directory: directory.into(),
            run_name: run_name.into(),
            every_n_epochs: every_n_epochs.max(1),
            best_metric: BEST_METRIC_SENTINEL,
        }
    }

    pub fn best_metric(&self) -> f64 {
        self.best_metric
    }

    /// Overrides the running best, used when resuming.
    pub fn restore_best_metric(&mut self, metric: f64) {
        self.best_metric = metric;
    }

    /// Returns `true` (and adopts `metric` as the new best) when the best
    /// checkpoint should be rewritten.
    pub fn observe(&mut self, metric: f64) -> bool {
        if self.best_metric >= metric {
            self.best_metric = metric;
            true
        } else {
            false
        }
    }

    pub fn should_save_periodic(&self, epoch: usize) -> bool {
        epoch % self.every_n_epochs == 0
    }

    pub fn best_path(&self) -> PathBuf {
        self.directory.join(format!("{}_trained.pth", self.run_name))
    }

    pub fn temp_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}_trained_temp.pth", self.run_name))
    }

    pub fn loss_csv_path(&self) -> PathBuf {
        self.directory.join(format!("{}_loss.csv", self.run_name))
    }
}

fn moment_key(optimizer: &str, parameter: &str) -> String {
    format!("{OPTIMIZER_PREFIX}{optimizer}.{parameter}")
}

fn take_moment(
    tensors: &mut HashMap<String, Tensor>,
    key: &str,
) -> Result<Vec<f32>, TrainingError> {
    let tensor = tensors
        .remove(key)
        .ok_or_else(|| TrainingError::runtime(format!("checkpoint missing tensor {key}")))?;
    tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)
}

fn required<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Result<&'a str, TrainingError> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| TrainingError::runtime(format!("checkpoint metadata missing '{key}'")))
}

fn parse_field<T: std::str::FromStr>(
    metadata: &HashMap<String, String>,
    key: &str,
) -> Result<T, TrainingError> {
    let raw = required(metadata, key)?;
    raw.parse().map_err(|_| {
        TrainingError::runtime(format!("checkpoint metadata '{key}' is invalid: '{raw}'"))
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(sha256_hex(&json))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex_encode(Sha256::digest(bytes))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
