use model::NoisePrior;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Which network a run trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Structure -> response regression surrogate.
    ForwardModel,
    /// Response-conditioned Wasserstein GAN proposing structures.
    Gan,
}

impl Default for ModelKind {
    fn default() -> Self {
        Self::Gan
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::ForwardModel => write!(f, "forward_model"),
            ModelKind::Gan => write!(f, "gan"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub kind: ModelKind,
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gan: GanSettings,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Hyperparameters that depend on [`ModelKind`], resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHyperparameters {
    pub kind: ModelKind,
    pub input_dim: usize,
    pub output_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub critic_hidden_dims: Vec<usize>,
    pub epochs: usize,
    pub decay_step_size: usize,
    pub run_name: String,
}

impl TrainingConfig {
    /// Parses a TOML or JSON file and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML or JSON file without validating, so that command line
    /// overrides can still fill in missing values.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        self.collect_errors(true)
    }

    /// Same checks as [`validate`](Self::validate) except that a GAN run need
    /// not name `gan.forward_model_checkpoint`. Used when the surrogate is
    /// handed to the trainer directly.
    pub fn validate_hyperparameters(&self) -> Result<(), TrainingError> {
        self.collect_errors(false)
    }

    fn collect_errors(&self, require_surrogate_path: bool) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.path.as_os_str().is_empty() {
            errors.push("data.path must point to a CSV dataset".to_string());
        }
        if self.data.structure_dim == 0 {
            errors.push("data.structure_dim must be greater than 0".to_string());
        }
        if self.data.response_dim == 0 {
            errors.push("data.response_dim must be greater than 0".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        for (label, fraction) in [
            ("data.validation_fraction", self.data.validation_fraction),
            ("data.test_fraction", self.data.test_fraction),
        ] {
            if !(0.0..1.0).contains(&fraction) {
                errors.push(format!("{label} must be in [0, 1)"));
            }
        }
        if self.data.validation_fraction <= 0.0 {
            errors.push("data.validation_fraction must be greater than 0".to_string());
        }
        if self.data.validation_fraction + self.data.test_fraction >= 1.0 {
            errors.push(
                "data.validation_fraction + data.test_fraction must leave training rows"
                    .to_string(),
            );
        }

        let (expected_input, expected_output) = self.data_dims();
        if let Some(input) = self.model.input_dim {
            if input != expected_input {
                errors.push(format!(
                    "model.input_dim ({input}) does not match the {} input width {expected_input}",
                    self.kind
                ));
            }
        }
        if let Some(output) = self.model.output_dim {
            if output != expected_output {
                errors.push(format!(
                    "model.output_dim ({output}) does not match the {} output width {expected_output}",
                    self.kind
                ));
            }
        }
        for (label, dims) in [
            ("model.hidden_dims", self.model.hidden_dims.as_ref()),
            ("model.critic_hidden_dims", self.model.critic_hidden_dims.as_ref()),
        ] {
            if let Some(dims) = dims {
                if dims.iter().any(|dim| *dim == 0) {
                    errors.push(format!("{label} entries must be greater than 0"));
                }
            }
        }

        for (label, lr) in [
            ("optimizer.learning_rate", self.optimizer.learning_rate),
            (
                "optimizer.generator_learning_rate",
                self.optimizer.generator_learning_rate,
            ),
            (
                "optimizer.discriminator_learning_rate",
                self.optimizer.discriminator_learning_rate,
            ),
        ] {
            if !(lr > 0.0 && lr.is_finite()) {
                errors.push(format!("{label} must be greater than 0"));
            }
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if !(0.0 < self.optimizer.rms_alpha && self.optimizer.rms_alpha < 1.0) {
            errors.push("optimizer.rms_alpha must be in (0, 1)".to_string());
        }

        if self.scheduler.gamma <= 0.0 {
            errors.push("scheduler.gamma must be greater than 0".to_string());
        }
        if let Some(0) = self.scheduler.step_size {
            errors.push("scheduler.step_size must be greater than 0".to_string());
        }

        if self.kind == ModelKind::Gan {
            if self.model.noise_dim == 0 {
                errors.push("model.noise_dim must be greater than 0".to_string());
            }
            if self.gan.n_critic == 0 {
                errors.push("gan.n_critic must be greater than 0".to_string());
            }
            if !(self.gan.clip_value > 0.0 && self.gan.clip_value.is_finite()) {
                errors.push("gan.clip_value must be greater than 0".to_string());
            }
            if let Err(err) = NoisePrior::try_from(self.gan.prior) {
                errors.push(format!("gan.prior: {err}"));
            }
            if require_surrogate_path && self.gan.forward_model_checkpoint.is_none() {
                errors.push(
                    "gan.forward_model_checkpoint must name a trained forward model checkpoint"
                        .to_string(),
                );
            }
        }

        if let Some(0) = self.runtime.epochs {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if self.runtime.checkpoint_dir.as_os_str().is_empty() {
            errors.push("runtime.checkpoint_dir must not be empty".to_string());
        }
        if self.runtime.checkpoint_every_n_epochs == 0 {
            errors.push("runtime.checkpoint_every_n_epochs must be greater than 0".to_string());
        }
        if let Some(name) = &self.runtime.run_name {
            if name.trim().is_empty() || name.contains(['/', '\\']) {
                errors.push("runtime.run_name must be a non-empty file stem".to_string());
            }
        }
        if self.runtime.logging.tensorboard_flush_every_n == 0 {
            errors.push(
                "runtime.logging.tensorboard_flush_every_n must be greater than 0".to_string(),
            );
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// `(input, output)` widths implied by the dataset and the run kind.
    pub fn data_dims(&self) -> (usize, usize) {
        match self.kind {
            ModelKind::ForwardModel => (self.data.structure_dim, self.data.response_dim),
            ModelKind::Gan => (self.data.response_dim, self.data.structure_dim),
        }
    }

    pub fn noise_prior(&self) -> Result<NoisePrior, TrainingError> {
        NoisePrior::try_from(self.gan.prior)
            .map_err(|err| TrainingError::validation(vec![format!("gan.prior: {err}")]))
    }

    pub fn resolve(&self) -> Result<ResolvedHyperparameters, TrainingError> {
        self.validate_hyperparameters()?;
        let (input_dim, output_dim) = self.data_dims();
        let (default_epochs, default_step_size) = match self.kind {
            ModelKind::ForwardModel => (DEFAULT_FORWARD_EPOCHS, DEFAULT_FORWARD_DECAY_STEP),
            ModelKind::Gan => (DEFAULT_GAN_EPOCHS, DEFAULT_GAN_DECAY_STEP),
        };
        let hidden_dims = self
            .model
            .hidden_dims
            .clone()
            .unwrap_or_else(|| DEFAULT_HIDDEN_DIMS.to_vec());
        let critic_hidden_dims = self
            .model
            .critic_hidden_dims
            .clone()
            .unwrap_or_else(|| hidden_dims.clone());

        Ok(ResolvedHyperparameters {
            kind: self.kind,
            input_dim,
            output_dim,
            hidden_dims,
            critic_hidden_dims,
            epochs: self.runtime.epochs.unwrap_or(default_epochs),
            decay_step_size: self.scheduler.step_size.unwrap_or(default_step_size),
            run_name: self.run_name(),
        })
    }

    /// File stem shared by the best, temp and loss-history artifacts.
    pub fn run_name(&self) -> String {
        if let Some(name) = &self.runtime.run_name {
            return name.clone();
        }
        match self.kind {
            ModelKind::ForwardModel => format!(
                "forward_lr_{}_STEP_{}",
                self.optimizer.learning_rate, self.scheduler.enabled
            ),
            ModelKind::Gan => format!(
                "w-cgan_noise_{}_g_{}_d_{}_STEP_{}",
                self.model.noise_dim,
                self.optimizer.generator_learning_rate,
                self.optimizer.discriminator_learning_rate,
                self.scheduler.enabled
            ),
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.gan.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default)]
    pub input_dim: Option<usize>,
    #[serde(default)]
    pub output_dim: Option<usize>,
    #[serde(default = "default_noise_dim")]
    pub noise_dim: usize,
    #[serde(default)]
    pub hidden_dims: Option<Vec<usize>>,
    #[serde(default)]
    pub critic_hidden_dims: Option<Vec<usize>>,
}

impl Default for ModelOverrides {
    fn default() -> Self {
        Self {
            input_dim: None,
            output_dim: None,
            noise_dim: default_noise_dim(),
            hidden_dims: None,
            critic_hidden_dims: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default = "default_structure_dim")]
    pub structure_dim: usize,
    #[serde(default = "default_response_dim")]
    pub response_dim: usize,
    #[serde(default = "default_true")]
    pub has_headers: bool,
    #[serde(default = "default_split_fraction")]
    pub validation_fraction: f64,
    #[serde(default = "default_split_fraction")]
    pub test_fraction: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            structure_dim: default_structure_dim(),
            response_dim: default_response_dim(),
            has_headers: true,
            validation_fraction: default_split_fraction(),
            test_fraction: default_split_fraction(),
            batch_size: default_batch_size(),
            shuffle: true,
        }
    }
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if !self.path.as_os_str().is_empty() {
            absolutize_in_place(&mut self.path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    /// Forward-surrogate learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_learning_rate")]
    pub generator_learning_rate: f64,
    #[serde(default = "default_learning_rate")]
    pub discriminator_learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_rms_alpha")]
    pub rms_alpha: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            generator_learning_rate: default_learning_rate(),
            discriminator_learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            rms_alpha: default_rms_alpha(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Adam,
    AdamW,
    RmsProp,
}

impl Default for OptimizerType {
    fn default() -> Self {
        Self::Adam
    }
}

impl fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::Adam => write!(f, "adam"),
            OptimizerType::AdamW => write!(f, "adam_w"),
            OptimizerType::RmsProp => write!(f, "rms_prop"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_decay_gamma")]
    pub gamma: f64,
    /// Epochs between decays; defaults depend on the run kind.
    #[serde(default)]
    pub step_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gamma: default_decay_gamma(),
            step_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GanSettings {
    #[serde(default = "default_n_critic")]
    pub n_critic: usize,
    #[serde(default = "default_clip_value")]
    pub clip_value: f64,
    /// `0` uniform, `1` standard normal.
    #[serde(default = "default_prior")]
    pub prior: u8,
    #[serde(default)]
    pub forward_model_checkpoint: Option<PathBuf>,
}

impl Default for GanSettings {
    fn default() -> Self {
        Self {
            n_critic: default_n_critic(),
            clip_value: default_clip_value(),
            prior: default_prior(),
            forward_model_checkpoint: None,
        }
    }
}

impl GanSettings {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.forward_model_checkpoint.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    Auto,
    Cpu,
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub epochs: Option<usize>,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_checkpoint_every_n_epochs")]
    pub checkpoint_every_n_epochs: usize,
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            epochs: None,
            device: DevicePreference::default(),
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_every_n_epochs: default_checkpoint_every_n_epochs(),
            run_name: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint_dir, base);
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
    #[serde(default = "default_true")]
    pub export_loss_csv: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
            export_loss_csv: true,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

const DEFAULT_GAN_EPOCHS: usize = 50_000;
const DEFAULT_FORWARD_EPOCHS: usize = 10_000;
const DEFAULT_GAN_DECAY_STEP: usize = 5_000;
const DEFAULT_FORWARD_DECAY_STEP: usize = 2_000;
const DEFAULT_HIDDEN_DIMS: [usize; 2] = [128, 128];

fn default_true() -> bool {
    true
}

fn default_noise_dim() -> usize {
    2
}

fn default_structure_dim() -> usize {
    4
}

fn default_response_dim() -> usize {
    3
}

fn default_split_fraction() -> f64 {
    0.15
}

fn default_batch_size() -> usize {
    128
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    1e-5
}

fn default_beta1() -> f64 {
    0.5
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_rms_alpha() -> f64 {
    0.99
}

fn default_decay_gamma() -> f64 {
    0.2
}

fn default_n_critic() -> usize {
    5
}

fn default_clip_value() -> f64 {
    1.0
}

fn default_prior() -> u8 {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_checkpoint_every_n_epochs() -> usize {
    10
}

fn default_tensorboard_flush_every_n() -> usize {
    20
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_) | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<csv::Error> for TrainingError {
    fn from(value: csv::Error) -> Self {
        TrainingError::Runtime(format!("csv error: {value}"))
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
