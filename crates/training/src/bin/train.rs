use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{Parser, ValueEnum};
use serde_json::{Number, Value};
use training::{
    config::{DevicePreference, OptimizerType},
    ModelKind, Trainer, TrainingConfig, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Inverse design trainer: forward surrogate and Wasserstein cGAN",
    long_about = None
)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML or JSON training config"
    )]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the run's temp checkpoint if available")]
    resume: bool,

    #[arg(long, value_enum, help = "Which network to train")]
    model: Option<ModelArg>,

    #[arg(long, help = "Condition width of the generator (response columns)")]
    input_dim: Option<usize>,

    #[arg(long, help = "Output width of the generator (structure columns)")]
    output_dim: Option<usize>,

    #[arg(long, help = "Dimension of the noise vector")]
    noise_dim: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long, help = "Learning rate of the forward model")]
    lr: Option<f64>,

    #[arg(long, help = "Learning rate of the generator")]
    g_lr: Option<f64>,

    #[arg(long, help = "Learning rate of the discriminator")]
    d_lr: Option<f64>,

    #[arg(long)]
    weight_decay: Option<f64>,

    #[arg(long = "beta-1")]
    beta_1: Option<f64>,

    #[arg(long = "beta-2")]
    beta_2: Option<f64>,

    #[arg(long, help = "Critic updates per generator update")]
    n_critic: Option<usize>,

    #[arg(long, help = "Clamp bound for discriminator parameters")]
    clip_value: Option<f64>,

    #[arg(long, help = "1 for a standard normal prior, 0 for uniform on [0, 1)")]
    prior: Option<u8>,

    #[arg(
        long = "if-lr-de",
        num_args = 0..=1,
        default_missing_value = "true",
        value_name = "BOOL",
        help = "Enable step learning-rate decay"
    )]
    if_lr_de: Option<bool>,

    #[arg(long = "lr-de", help = "Multiply the learning rate by this factor")]
    lr_de: Option<f64>,

    #[arg(long = "epoch-lr-de", help = "Epochs between learning-rate decays")]
    epoch_lr_de: Option<usize>,

    #[arg(long, help = "Use RMSProp instead of Adam")]
    rmsprop: bool,

    #[arg(long, value_name = "PATH", help = "CSV with structure then response columns")]
    data: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Trained forward model checkpoint used for the validation RMSE"
    )]
    forward_model: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    device: Option<DeviceArg>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModelArg {
    #[value(name = "forward_model", alias = "forward")]
    ForwardModel,
    #[value(name = "gan", alias = "w-cgan")]
    Gan,
}

impl From<ModelArg> for ModelKind {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::ForwardModel => ModelKind::ForwardModel,
            ModelArg::Gan => ModelKind::Gan,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DeviceArg {
    Auto,
    Cpu,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainingConfig::read(path)?,
        None => TrainingConfig::default(),
    };
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    apply_flags(&mut config, &args);

    config.validate()?;

    let mut trainer = Trainer::new(config)?;

    if args.resume {
        if let Some(epoch) = trainer.resume_from_temp()? {
            println!("resumed from temp checkpoint written at epoch {epoch}");
        }
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let summary = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    println!(
        "finished {} epochs (best metric {:.6}){}; best checkpoint {}",
        summary.epochs_completed,
        summary.best_metric,
        if summary.interrupted { ", interrupted" } else { "" },
        summary.best_path.display()
    );

    Ok(())
}

/// Direct flags win over both the config file and `--override`.
fn apply_flags(config: &mut TrainingConfig, args: &Args) {
    if let Some(model) = args.model {
        config.kind = model.into();
    }
    if let Some(dim) = args.input_dim {
        config.model.input_dim = Some(dim);
    }
    if let Some(dim) = args.output_dim {
        config.model.output_dim = Some(dim);
    }
    if let Some(dim) = args.noise_dim {
        config.model.noise_dim = dim;
    }
    if let Some(size) = args.batch_size {
        config.data.batch_size = size;
    }
    if let Some(epochs) = args.epochs {
        config.runtime.epochs = Some(epochs);
    }
    if let Some(lr) = args.lr {
        config.optimizer.learning_rate = lr;
    }
    if let Some(lr) = args.g_lr {
        config.optimizer.generator_learning_rate = lr;
    }
    if let Some(lr) = args.d_lr {
        config.optimizer.discriminator_learning_rate = lr;
    }
    if let Some(decay) = args.weight_decay {
        config.optimizer.weight_decay = decay;
    }
    if let Some(beta) = args.beta_1 {
        config.optimizer.beta1 = beta;
    }
    if let Some(beta) = args.beta_2 {
        config.optimizer.beta2 = beta;
    }
    if let Some(n) = args.n_critic {
        config.gan.n_critic = n;
    }
    if let Some(clip) = args.clip_value {
        config.gan.clip_value = clip;
    }
    if let Some(prior) = args.prior {
        config.gan.prior = prior;
    }
    if let Some(enabled) = args.if_lr_de {
        config.scheduler.enabled = enabled;
    }
    if let Some(gamma) = args.lr_de {
        config.scheduler.gamma = gamma;
    }
    if let Some(step) = args.epoch_lr_de {
        config.scheduler.step_size = Some(step);
    }
    if args.rmsprop {
        config.optimizer.algorithm = OptimizerType::RmsProp;
    }
    if let Some(path) = &args.data {
        config.data.path = path.clone();
    }
    if let Some(path) = &args.forward_model {
        config.gan.forward_model_checkpoint = Some(path.clone());
    }
    if let Some(seed) = args.seed {
        config.runtime.seed = seed;
    }
    if let Some(device) = args.device {
        config.runtime.device = match device {
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Cpu => DevicePreference::Cpu,
        };
    }
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value)?;
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Result<Value, TrainingError> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Ok(Value::Bool(true));
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Ok(Value::Bool(false));
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Ok(Value::Number(Number::from(int_val)));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Ok(Value::Number(number));
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return Ok(json_val);
        }
    }
    Ok(Value::String(trimmed.to_string()))
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments = parse_path(path)?;
    if segments.is_empty() {
        return Err(TrainingError::runtime("override path must not be empty"));
    }

    assign_at_path(value, &segments, new_value)
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| {
            if let Some((base, idx_part)) = segment.split_once('[') {
                let idx_str = idx_part.trim_end_matches(']');
                let index = idx_str.parse::<usize>().map_err(|err| {
                    TrainingError::runtime(format!(
                        "invalid index in override path '{}': {}",
                        segment, err
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            } else {
                Ok(PathSegment {
                    key: segment.to_string(),
                    index: None,
                })
            }
        })
        .collect()
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(serde_json::Map::new());
    }
    let Some(map) = target.as_object_mut() else {
        return Err(TrainingError::runtime(format!(
            "override path segment '{}' points to non-object value",
            segment.key
        )));
    };
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    match segment.index {
        Some(array_index) => {
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            let Some(array) = entry.as_array_mut() else {
                return Err(TrainingError::runtime(format!(
                    "override path segment '{}' expects array value",
                    segment.key
                )));
            };
            while array.len() <= array_index {
                array.push(Value::Null);
            }
            assign_at_path(&mut array[array_index], rest, new_value)
        }
        None => assign_at_path(entry, rest, new_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_sets_nested_fields() -> Result<(), TrainingError> {
        let overrides = vec![
            OverrideArg::from_str("gan.n_critic=2").map_err(TrainingError::runtime)?,
            OverrideArg::from_str("model.hidden_dims=[64, 32]").map_err(TrainingError::runtime)?,
            OverrideArg::from_str("runtime.logging.enable_stdout=false")
                .map_err(TrainingError::runtime)?,
        ];
        let config = apply_overrides(TrainingConfig::default(), &overrides)?;
        assert_eq!(config.gan.n_critic, 2);
        assert_eq!(config.model.hidden_dims, Some(vec![64, 32]));
        assert!(!config.runtime.logging.enable_stdout);
        Ok(())
    }

    #[test]
    fn indexed_override_replaces_one_entry() -> Result<(), TrainingError> {
        let mut value = serde_json::json!({ "model": { "hidden_dims": [128, 128] } });
        set_value_at_path(&mut value, "model.hidden_dims[1]", Value::from(16))?;
        assert_eq!(value["model"]["hidden_dims"], serde_json::json!([128, 16]));
        Ok(())
    }

    #[test]
    fn override_through_scalar_is_rejected() {
        let mut value = serde_json::json!({ "gan": { "n_critic": 5 } });
        assert!(set_value_at_path(&mut value, "gan.n_critic.inner", Value::from(1)).is_err());
    }

    #[test]
    fn flags_map_onto_config() {
        let args = Args::parse_from([
            "train",
            "--model",
            "forward_model",
            "--if-lr-de",
            "false",
            "--rmsprop",
            "--prior",
            "0",
            "--epoch-lr-de",
            "7",
        ]);
        let mut config = TrainingConfig::default();
        apply_flags(&mut config, &args);
        assert_eq!(config.kind, ModelKind::ForwardModel);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.optimizer.algorithm, OptimizerType::RmsProp);
        assert_eq!(config.gan.prior, 0);
        assert_eq!(config.scheduler.step_size, Some(7));
    }

    #[test]
    fn bare_decay_flag_enables_decay() {
        let args = Args::parse_from(["train", "--if-lr-de"]);
        assert_eq!(args.if_lr_de, Some(true));
    }
}
