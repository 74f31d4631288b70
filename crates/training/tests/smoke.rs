use std::{fmt::Write as _, fs, path::Path};

use anyhow::Result;
use candle_core::Device;
use tempfile::tempdir;
use training::{
    trainer::load_forward_surrogate, CheckpointRecord, ModelKind, Trainer, TrainingConfig,
};

fn write_dataset(path: &Path, rows: usize) -> Result<()> {
    let mut csv = String::from("thickness,period,radius,gap,x,y,Y\n");
    for i in 0..rows {
        let s: Vec<f32> = (0..4)
            .map(|j| 50.0 + ((i * 13 + j * 5) % 17) as f32 * 10.0)
            .collect();
        let x = 0.2 + s[0] / 1000.0;
        let y = 0.3 + (s[1] - s[2]) / 2000.0;
        let lum = (s[3] / 400.0).min(1.0);
        writeln!(
            csv,
            "{},{},{},{},{},{},{}",
            s[0], s[1], s[2], s[3], x, y, lum
        )?;
    }
    fs::write(path, csv)?;
    Ok(())
}

fn write_config(path: &Path, body: &str) -> Result<()> {
    fs::write(path, body)?;
    Ok(())
}

#[test]
fn forward_then_gan_pipeline_runs_end_to_end() -> Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("silicon_color.csv"), 80)?;

    let forward_toml = dir.path().join("forward.toml");
    write_config(
        &forward_toml,
        r#"
kind = "forward_model"

[model]
hidden_dims = [16, 16]

[data]
path = "silicon_color.csv"
batch_size = 16

[optimizer]
learning_rate = 0.01

[runtime]
epochs = 3
device = "cpu"
checkpoint_dir = "models"
run_name = "forward_smoke"

[runtime.logging]
enable_stdout = false
tensorboard_dir = "runs/forward"
"#,
    )?;
    let forward_config = TrainingConfig::from_path(&forward_toml)?;
    assert_eq!(forward_config.kind, ModelKind::ForwardModel);
    assert_eq!(
        forward_config.data.path,
        dir.path().join("silicon_color.csv")
    );

    let mut forward = Trainer::new(forward_config)?;
    let summary = forward.train()?;
    assert_eq!(summary.epochs_completed, 3);
    assert!(summary.best_path.is_file());
    assert!(summary.temp_path.is_file());
    assert!(dir.path().join("models/forward_smoke_loss.csv").is_file());
    let event_files = fs::read_dir(dir.path().join("runs/forward"))?.count();
    assert_eq!(event_files, 1);

    let surrogate = load_forward_surrogate(&summary.best_path, &Device::Cpu)?;
    assert_eq!(surrogate.config().input_dim, 4);
    assert_eq!(surrogate.config().output_dim, 3);

    let gan_toml = dir.path().join("gan.toml");
    write_config(
        &gan_toml,
        r#"
kind = "gan"

[model]
noise_dim = 2
hidden_dims = [16, 16]

[data]
path = "silicon_color.csv"
batch_size = 16

[scheduler]
enabled = true
step_size = 2

[gan]
n_critic = 2
clip_value = 0.05
prior = 1
forward_model_checkpoint = "models/forward_smoke_trained.pth"

[runtime]
epochs = 3
device = "cpu"
checkpoint_dir = "models"

[runtime.logging]
enable_stdout = false
"#,
    )?;
    let gan_config = TrainingConfig::from_path(&gan_toml)?;
    let run_name = gan_config.run_name();
    assert_eq!(run_name, "w-cgan_noise_2_g_0.001_d_0.001_STEP_true");

    let mut gan = Trainer::new(gan_config.clone())?;
    let summary = gan.train()?;
    assert_eq!(summary.epochs_completed, 3);
    assert!(summary.best_path.is_file());
    assert!(summary.temp_path.is_file());
    assert!(summary.best_metric >= 0.0);

    let best = CheckpointRecord::load(&summary.best_path, &Device::Cpu)?;
    assert_eq!(best.config.kind, ModelKind::Gan);
    assert_eq!(best.optimizers.len(), 2);
    assert_eq!(best.loss_history.channels(), 3);

    // The temp file is only written on epoch 0, so a longer run resumes at 1.
    let mut longer = gan_config;
    longer.runtime.epochs = Some(5);
    let mut resumed = Trainer::new(longer)?;
    assert_eq!(resumed.resume_from_temp()?, Some(0));
    let summary = resumed.train()?;
    assert_eq!(summary.epochs_completed, 4);
    Ok(())
}

#[test]
fn gan_run_without_surrogate_checkpoint_fails() -> Result<()> {
    let dir = tempdir()?;
    write_dataset(&dir.path().join("data.csv"), 40)?;

    let mut config = TrainingConfig::default();
    config.data.path = dir.path().join("data.csv");
    config.gan.forward_model_checkpoint = Some(dir.path().join("missing.pth"));
    config.runtime.device = training::config::DevicePreference::Cpu;
    config.runtime.checkpoint_dir = dir.path().join("models");

    assert!(Trainer::new(config).is_err());
    Ok(())
}

#[test]
fn invalid_prior_is_reported_during_validation() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bad.toml");
    write_config(
        &path,
        r#"
[data]
path = "data.csv"

[gan]
prior = 3
forward_model_checkpoint = "forward.pth"
"#,
    )?;
    let err = match TrainingConfig::from_path(&path) {
        Ok(_) => anyhow::bail!("prior 3 should be rejected"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("gan.prior"));
    Ok(())
}
