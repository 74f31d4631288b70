use std::path::Path;

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use model::{Mlp, MlpConfig};
use rand::{rngs::StdRng, SeedableRng};
use tempfile::tempdir;
use training::{
    get_dataloaders, CheckpointRecord, GanTrainer, LoaderSettings, Logger, LoggingSettings,
    LossHistory, ModelKind, PairedDataset, Split, TrainingConfig,
};

const STRUCTURE_DIM: usize = 4;
const RESPONSE_DIM: usize = 3;

fn synthetic_dataset(rows: usize) -> Result<PairedDataset> {
    let mut structure = Vec::with_capacity(rows * STRUCTURE_DIM);
    let mut response = Vec::with_capacity(rows * RESPONSE_DIM);
    for i in 0..rows {
        let s: Vec<f32> = (0..STRUCTURE_DIM)
            .map(|j| ((i * 7 + j * 3) % 11) as f32 + j as f32)
            .collect();
        response.push(0.3 * s[0] + 0.1 * s[1]);
        response.push(0.5 * s[2] - 0.2 * s[3]);
        response.push(0.05 * (s[0] + s[3]));
        structure.extend(s);
    }
    Ok(PairedDataset::from_raw(
        structure,
        response,
        STRUCTURE_DIM,
        RESPONSE_DIM,
    )?)
}

fn gan_config(checkpoint_dir: &Path, n_critic: usize, clip_value: f64) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.kind = ModelKind::Gan;
    config.data.path = checkpoint_dir.join("unused.csv");
    config.data.batch_size = 6;
    config.model.hidden_dims = Some(vec![16, 16]);
    config.gan.n_critic = n_critic;
    config.gan.clip_value = clip_value;
    config.runtime.epochs = Some(3);
    config.runtime.checkpoint_dir = checkpoint_dir.to_path_buf();
    config.runtime.checkpoint_every_n_epochs = 1;
    config.runtime.logging.enable_stdout = false;
    config.runtime.logging.export_loss_csv = false;
    config
}

fn build_trainer(config: TrainingConfig) -> Result<GanTrainer> {
    let dataset = synthetic_dataset(60)?;
    let settings = LoaderSettings {
        batch_size: config.data.batch_size,
        shuffle: true,
        validation_fraction: 0.15,
        test_fraction: 0.15,
        seed: config.runtime.seed,
    };
    let loaders = get_dataloaders(ModelKind::Gan, &dataset, &settings, &Device::Cpu)?;
    let mut rng = StdRng::seed_from_u64(7);
    let surrogate = Mlp::new(
        MlpConfig::forward_surrogate(STRUCTURE_DIM, RESPONSE_DIM, vec![16]),
        &mut rng,
        &Device::Cpu,
    )?;
    Ok(GanTrainer::from_parts(
        config,
        loaders,
        surrogate,
        Device::Cpu,
        Logger::new(LoggingSettings::quiet())?,
    )?)
}

fn snapshot(parameters: &[(String, Var)]) -> Result<Vec<Vec<f32>>> {
    parameters
        .iter()
        .map(|(_, var)| Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?))
        .collect()
}

fn stored_values(state: &[(String, Tensor)]) -> Result<Vec<Vec<f32>>> {
    state
        .iter()
        .map(|(_, tensor)| Ok(tensor.flatten_all()?.to_vec1::<f32>()?))
        .collect()
}

/// Index of the last minimum, matching the tie-overwriting best policy.
fn last_argmin(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (epoch, &value)| match best {
            Some((_, current)) if value > current => best,
            _ => Some((epoch, value)),
        })
        .map(|(epoch, _)| epoch)
}

#[test]
fn critic_weights_stay_clipped_after_every_step() -> Result<()> {
    let dir = tempdir()?;
    let clip = 0.01;
    let mut trainer = build_trainer(gan_config(dir.path(), 5, clip))?;
    let batches = trainer.loaders_mut().train.batches()?;
    assert!(batches.len() > 3);

    for batch in &batches {
        trainer.critic_step(batch)?;
        for values in snapshot(&trainer.model().discriminator_parameters())? {
            assert!(values.iter().all(|v| v.abs() <= clip as f32));
        }
    }
    assert_eq!(trainer.discriminator_steps(), batches.len());
    assert_eq!(trainer.generator_steps(), 0);
    Ok(())
}

#[test]
fn generator_updates_only_on_every_n_critic_batch() -> Result<()> {
    let dir = tempdir()?;
    let mut trainer = build_trainer(gan_config(dir.path(), 2, 0.01))?;
    let batches = trainer.loaders_mut().train.batches()?;

    let mut updated = Vec::new();
    for (offset, batch) in batches.iter().enumerate() {
        let index = offset + 1;
        let before = snapshot(&trainer.model().generator_parameters())?;
        let losses = trainer.train_batch(index, batch)?;
        let after = snapshot(&trainer.model().generator_parameters())?;
        if index % 2 == 0 {
            assert!(losses.generator.is_some());
            assert_ne!(before, after, "generator should move on batch {index}");
            updated.push(index);
        } else {
            assert!(losses.generator.is_none());
            assert_eq!(before, after, "generator moved on batch {index}");
        }
    }
    let expected: Vec<usize> = (1..=batches.len()).filter(|i| i % 2 == 0).collect();
    assert_eq!(updated, expected);
    assert_eq!(trainer.generator_steps(), expected.len());
    Ok(())
}

#[test]
fn epoch_loss_is_batch_weighted_mean() -> Result<()> {
    let dir = tempdir()?;
    let mut config = gan_config(dir.path(), 3, 0.05);
    // 42 training rows in batches of 8 leaves a short final batch.
    config.data.batch_size = 8;

    let mut by_epoch = build_trainer(config.clone())?;
    let epoch = by_epoch.train_epoch()?;

    let mut by_batch = build_trainer(config)?;
    let batches = by_batch.loaders_mut().train.batches()?;
    assert_ne!(batches.last().map(|b| b.len), Some(8));
    let total: usize = batches.iter().map(|b| b.len).sum();
    let (mut g_sum, mut d_sum) = (0.0, 0.0);
    for (offset, batch) in batches.iter().enumerate() {
        let losses = by_batch.train_batch(offset + 1, batch)?;
        d_sum += losses.discriminator * batch.len as f64;
        g_sum += losses.generator.unwrap_or(0.0) * batch.len as f64;
    }
    let (g_mean, d_mean) = (g_sum / total as f64, d_sum / total as f64);

    assert!((epoch.generator - g_mean).abs() < 1e-9);
    assert!((epoch.discriminator - d_mean).abs() < 1e-9);
    assert!((epoch.total - (g_mean + d_mean)).abs() < 1e-9);
    Ok(())
}

#[test]
fn evaluation_leaves_parameters_untouched() -> Result<()> {
    let dir = tempdir()?;
    let mut trainer = build_trainer(gan_config(dir.path(), 2, 0.01))?;
    let before = snapshot(&trainer.model().parameters())?;

    let summary = trainer.evaluate(Split::Validation)?;
    let rmse = summary.rmse.expect("gan evaluation reports an rmse");
    assert!(rmse.is_finite() && rmse >= 0.0);
    assert!(summary.loss.is_finite());

    assert_eq!(before, snapshot(&trainer.model().parameters())?);
    assert_eq!(trainer.generator_steps(), 0);
    assert_eq!(trainer.discriminator_steps(), 0);
    Ok(())
}

#[test]
fn surrogate_with_wrong_dimensions_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let config = gan_config(dir.path(), 5, 0.01);
    let dataset = synthetic_dataset(60)?;
    let settings = LoaderSettings {
        batch_size: 6,
        shuffle: false,
        validation_fraction: 0.15,
        test_fraction: 0.15,
        seed: 1,
    };
    let loaders = get_dataloaders(ModelKind::Gan, &dataset, &settings, &Device::Cpu)?;
    let mut rng = StdRng::seed_from_u64(7);
    let backwards = Mlp::new(
        MlpConfig::forward_surrogate(RESPONSE_DIM, STRUCTURE_DIM, vec![8]),
        &mut rng,
        &Device::Cpu,
    )?;
    let result = GanTrainer::from_parts(
        config,
        loaders,
        backwards,
        Device::Cpu,
        Logger::new(LoggingSettings::quiet())?,
    );
    assert!(result.is_err());
    Ok(())
}

#[test]
fn checkpoint_round_trip_is_exact() -> Result<()> {
    let dir = tempdir()?;
    let config = gan_config(dir.path(), 2, 0.05);
    let mut trainer = build_trainer(config.clone())?;
    trainer.train_epoch()?;
    let record = trainer.capture(0)?;
    let path = dir.path().join("roundtrip.pth");
    record.save(&path)?;

    let loaded = CheckpointRecord::load(&path, &Device::Cpu)?;
    assert_eq!(loaded.epoch, 0);
    assert_eq!(loaded.version, record.version);
    assert_eq!(loaded.config_sha256, record.config_sha256);
    assert_eq!(loaded.created_unix_timestamp, record.created_unix_timestamp);
    assert_eq!(loaded.optimizers, record.optimizers);
    assert_eq!(loaded.loss_history, record.loss_history);
    assert_eq!(loaded.model_state.len(), record.model_state.len());
    for ((name_a, a), (name_b, b)) in loaded.model_state.iter().zip(&record.model_state) {
        assert_eq!(name_a, name_b);
        assert_eq!(
            a.flatten_all()?.to_vec1::<f32>()?,
            b.flatten_all()?.to_vec1::<f32>()?
        );
    }

    let mut other_config = config;
    other_config.runtime.seed = 1234;
    let other = build_trainer(other_config)?;
    assert_ne!(
        snapshot(&other.model().parameters())?,
        snapshot(&trainer.model().parameters())?
    );
    loaded.apply_model_state(&other.model().parameters())?;
    assert_eq!(
        snapshot(&other.model().parameters())?,
        snapshot(&trainer.model().parameters())?
    );
    Ok(())
}

#[test]
fn captured_record_is_unaffected_by_later_training() -> Result<()> {
    let dir = tempdir()?;
    let mut trainer = build_trainer(gan_config(dir.path(), 2, 0.05))?;
    let record = trainer.capture(0)?;
    let captured = stored_values(&record.model_state)?;
    let live_before = snapshot(&trainer.model().parameters())?;

    trainer.train_epoch()?;

    assert_ne!(live_before, snapshot(&trainer.model().parameters())?);
    assert_eq!(captured, stored_values(&record.model_state)?);
    Ok(())
}

#[test]
fn incompatible_checkpoint_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let trainer = build_trainer(gan_config(dir.path(), 2, 0.05))?;
    let path = dir.path().join("small.pth");
    trainer.capture(0)?.save(&path)?;

    let mut wide = gan_config(dir.path(), 2, 0.05);
    wide.model.hidden_dims = Some(vec![32, 32]);
    let wide = build_trainer(wide)?;
    let loaded = CheckpointRecord::load(&path, &Device::Cpu)?;
    assert!(loaded.apply_model_state(&wide.model().parameters()).is_err());
    assert!(loaded
        .apply_model_state(&wide.model().generator_parameters())
        .is_err());
    Ok(())
}

#[test]
fn training_writes_best_and_temp_checkpoints_and_resumes() -> Result<()> {
    let dir = tempdir()?;
    let mut config = gan_config(dir.path(), 2, 0.05);
    config.runtime.epochs = Some(2);
    config.runtime.logging.export_loss_csv = true;

    let mut trainer = build_trainer(config.clone())?;
    let summary = trainer.train()?;
    assert_eq!(summary.epochs_completed, 2);
    assert!(!summary.interrupted);
    assert!(summary.best_path.is_file());
    assert!(summary.temp_path.is_file());
    assert!(trainer.checkpoints().loss_csv_path().is_file());
    assert_eq!(trainer.history().recorded_epochs(), 2);
    assert!(summary.best_metric <= 100.0);

    let temp = CheckpointRecord::load(&summary.temp_path, &Device::Cpu)?;
    assert_eq!(temp.epoch, 1);

    config.runtime.epochs = Some(4);
    let mut resumed = build_trainer(config)?;
    assert_eq!(resumed.resume_from_temp()?, Some(1));
    assert_eq!(resumed.start_epoch(), 2);
    assert_eq!(resumed.history().recorded_epochs(), 2);
    let best_rmse = resumed.history().best(2).expect("recorded rmse");
    assert_eq!(resumed.checkpoints().best_metric(), best_rmse.min(100.0));

    let summary = resumed.train()?;
    assert_eq!(summary.epochs_completed, 2);
    assert_eq!(resumed.history().recorded_epochs(), 4);
    Ok(())
}

#[test]
fn temp_and_best_files_follow_the_epoch_loop() -> Result<()> {
    let dir = tempdir()?;
    let mut config = gan_config(dir.path(), 2, 0.05);
    config.runtime.epochs = Some(12);
    config.runtime.checkpoint_every_n_epochs = 10;
    let mut trainer = build_trainer(config)?;
    let temp_path = trainer.checkpoints().temp_path();

    let mut polls = 0;
    let summary = trainer.train_with_shutdown(|| {
        polls += 1;
        polls > 5
    })?;
    assert_eq!(summary.epochs_completed, 5);
    assert_eq!(CheckpointRecord::load(&temp_path, &Device::Cpu)?.epoch, 0);

    let summary = trainer.train()?;
    assert_eq!(summary.epochs_completed, 7);
    let temp = CheckpointRecord::load(&temp_path, &Device::Cpu)?;
    assert_eq!(temp.epoch, 10);
    assert_eq!(temp.loss_history.recorded_epochs(), 11);

    // Later, worse epochs must not move the best file.
    let rmse = &trainer.history().channel(2)[..12];
    let best = CheckpointRecord::load(&summary.best_path, &Device::Cpu)?;
    assert_eq!(Some(best.epoch), last_argmin(rmse));
    assert_eq!(best.loss_history.get(2, best.epoch), Some(summary.best_metric));
    Ok(())
}

#[test]
fn resume_respects_a_best_file_newer_than_the_temp_file() -> Result<()> {
    let dir = tempdir()?;
    let mut config = gan_config(dir.path(), 2, 0.05);
    config.runtime.epochs = Some(4);
    config.runtime.checkpoint_every_n_epochs = 10;
    let mut trainer = build_trainer(config.clone())?;
    trainer.train()?;

    let best_path = trainer.checkpoints().best_path();
    let temp = CheckpointRecord::load(&trainer.checkpoints().temp_path(), &Device::Cpu)?;
    assert_eq!(temp.epoch, 0);
    assert_eq!(temp.loss_history.recorded_epochs(), 1);

    // Best written at epoch 3 with a metric the temp history never saw.
    let mut best = CheckpointRecord::load(&best_path, &Device::Cpu)?;
    let mut history = LossHistory::new(3, 4);
    for epoch in 0..4 {
        let rmse = if epoch == 3 { 1e-3 } else { 1.0 };
        history.record(epoch, &[1.0, 1.0, rmse])?;
    }
    best.epoch = 3;
    best.loss_history = history;
    best.save(&best_path)?;

    config.runtime.epochs = Some(6);
    let mut resumed = build_trainer(config)?;
    assert_eq!(resumed.resume_from_temp()?, Some(0));
    assert!((resumed.checkpoints().best_metric() - 1e-3).abs() < 1e-12);

    resumed.train()?;
    assert_eq!(CheckpointRecord::load(&best_path, &Device::Cpu)?.epoch, 3);
    Ok(())
}

#[test]
fn shutdown_request_stops_between_epochs() -> Result<()> {
    let dir = tempdir()?;
    let mut trainer = build_trainer(gan_config(dir.path(), 2, 0.05))?;
    let mut polls = 0;
    let summary = trainer.train_with_shutdown(|| {
        polls += 1;
        polls > 1
    })?;
    assert!(summary.interrupted);
    assert_eq!(summary.epochs_completed, 1);
    assert_eq!(trainer.history().recorded_epochs(), 1);
    Ok(())
}

#[test]
fn step_decay_applies_after_each_epoch() -> Result<()> {
    let dir = tempdir()?;
    let mut config = gan_config(dir.path(), 2, 0.05);
    config.runtime.epochs = Some(2);
    config.scheduler.enabled = true;
    config.scheduler.gamma = 0.5;
    config.scheduler.step_size = Some(1);
    config.optimizer.generator_learning_rate = 1e-3;
    config.optimizer.discriminator_learning_rate = 2e-3;

    let mut trainer = build_trainer(config)?;
    trainer.train()?;
    let (g_lr, d_lr) = trainer.learning_rates();
    assert!((g_lr - 2.5e-4).abs() < 1e-12);
    assert!((d_lr - 5e-4).abs() < 1e-12);
    Ok(())
}
