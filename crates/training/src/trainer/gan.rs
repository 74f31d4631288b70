use std::path::Path;

use candle_core::{Device, Tensor};
use model::{sample_noise, ConditionalGan, GanConfig, Mlp, NoisePrior};
use rand::{rngs::StdRng, SeedableRng};

use super::{
    build_dataloaders, build_logger, ensure_kind, load_forward_surrogate, resumed_best_metric,
    resumed_seed, select_device, RunSummary,
};
use crate::{
    checkpoint::{CheckpointManager, CheckpointRecord},
    config::{to_runtime_error, ModelKind, ResolvedHyperparameters},
    data::{Batch, DataLoaders, Split},
    logging::{EpochReport, Logger},
    loss::{critic_loss, generator_loss, scalar},
    metrics::{inverse_design_rmse, EpochAccumulator, EvaluationSummary, LossHistory},
    optimizer::{OptimizerConfig, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

const GENERATOR_OPTIMIZER: &str = "generator";
const DISCRIMINATOR_OPTIMIZER: &str = "discriminator";

const HISTORY_CHANNELS: usize = 3;
const HISTORY_NAMES: [&str; HISTORY_CHANNELS] = ["train_loss", "val_loss", "val_rmse"];
const RMSE_CHANNEL: usize = 2;

/// Losses produced by one training batch. `generator` is `None` on batches
/// where only the critic was updated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchLosses {
    pub discriminator: f64,
    pub generator: Option<f64>,
}

/// Dataset-weighted averages of one training pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdversarialEpoch {
    pub generator: f64,
    pub discriminator: f64,
    pub total: f64,
}

/// Wasserstein cGAN trainer with weight clipping.
///
/// Every batch updates the critic; the generator is updated on every
/// `n_critic`-th batch (1-indexed) with the same noise draw.
pub struct GanTrainer {
    config: TrainingConfig,
    resolved: ResolvedHyperparameters,
    device: Device,
    model: ConditionalGan,
    forward_model: Mlp,
    loaders: DataLoaders,
    optimizer_g: TrainerOptimizer,
    optimizer_d: TrainerOptimizer,
    scheduler_g: Box<dyn LRScheduler>,
    scheduler_d: Box<dyn LRScheduler>,
    prior: NoisePrior,
    rng: StdRng,
    history: LossHistory,
    checkpoints: CheckpointManager,
    logger: Logger,
    start_epoch: usize,
}

impl GanTrainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.device);
        let forward_path = config.gan.forward_model_checkpoint.clone().ok_or_else(|| {
            TrainingError::initialization("gan.forward_model_checkpoint is not set")
        })?;
        let forward_model = load_forward_surrogate(&forward_path, &device)?;
        let loaders = build_dataloaders(&config, &device)?;
        let logger = build_logger(&config)?;
        Self::from_parts(config, loaders, forward_model, device, logger)
    }

    /// Assembles a trainer from already built loaders and surrogate.
    pub fn from_parts(
        config: TrainingConfig,
        loaders: DataLoaders,
        forward_model: Mlp,
        device: Device,
        logger: Logger,
    ) -> Result<Self, TrainingError> {
        let resolved = config.resolve()?;
        ensure_kind(&resolved, ModelKind::Gan)?;
        let prior = config.noise_prior()?;

        // The surrogate maps generated structure back to the response space.
        let surrogate = forward_model.config();
        if surrogate.input_dim != resolved.output_dim || surrogate.output_dim != resolved.input_dim
        {
            return Err(TrainingError::initialization(format!(
                "forward model maps {} -> {}, expected {} -> {}",
                surrogate.input_dim, surrogate.output_dim, resolved.output_dim, resolved.input_dim
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.runtime.seed);
        let gan_config = GanConfig {
            generator_hidden_dims: resolved.hidden_dims.clone(),
            critic_hidden_dims: resolved.critic_hidden_dims.clone(),
            ..GanConfig::new(resolved.input_dim, resolved.output_dim, config.model.noise_dim)
        };
        let model = ConditionalGan::new(gan_config, &mut rng, &device).map_err(to_runtime_error)?;

        let g_lr = config.optimizer.generator_learning_rate;
        let d_lr = config.optimizer.discriminator_learning_rate;
        let optimizer_g = TrainerOptimizer::new(
            model.generator_parameters(),
            OptimizerConfig::from_settings(&config.optimizer, g_lr),
        )?;
        let optimizer_d = TrainerOptimizer::new(
            model.discriminator_parameters(),
            OptimizerConfig::from_settings(&config.optimizer, d_lr),
        )?;
        let scheduler_g =
            SchedulerConfig::from_training_config(&config.scheduler, g_lr, resolved.decay_step_size)?
                .build()?;
        let scheduler_d =
            SchedulerConfig::from_training_config(&config.scheduler, d_lr, resolved.decay_step_size)?
                .build()?;

        let checkpoints = CheckpointManager::new(
            config.runtime.checkpoint_dir.clone(),
            resolved.run_name.clone(),
            config.runtime.checkpoint_every_n_epochs,
        );

        let parameter_count: usize = model
            .parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum();
        logger.info(format!(
            "Model {}, Number of parameters {}",
            ModelKind::Gan,
            parameter_count
        ));

        Ok(Self {
            history: LossHistory::new(HISTORY_CHANNELS, resolved.epochs),
            config,
            resolved,
            device,
            model,
            forward_model,
            loaders,
            optimizer_g,
            optimizer_d,
            scheduler_g,
            scheduler_d,
            prior,
            rng,
            checkpoints,
            logger,
            start_epoch: 0,
        })
    }

    pub fn model(&self) -> &ConditionalGan {
        &self.model
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn loaders_mut(&mut self) -> &mut DataLoaders {
        &mut self.loaders
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn generator_steps(&self) -> usize {
        self.optimizer_g.steps_taken()
    }

    pub fn discriminator_steps(&self) -> usize {
        self.optimizer_d.steps_taken()
    }

    /// Current `(generator, discriminator)` learning rates.
    pub fn learning_rates(&self) -> (f64, f64) {
        (
            self.optimizer_g.learning_rate(),
            self.optimizer_d.learning_rate(),
        )
    }

    fn draw_noise(&mut self, rows: usize) -> Result<Tensor, TrainingError> {
        sample_noise(
            rows,
            self.model.noise_dim(),
            self.prior,
            &mut self.rng,
            &self.device,
        )
        .map_err(to_runtime_error)
    }

    /// One critic update followed by weight clipping. Returns the critic loss
    /// and the noise it used.
    pub fn critic_step(&mut self, batch: &Batch) -> Result<(f64, Tensor), TrainingError> {
        let z = self.draw_noise(batch.len)?;
        let fake = self
            .model
            .generate_detached(&batch.x, &z)
            .map_err(to_runtime_error)?;
        let real_scores = self.model.score(&batch.y, &batch.x).map_err(to_runtime_error)?;
        let fake_scores = self.model.score(&fake, &batch.x).map_err(to_runtime_error)?;
        let loss = critic_loss(&real_scores, &fake_scores)?;
        let value = scalar(&loss, "discriminator loss")?;

        let mut grads = loss.backward().map_err(to_runtime_error)?;
        self.optimizer_d.step(&mut grads)?;
        self.model
            .clip_discriminator(self.config.gan.clip_value)
            .map_err(to_runtime_error)?;
        Ok((value, z))
    }

    /// One generator update with a fresh forward pass on `z`.
    pub fn generator_step(&mut self, batch: &Batch, z: &Tensor) -> Result<f64, TrainingError> {
        let fake = self.model.generate(&batch.x, z).map_err(to_runtime_error)?;
        let scores = self.model.score(&fake, &batch.x).map_err(to_runtime_error)?;
        let loss = generator_loss(&scores)?;
        let value = scalar(&loss, "generator loss")?;

        let mut grads = loss.backward().map_err(to_runtime_error)?;
        self.optimizer_g.step(&mut grads)?;
        Ok(value)
    }

    /// Trains on one batch. `batch_index` counts from 1 within the epoch.
    pub fn train_batch(
        &mut self,
        batch_index: usize,
        batch: &Batch,
    ) -> Result<BatchLosses, TrainingError> {
        let (discriminator, z) = self.critic_step(batch)?;
        let generator = if batch_index % self.config.gan.n_critic == 0 {
            Some(self.generator_step(batch, &z)?)
        } else {
            None
        };
        Ok(BatchLosses {
            discriminator,
            generator,
        })
    }

    pub fn train_epoch(&mut self) -> Result<AdversarialEpoch, TrainingError> {
        let batches = self.loaders.train.batches()?;
        let mut generator = EpochAccumulator::default();
        let mut discriminator = EpochAccumulator::default();
        for (index, batch) in batches.iter().enumerate() {
            let losses = self.train_batch(index + 1, batch)?;
            discriminator.add(losses.discriminator, batch.len);
            generator.add(losses.generator.unwrap_or(0.0), batch.len);
        }
        let (generator, discriminator) = (generator.mean(), discriminator.mean());
        Ok(AdversarialEpoch {
            generator,
            discriminator,
            total: generator + discriminator,
        })
    }

    /// Adversarial loss and inverse-design RMSE over `split` without updating
    /// any parameter.
    pub fn evaluate(&mut self, split: Split) -> Result<EvaluationSummary, TrainingError> {
        let batches = self.loaders.get_mut(split).batches()?;
        if batches.is_empty() {
            return Err(TrainingError::runtime(format!(
                "cannot evaluate on an empty {split:?} split"
            )));
        }

        let mut loss = EpochAccumulator::default();
        let mut truth = Vec::new();
        let mut predicted = Vec::new();
        for (index, batch) in batches.iter().enumerate() {
            let z = self.draw_noise(batch.len)?;
            let fake = self
                .model
                .generate_detached(&batch.x, &z)
                .map_err(to_runtime_error)?;
            let real_scores = self
                .model
                .score(&batch.y, &batch.x)
                .map(|t| t.detach())
                .map_err(to_runtime_error)?;
            let fake_scores = self
                .model
                .score(&fake, &batch.x)
                .map(|t| t.detach())
                .map_err(to_runtime_error)?;
            let d_loss = scalar(&critic_loss(&real_scores, &fake_scores)?, "validation loss")?;
            let g_loss = if (index + 1) % self.config.gan.n_critic == 0 {
                scalar(&generator_loss(&fake_scores)?, "validation loss")?
            } else {
                0.0
            };
            loss.add(g_loss + d_loss, batch.len);

            // Generated structure through the frozen surrogate, compared with
            // the requested response.
            let response = self
                .forward_model
                .forward(&fake)
                .map(|t| t.detach())
                .map_err(to_runtime_error)?;
            truth.extend(flatten(&batch.x)?);
            predicted.extend(flatten(&response)?);
        }

        let scaler = &self.loaders.response_scaler;
        let truth = scaler.inverse_transform(&truth);
        let predicted = scaler.inverse_transform(&predicted);
        let rmse = inverse_design_rmse(&truth, &predicted, scaler.width())?;
        Ok(EvaluationSummary {
            loss: loss.mean(),
            rmse: Some(rmse),
        })
    }

    pub fn train(&mut self) -> Result<RunSummary, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the remaining epochs, polling `should_stop` before each one.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<RunSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let mut interrupted = false;
        let mut epochs_completed = 0;
        for epoch in self.start_epoch..self.resolved.epochs {
            if should_stop() {
                self.logger
                    .info(format!("stopping before epoch {epoch}: shutdown requested"));
                interrupted = true;
                break;
            }

            let train = self.train_epoch()?;
            self.logger
                .log_adversarial_losses(epoch, train.generator, train.discriminator);
            let validation = self.evaluate(Split::Validation)?;
            let rmse = validation.rmse.ok_or_else(|| {
                TrainingError::runtime("evaluation did not produce an RMSE")
            })?;
            self.history
                .record(epoch, &[train.total, validation.loss, rmse])?;

            if self.checkpoints.observe(rmse) {
                self.save_checkpoint(epoch, &self.checkpoints.best_path())?;
            }
            self.logger.log_epoch(&EpochReport {
                epoch,
                train_loss: train.total,
                val_loss: validation.loss,
                val_rmse: Some(rmse),
                learning_rates: vec![
                    (
                        GENERATOR_OPTIMIZER.to_string(),
                        self.optimizer_g.learning_rate(),
                    ),
                    (
                        DISCRIMINATOR_OPTIMIZER.to_string(),
                        self.optimizer_d.learning_rate(),
                    ),
                ],
            });
            if self.checkpoints.should_save_periodic(epoch) {
                self.save_checkpoint(epoch, &self.checkpoints.temp_path())?;
            }

            self.step_schedulers();
            self.start_epoch = epoch + 1;
            epochs_completed += 1;
        }

        if self.config.runtime.logging.export_loss_csv {
            self.history
                .write_csv(&self.checkpoints.loss_csv_path(), &HISTORY_NAMES)?;
        }
        self.logger.flush();

        Ok(RunSummary {
            epochs_completed,
            best_metric: self.checkpoints.best_metric(),
            interrupted,
            best_path: self.checkpoints.best_path(),
            temp_path: self.checkpoints.temp_path(),
        })
    }

    fn step_schedulers(&mut self) {
        let d_lr = self.scheduler_d.step();
        let g_lr = self.scheduler_g.step();
        self.optimizer_d.set_learning_rate(d_lr);
        self.optimizer_g.set_learning_rate(g_lr);
    }

    pub fn capture(&self, epoch: usize) -> Result<CheckpointRecord, TrainingError> {
        CheckpointRecord::capture(
            epoch,
            &self.model.parameters(),
            &[
                (GENERATOR_OPTIMIZER, &self.optimizer_g),
                (DISCRIMINATOR_OPTIMIZER, &self.optimizer_d),
            ],
            &self.history,
            &self.config,
        )
    }

    fn save_checkpoint(&self, epoch: usize, path: &Path) -> Result<(), TrainingError> {
        self.capture(epoch)?.save(path)
    }

    /// Restores weights, optimizers, history and schedule from `path`; training
    /// continues at the epoch after the stored one.
    pub fn resume_from(&mut self, path: &Path) -> Result<usize, TrainingError> {
        let record = CheckpointRecord::load(path, &self.device)?;
        if record.config.kind != ModelKind::Gan {
            return Err(TrainingError::initialization(format!(
                "{} holds a {} run, cannot resume a gan run from it",
                path.display(),
                record.config.kind
            )));
        }
        record.apply_model_state(&self.model.parameters())?;
        record.apply_optimizer_state(GENERATOR_OPTIMIZER, &mut self.optimizer_g)?;
        record.apply_optimizer_state(DISCRIMINATOR_OPTIMIZER, &mut self.optimizer_d)?;
        self.history = record.loss_history.with_epochs(self.resolved.epochs);
        let best = resumed_best_metric(
            &self.history,
            RMSE_CHANNEL,
            &self.checkpoints.best_path(),
            &self.device,
        )?;
        self.checkpoints.restore_best_metric(best);

        self.start_epoch = record.epoch + 1;
        for _ in 0..self.start_epoch {
            self.step_schedulers();
        }
        let seed = resumed_seed(self.config.runtime.seed, self.start_epoch);
        self.rng = StdRng::seed_from_u64(seed);
        self.loaders.train.reseed(seed);
        self.logger.info(format!(
            "resumed from {} at epoch {}",
            path.display(),
            self.start_epoch
        ));
        Ok(record.epoch)
    }

    pub fn resume_from_temp(&mut self) -> Result<Option<usize>, TrainingError> {
        let path = self.checkpoints.temp_path();
        if !path.is_file() {
            self.logger
                .info(format!("no checkpoint at {}, starting fresh", path.display()));
            return Ok(None);
        }
        self.resume_from(&path).map(Some)
    }
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)
}
