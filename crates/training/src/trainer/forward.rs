use std::path::Path;

use candle_core::Device;
use model::{Mlp, MlpConfig};
use rand::{rngs::StdRng, SeedableRng};

use super::{
    build_dataloaders, build_logger, ensure_kind, resumed_best_metric, resumed_seed, select_device,
    RunSummary,
};
use crate::{
    checkpoint::{CheckpointManager, CheckpointRecord},
    config::{to_runtime_error, ModelKind, ResolvedHyperparameters},
    data::{Batch, DataLoaders, Split},
    logging::{EpochReport, Logger},
    loss::{mse, scalar},
    metrics::{EpochAccumulator, EvaluationSummary, LossHistory},
    optimizer::{OptimizerConfig, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

const MODEL_OPTIMIZER: &str = "model";

const HISTORY_CHANNELS: usize = 2;
const HISTORY_NAMES: [&str; HISTORY_CHANNELS] = ["train_loss", "val_loss"];
const VAL_LOSS_CHANNEL: usize = 1;

/// Trains the structure -> response surrogate with an MSE objective. Its best
/// checkpoint is what a GAN run loads as the frozen evaluator.
pub struct ForwardTrainer {
    config: TrainingConfig,
    resolved: ResolvedHyperparameters,
    device: Device,
    model: Mlp,
    loaders: DataLoaders,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    history: LossHistory,
    checkpoints: CheckpointManager,
    logger: Logger,
    start_epoch: usize,
}

impl ForwardTrainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.device);
        let loaders = build_dataloaders(&config, &device)?;
        let logger = build_logger(&config)?;
        Self::from_parts(config, loaders, device, logger)
    }

    pub fn from_parts(
        config: TrainingConfig,
        loaders: DataLoaders,
        device: Device,
        logger: Logger,
    ) -> Result<Self, TrainingError> {
        let resolved = config.resolve()?;
        ensure_kind(&resolved, ModelKind::ForwardModel)?;

        let mut rng = StdRng::seed_from_u64(config.runtime.seed);
        let mlp_config = MlpConfig::forward_surrogate(
            resolved.input_dim,
            resolved.output_dim,
            resolved.hidden_dims.clone(),
        );
        let model = Mlp::new(mlp_config, &mut rng, &device).map_err(to_runtime_error)?;

        let lr = config.optimizer.learning_rate;
        let optimizer = TrainerOptimizer::new(
            model.parameters(""),
            OptimizerConfig::from_settings(&config.optimizer, lr),
        )?;
        let scheduler =
            SchedulerConfig::from_training_config(&config.scheduler, lr, resolved.decay_step_size)?
                .build()?;
        let checkpoints = CheckpointManager::new(
            config.runtime.checkpoint_dir.clone(),
            resolved.run_name.clone(),
            config.runtime.checkpoint_every_n_epochs,
        );
        logger.info(format!(
            "Model {}, Number of parameters {}",
            ModelKind::ForwardModel,
            model.num_parameters()
        ));

        Ok(Self {
            history: LossHistory::new(HISTORY_CHANNELS, resolved.epochs),
            config,
            resolved,
            device,
            model,
            loaders,
            optimizer,
            scheduler,
            checkpoints,
            logger,
            start_epoch: 0,
        })
    }

    pub fn model(&self) -> &Mlp {
        &self.model
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn train_batch(&mut self, batch: &Batch) -> Result<f64, TrainingError> {
        let prediction = self.model.forward(&batch.x).map_err(to_runtime_error)?;
        let loss = mse(&prediction, &batch.y)?;
        let value = scalar(&loss, "training loss")?;
        let mut grads = loss.backward().map_err(to_runtime_error)?;
        self.optimizer.step(&mut grads)?;
        Ok(value)
    }

    pub fn train_epoch(&mut self) -> Result<f64, TrainingError> {
        let mut loss = EpochAccumulator::default();
        for batch in self.loaders.train.batches()? {
            let value = self.train_batch(&batch)?;
            loss.add(value, batch.len);
        }
        Ok(loss.mean())
    }

    pub fn evaluate(&mut self, split: Split) -> Result<EvaluationSummary, TrainingError> {
        let batches = self.loaders.get_mut(split).batches()?;
        if batches.is_empty() {
            return Err(TrainingError::runtime(format!(
                "cannot evaluate on an empty {split:?} split"
            )));
        }
        let mut loss = EpochAccumulator::default();
        for batch in &batches {
            let prediction = self
                .model
                .forward(&batch.x)
                .map(|t| t.detach())
                .map_err(to_runtime_error)?;
            loss.add(scalar(&mse(&prediction, &batch.y)?, "validation loss")?, batch.len);
        }
        Ok(EvaluationSummary {
            loss: loss.mean(),
            rmse: None,
        })
    }

    pub fn train(&mut self) -> Result<RunSummary, TrainingError> {
        self.train_with_shutdown(|| false)
    }

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

            let train_loss = self.train_epoch()?;
            let validation = self.evaluate(Split::Validation)?;
            self.history
                .record(epoch, &[train_loss, validation.loss])?;

            if self.checkpoints.observe(validation.loss) {
                self.save_checkpoint(epoch, &self.checkpoints.best_path())?;
            }
            self.logger.log_epoch(&EpochReport {
                epoch,
                train_loss,
                val_loss: validation.loss,
                val_rmse: None,
                learning_rates: vec![(MODEL_OPTIMIZER.to_string(), self.optimizer.learning_rate())],
            });
            if self.checkpoints.should_save_periodic(epoch) {
                self.save_checkpoint(epoch, &self.checkpoints.temp_path())?;
            }

            let lr = self.scheduler.step();
            self.optimizer.set_learning_rate(lr);
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

    pub fn capture(&self, epoch: usize) -> Result<CheckpointRecord, TrainingError> {
        CheckpointRecord::capture(
            epoch,
            &self.model.parameters(""),
            &[(MODEL_OPTIMIZER, &self.optimizer)],
            &self.history,
            &self.config,
        )
    }

    fn save_checkpoint(&self, epoch: usize, path: &Path) -> Result<(), TrainingError> {
        self.capture(epoch)?.save(path)
    }

    pub fn resume_from(&mut self, path: &Path) -> Result<usize, TrainingError> {
        let record = CheckpointRecord::load(path, &self.device)?;
        if record.config.kind != ModelKind::ForwardModel {
            return Err(TrainingError::initialization(format!(
                "{} holds a {} run, cannot resume a forward_model run from it",
                path.display(),
                record.config.kind
            )));
        }
        record.apply_model_state(&self.model.parameters(""))?;
        record.apply_optimizer_state(MODEL_OPTIMIZER, &mut self.optimizer)?;
        self.history = record.loss_history.with_epochs(self.resolved.epochs);
        let best = resumed_best_metric(
            &self.history,
            VAL_LOSS_CHANNEL,
            &self.checkpoints.best_path(),
            &self.device,
        )?;
        self.checkpoints.restore_best_metric(best);

        self.start_epoch = record.epoch + 1;
        let mut lr = self.scheduler.learning_rate();
        for _ in 0..self.start_epoch {
            lr = self.scheduler.step();
        }
        self.optimizer.set_learning_rate(lr);
        self.loaders
            .train
            .reseed(resumed_seed(self.config.runtime.seed, self.start_epoch));
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
