use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use model::{ForwardMode, Seq2Seq};

use crate::{
    checkpoint::{self, CheckpointDescriptor, SaveRequest},
    config::to_runtime_error,
    data::{DataSplits, ForecastDataLoader},
    early_stopping::EarlyStopping,
    logging::{Logger, LoggingSettings},
    loss::{rescale, HorizonMseLoss},
    metrics::{
        horizon_errors, EpochSummary, ExponentialMovingAverage, PercentageError, RunningMetrics,
    },
    TrainingConfig, TrainingError,
};

const STEP_LOSS_SMOOTHING: f64 = 0.1;

/// Result of Monte Carlo evaluation on the test split.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub summary: EpochSummary,
    /// Mean of `(target - prediction) / target * 100` over finite entries.
    pub average_percentage_diff: Option<f64>,
    /// Rescaled targets, `[windows, HORIZON]`, NaN where unobserved.
    pub y_true: Tensor,
    /// Rescaled mean prediction.
    pub y_pred: Tensor,
    /// Rescaled spread of the Monte Carlo draws.
    pub y_std: Tensor,
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    model: Seq2Seq,
    optimizer: AdamW,
    loss: HorizonMseLoss,
    splits: DataSplits,
    early_stopping: EarlyStopping,
    logger: Logger,
    loss_ema: ExponentialMovingAverage,
    global_step: usize,
    epochs_completed: usize,
}

impl Trainer {
    pub fn new(
        config: TrainingConfig,
        device: Device,
        splits: DataSplits,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        if splits.train.is_empty() {
            return Err(TrainingError::initialization("training split is empty"));
        }
        if splits.validation.is_empty() {
            return Err(TrainingError::initialization("validation split is empty"));
        }

        if let Err(err) = device.set_seed(config.runtime.seed) {
            log::warn!("failed to seed device RNG: {}", err);
        }

        let model = Seq2Seq::new(config.model.to_model_config(device.clone()))
            .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;
        let parameter_count = model.parameter_count().map_err(to_runtime_error)?;
        if parameter_count == 0 {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        log::info!(
            "model ready: cell={} attention={} bidirectional={} parameters={}",
            config.model.cell,
            config.model.attention,
            config.model.bidirectional,
            parameter_count
        );

        let optimizer = AdamW::new(
            model.trainable_vars(),
            ParamsAdamW {
                lr: config.optimizer.learning_rate,
                beta1: config.optimizer.beta1,
                beta2: config.optimizer.beta2,
                eps: config.optimizer.epsilon,
                weight_decay: config.optimizer.weight_decay,
            },
        )
        .map_err(|err| {
            TrainingError::initialization(format!("failed to build optimizer: {err}"))
        })?;

        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
        let early_stopping = EarlyStopping::new(
            config.early_stopping.patience,
            config.early_stopping.min_delta,
        );

        Ok(Self {
            config,
            device,
            model,
            optimizer,
            loss: HorizonMseLoss::new(),
            splits,
            early_stopping,
            logger,
            loss_ema: ExponentialMovingAverage::new(STEP_LOSS_SMOOTHING),
            global_step: 0,
            epochs_completed: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &Seq2Seq {
        &self.model
    }

    pub fn early_stopping(&self) -> &EarlyStopping {
        &self.early_stopping
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    /// One optimisation pass over the training split.
    pub fn fit(&mut self) -> Result<EpochSummary, TrainingError> {
        self.splits.train.reset();
        let mut running = RunningMetrics::default();
        let log_every = self.config.runtime.log_every_n_steps.max(1);

        while let Some(batch) = self.splits.train.next_batch()? {
            let predictions = self
                .model
                .forward(&batch, ForwardMode::Training)
                .map_err(to_runtime_error)?;
            let targets = batch.targets().map_err(to_runtime_error)?;

            let Some(output) = self.loss.compute(&predictions, &targets)? else {
                log::warn!("skipping training batch without observed targets");
                continue;
            };
            let value = output.value as f64;
            if !value.is_finite() {
                return Err(TrainingError::runtime(format!(
                    "non-finite training loss at step {}",
                    self.global_step + 1
                )));
            }
            let errors = horizon_errors(&targets, &predictions)?;

            self.optimizer
                .backward_step(&output.loss)
                .map_err(to_runtime_error)?;
            self.global_step += 1;

            let smoothed = self.loss_ema.update(value);
            if self.global_step % log_every == 0 {
                self.logger
                    .log_training_step(self.global_step, value, smoothed);
            }
            running.update(value, &errors);
        }

        running
            .finalize()
            .ok_or_else(|| TrainingError::runtime("training split produced no usable batches"))
    }

    /// Scores the validation split with dropout disabled.
    pub fn validate(&mut self) -> Result<EpochSummary, TrainingError> {
        self.splits.validation.reset();
        let mut running = RunningMetrics::default();

        while let Some(batch) = self.splits.validation.next_batch()? {
            let predictions = self
                .model
                .forward(&batch, ForwardMode::Inference)
                .map_err(to_runtime_error)?;
            let targets = batch.targets().map_err(to_runtime_error)?;

            let Some(output) = self.loss.compute(&predictions, &targets)? else {
                continue;
            };
            let errors = horizon_errors(&targets, &predictions)?;
            running.update(output.value as f64, &errors);
        }

        running
            .finalize()
            .ok_or_else(|| TrainingError::runtime("validation split produced no usable batches"))
    }

    /// Runs up to `epochs` fit/validate rounds, stopping early when validation
    /// loss stalls, then saves the weights. Returns the last training summary.
    pub fn train(&mut self, epochs: usize) -> Result<EpochSummary, TrainingError> {
        if epochs == 0 {
            return Err(TrainingError::runtime("epochs must be greater than zero"));
        }
        log::info!(
            "starting training on {:?} for up to {} epoch(s), {} batch(es) per epoch",
            self.device,
            epochs,
            self.splits.train.num_batches()
        );

        let mut last_train = None;
        for _ in 0..epochs {
            let train = self.fit()?;
            let validation = self.validate()?;
            self.epochs_completed += 1;

            self.early_stopping.observe(validation.loss);
            self.logger.log_epoch(
                self.epochs_completed,
                &train,
                &validation,
                self.early_stopping.best_loss(),
            );
            last_train = Some(train);

            if self.early_stopping.should_stop() {
                log::info!("stopping early after epoch {}", self.epochs_completed);
                break;
            }
        }

        self.save_weights()?;
        self.logger.flush();
        last_train.ok_or_else(|| TrainingError::runtime("no epoch completed"))
    }

    /// Writes the current weights to `<output_dir>/<save_name>`.
    pub fn save_weights(&self) -> Result<CheckpointDescriptor, TrainingError> {
        let directory = self.config.runtime.checkpoint_dir();
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            directory: &directory,
            config: &self.config,
            model: &self.model,
            epoch: self.epochs_completed,
            best_val_loss: self.early_stopping.best_loss(),
        })?;
        log::info!("saved weights to {}", directory.display());
        Ok(descriptor)
    }

    /// Monte Carlo dropout evaluation over the test split.
    pub fn report_test_error(&mut self) -> Result<TestReport, TrainingError> {
        let samples = self.config.evaluation.mc_samples;
        log::info!("calculating test error with {} dropout samples", samples);

        self.splits.test.reset();
        let mut running = RunningMetrics::default();
        let mut percentage = PercentageError::default();
        let mut y_true = Vec::new();
        let mut y_pred = Vec::new();
        let mut y_std = Vec::new();

        while let Some(batch) = self.splits.test.next_batch()? {
            let mc = self
                .model
                .monte_carlo(&batch, samples)
                .map_err(to_runtime_error)?;
            let targets = batch.targets().map_err(to_runtime_error)?;

            let true_scaled = rescale(&targets)?;
            let pred_scaled = rescale(&mc.mean)?;
            percentage.update(&true_scaled, &pred_scaled)?;

            if let Some(output) = self.loss.compute(&mc.mean, &targets)? {
                let errors = horizon_errors(&targets, &mc.mean)?;
                running.update(output.value as f64, &errors);
            }

            y_true.push(true_scaled);
            y_pred.push(pred_scaled);
            y_std.push(rescale(&mc.std)?);
        }

        let summary = running
            .finalize()
            .ok_or_else(|| TrainingError::runtime("test split produced no usable batches"))?;
        let average_percentage_diff = percentage.average();
        self.logger.log_test(&summary, average_percentage_diff);
        self.logger.flush();

        Ok(TestReport {
            summary,
            average_percentage_diff,
            y_true: Tensor::cat(&y_true, 0).map_err(to_runtime_error)?,
            y_pred: Tensor::cat(&y_pred, 0).map_err(to_runtime_error)?,
            y_std: Tensor::cat(&y_std, 0).map_err(to_runtime_error)?,
        })
    }

    /// Loads saved weights (a checkpoint directory or a `.safetensors` file)
    /// and reports test error with them.
    pub fn evaluate_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<TestReport, TrainingError> {
        let path = path.as_ref();
        match checkpoint::load_weights(&self.model, path)? {
            Some(manifest) => log::info!(
                "loaded weights from {} (epoch {}, best val loss {:?})",
                path.display(),
                manifest.epoch,
                manifest.best_val_loss
            ),
            None => log::info!("loaded weights from {}", path.display()),
        }
        self.report_test_error()
    }
}
