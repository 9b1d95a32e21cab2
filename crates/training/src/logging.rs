//! Scalar event logging for training runs.
//!
//! Console output goes through the `log` facade; when a directory is
//! configured, the same scalars are also appended to a TensorBoard event file.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::EpochSummary,
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

pub struct Logger {
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self { tensorboard })
    }

    pub fn log_training_step(&mut self, step: usize, step_loss: f64, smoothed_loss: f64) {
        log::debug!(
            "train step={} loss={:.4} loss_ema={:.4}",
            step,
            step_loss,
            smoothed_loss
        );
        self.scalar("train/step_loss", step, step_loss);
        self.scalar("train/step_loss_ema", step, smoothed_loss);
    }

    pub fn log_epoch(
        &mut self,
        epoch: usize,
        train: &EpochSummary,
        validation: &EpochSummary,
        best_loss: Option<f64>,
    ) {
        log::info!(
            "epoch {} train loss={:.4} val loss={:.4}",
            epoch,
            train.loss,
            validation.loss
        );
        log::info!("train mae\n{}", EpochSummary::rows(&train.mae));
        log::info!("train rmse\n{}", EpochSummary::rows(&train.rmse));
        log::info!("val mae\n{}", EpochSummary::rows(&validation.mae));
        log::info!("val rmse\n{}", EpochSummary::rows(&validation.rmse));

        self.scalar("train/loss", epoch, train.loss);
        self.scalar("val/loss", epoch, validation.loss);
        if let Some(best) = best_loss {
            log::info!("best val loss={:.4}", best);
            self.scalar("val/best_loss", epoch, best);
        }
        self.horizon_scalars("train", epoch, train);
        self.horizon_scalars("val", epoch, validation);
    }

    pub fn log_test(&mut self, summary: &EpochSummary, percentage_diff: Option<f64>) {
        log::info!("test loss={:.4}", summary.loss);
        log::info!("test mae\n{}", EpochSummary::rows(&summary.mae));
        log::info!("test rmse\n{}", EpochSummary::rows(&summary.rmse));
        self.scalar("test/loss", 0, summary.loss);
        match percentage_diff {
            Some(pct) => {
                log::info!("average percentage difference {:.2}%", pct);
                self.scalar("test/percentage_diff", 0, pct);
            }
            None => log::warn!("no finite percentage differences in the test split"),
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{}", err);
            }
        }
    }

    fn horizon_scalars(&mut self, split: &str, step: usize, summary: &EpochSummary) {
        for (h, mae) in summary.mae.iter().enumerate() {
            self.scalar(&format!("{}/mae_h{:02}", split, h + 1), step, *mae);
        }
        for (h, rmse) in summary.rmse.iter().enumerate() {
            self.scalar(&format!("{}/rmse_h{:02}", split, h + 1), step, *rmse);
        }
    }

    fn scalar(&mut self, tag: &str, step: usize, value: f64) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.write_scalar(tag, step as i64, value) {
                log::warn!("{}", err);
            }
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    // TFRecord framing: len, masked crc(len), payload, masked crc(payload).
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
