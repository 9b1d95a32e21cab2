pub use model;
pub use training;

pub use model::{CellKind, ForecastBatch, ForwardMode, McPrediction, Seq2Seq, Seq2SeqConfig};
pub use training::{DataSplits, ForecastWindow, TestReport, Trainer, TrainingConfig};

use anyhow::Result;
use candle_core::Device;

/// Environment variable that pins execution to the CPU backend.
pub const FORCE_CPU_ENV: &str = "WINDCAST_FORCE_CPU";

pub fn setup_device() -> Result<Device> {
    if std::env::var(FORCE_CPU_ENV).is_ok() {
        log::info!("{} set, using CPU backend", FORCE_CPU_ENV);
        return Ok(Device::Cpu);
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        Ok(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
        Err(err) => {
            log::warn!("CUDA initialization failed, falling back to CPU: {}", err);
            Ok(Device::Cpu)
        }
    }
}

/// Loads a training config and builds a trainer on the detected device.
pub fn trainer_from_config(
    path: impl AsRef<std::path::Path>,
    train: Vec<ForecastWindow>,
    validation: Vec<ForecastWindow>,
    test: Vec<ForecastWindow>,
) -> Result<Trainer> {
    let config = TrainingConfig::from_path(path)?;
    let device = setup_device()?;
    let splits = DataSplits::from_windows(&config, &device, train, validation, test)?;
    Ok(Trainer::new(config, device, splits)?)
}
