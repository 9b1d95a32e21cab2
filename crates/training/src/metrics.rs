use candle_core::{DType, Tensor};
use model::HORIZON;

use crate::{config::to_runtime_error, TrainingError};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Mean absolute and root-mean-square error for each horizon step.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonErrors {
    pub mae: [f64; HORIZON],
    pub rmse: [f64; HORIZON],
}

/// Per-horizon errors of `predictions` against `targets`, both `[batch, HORIZON]`.
///
/// Missing targets are skipped column by column; a horizon with no observed
/// target reports zero.
pub fn horizon_errors(targets: &Tensor, predictions: &Tensor) -> Result<HorizonErrors, TrainingError> {
    let targets = host_rows(targets)?;
    let predictions = host_rows(predictions)?;
    if targets.len() != predictions.len() {
        return Err(TrainingError::runtime(
            "targets and predictions disagree on batch size",
        ));
    }

    let mut abs_sum = [0f64; HORIZON];
    let mut sq_sum = [0f64; HORIZON];
    let mut counts = [0usize; HORIZON];
    for (target_row, prediction_row) in targets.iter().zip(predictions.iter()) {
        for h in 0..HORIZON {
            let target = target_row[h];
            if target.is_nan() {
                continue;
            }
            let err = (target - prediction_row[h]) as f64;
            abs_sum[h] += err.abs();
            sq_sum[h] += err * err;
            counts[h] += 1;
        }
    }

    let mut errors = HorizonErrors {
        mae: [0.0; HORIZON],
        rmse: [0.0; HORIZON],
    };
    for h in 0..HORIZON {
        if counts[h] > 0 {
            let n = counts[h] as f64;
            errors.mae[h] = abs_sum[h] / n;
            errors.rmse[h] = (sq_sum[h] / n).sqrt();
        }
    }
    Ok(errors)
}

/// Running sums over one pass, averaged per batch on finalize.
#[derive(Debug, Default)]
pub struct RunningMetrics {
    loss_sum: f64,
    mae_sum: [f64; HORIZON],
    rmse_sum: [f64; HORIZON],
    batches: usize,
}

impl RunningMetrics {
    pub fn update(&mut self, loss: f64, errors: &HorizonErrors) {
        self.loss_sum += loss;
        for h in 0..HORIZON {
            self.mae_sum[h] += errors.mae[h];
            self.rmse_sum[h] += errors.rmse[h];
        }
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn finalize(self) -> Option<EpochSummary> {
        if self.batches == 0 {
            return None;
        }
        let n = self.batches as f64;
        Some(EpochSummary {
            loss: self.loss_sum / n,
            mae: self.mae_sum.map(|sum| sum / n),
            rmse: self.rmse_sum.map(|sum| sum / n),
            batches: self.batches,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub loss: f64,
    pub mae: [f64; HORIZON],
    pub rmse: [f64; HORIZON],
    pub batches: usize,
}

impl EpochSummary {
    /// Renders per-horizon values as two rows of six.
    pub fn rows(values: &[f64; HORIZON]) -> String {
        values
            .chunks(HORIZON / 2)
            .map(|row| {
                let cells: Vec<String> = row.iter().map(|v| format!("{:.4}", v)).collect();
                format!("[{}]", cells.join(" "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Signed relative error in percent, `(target - prediction) / target * 100`,
/// accumulated over finite entries only.
#[derive(Debug, Default)]
pub struct PercentageError {
    sum: f64,
    count: usize,
}

impl PercentageError {
    pub fn update(&mut self, targets: &Tensor, predictions: &Tensor) -> Result<(), TrainingError> {
        let targets = host_rows(targets)?;
        let predictions = host_rows(predictions)?;
        for (target_row, prediction_row) in targets.iter().zip(predictions.iter()) {
            for (target, prediction) in target_row.iter().zip(prediction_row.iter()) {
                let pct = ((target - prediction) / target) as f64 * 100.0;
                if pct.is_finite() {
                    self.sum += pct;
                    self.count += 1;
                }
            }
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

fn host_rows(tensor: &Tensor) -> Result<Vec<Vec<f32>>, TrainingError> {
    match tensor.dims() {
        [_, horizon] if *horizon == HORIZON => tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec2::<f32>())
            .map_err(to_runtime_error),
        dims => Err(TrainingError::runtime(format!(
            "expected [batch, {}] tensor, got {:?}",
            HORIZON, dims
        ))),
    }
}
