//! Horizon-weighted squared error.
//!
//! Both prediction and target are scaled by `sqrt(HORIZON - i)` at horizon
//! `i` before the squared error is taken, so the first step weighs twelve
//! times as much as the last. Missing targets (NaN) are excluded from both
//! the sum and the count.

use candle_core::{DType, Tensor};
use model::HORIZON;

use crate::{config::to_runtime_error, TrainingError};

/// Per-horizon rescale factors, `sqrt(HORIZON - i)`.
pub fn horizon_weights() -> [f32; HORIZON] {
    let mut weights = [0f32; HORIZON];
    for (i, weight) in weights.iter_mut().enumerate() {
        *weight = ((HORIZON - i) as f32).sqrt();
    }
    weights
}

/// Multiplies column `i` of a `[batch, HORIZON]` tensor by `sqrt(HORIZON - i)`.
pub fn rescale(values: &Tensor) -> Result<Tensor, TrainingError> {
    ensure_horizon_shape("values", values)?;
    let weights = Tensor::from_slice(&horizon_weights(), (1, HORIZON), values.device())
        .and_then(|w| w.to_dtype(values.dtype()))
        .map_err(to_runtime_error)?;
    values.broadcast_mul(&weights).map_err(to_runtime_error)
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar loss still attached to the prediction graph.
    pub loss: Tensor,
    pub value: f32,
    /// Number of non-missing targets that contributed.
    pub valid: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HorizonMseLoss;

impl HorizonMseLoss {
    pub fn new() -> Self {
        Self
    }

    /// Returns `None` when every target in the batch is missing.
    pub fn compute(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
    ) -> Result<Option<LossOutput>, TrainingError> {
        ensure_horizon_shape("predictions", predictions)?;
        if predictions.dims() != targets.dims() {
            return Err(TrainingError::runtime(format!(
                "prediction shape {:?} does not match target shape {:?}",
                predictions.dims(),
                targets.dims()
            )));
        }

        let targets = targets
            .to_dtype(predictions.dtype())
            .map_err(to_runtime_error)?;
        let present = targets.eq(&targets).map_err(to_runtime_error)?;
        let zeros = targets.zeros_like().map_err(to_runtime_error)?;
        let clean_targets = present
            .where_cond(&targets, &zeros)
            .map_err(to_runtime_error)?;
        let mask = present
            .to_dtype(predictions.dtype())
            .map_err(to_runtime_error)?;

        let valid = mask
            .sum_all()
            .and_then(|count| count.to_dtype(DType::F32))
            .and_then(|count| count.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize;
        if valid == 0 {
            return Ok(None);
        }

        let scaled_error = rescale(&(predictions - &clean_targets).map_err(to_runtime_error)?)?;
        let loss = (scaled_error.sqr().map_err(to_runtime_error)? * &mask)
            .and_then(|masked| masked.sum_all())
            .and_then(|sum| sum.affine(1.0 / valid as f64, 0.0))
            .map_err(to_runtime_error)?;
        let value = loss
            .to_dtype(DType::F32)
            .and_then(|l| l.to_vec0::<f32>())
            .map_err(to_runtime_error)?;

        Ok(Some(LossOutput { loss, value, valid }))
    }
}

fn ensure_horizon_shape(label: &str, tensor: &Tensor) -> Result<(), TrainingError> {
    match tensor.dims() {
        [_, horizon] if *horizon == HORIZON => Ok(()),
        dims => Err(TrainingError::runtime(format!(
            "{} must be shaped [batch, {}] (got {:?})",
            label, HORIZON, dims
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn row(values: impl Fn(usize) -> f32) -> Vec<f32> {
        (0..HORIZON).map(values).collect()
    }

    #[test]
    fn weights_decrease_with_horizon() {
        let weights = horizon_weights();
        assert!((weights[0] - 12f32.sqrt()).abs() < 1e-6);
        assert!((weights[HORIZON - 1] - 1.0).abs() < 1e-6);
        assert!(weights.windows(2).all(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn weighted_error_matches_manual_sum() {
        let device = Device::Cpu;
        let predictions = Tensor::from_vec(row(|_| 1.0), (1, HORIZON), &device).unwrap();
        let targets = Tensor::from_vec(row(|_| 0.0), (1, HORIZON), &device).unwrap();

        let output = HorizonMseLoss::new()
            .compute(&predictions, &targets)
            .unwrap()
            .unwrap();

        // mean of (12 - i) for i in 0..12
        assert_eq!(output.valid, HORIZON);
        assert!((output.value - 6.5).abs() < 1e-5);
    }

    #[test]
    fn missing_targets_are_ignored() {
        let device = Device::Cpu;
        let predictions = Tensor::from_vec(row(|_| 2.0), (1, HORIZON), &device).unwrap();
        let targets = Tensor::from_vec(
            row(|i| if i == HORIZON - 1 { 1.0 } else { f32::NAN }),
            (1, HORIZON),
            &device,
        )
        .unwrap();

        let output = HorizonMseLoss::new()
            .compute(&predictions, &targets)
            .unwrap()
            .unwrap();

        assert_eq!(output.valid, 1);
        assert!((output.value - 1.0).abs() < 1e-6);
    }

    #[test]
    fn all_missing_batch_yields_none() {
        let device = Device::Cpu;
        let predictions = Tensor::zeros((2, HORIZON), DType::F32, &device).unwrap();
        let targets = Tensor::from_vec(vec![f32::NAN; 2 * HORIZON], (2, HORIZON), &device).unwrap();

        assert!(HorizonMseLoss::new()
            .compute(&predictions, &targets)
            .unwrap()
            .is_none());
    }

    #[test]
    fn gradient_flows_into_predictions() {
        let device = Device::Cpu;
        let predictions = Var::zeros((1, HORIZON), DType::F32, &device).unwrap();
        let targets = Tensor::from_vec(
            row(|i| if i == 0 { 1.0 } else { f32::NAN }),
            (1, HORIZON),
            &device,
        )
        .unwrap();

        let output = HorizonMseLoss::new()
            .compute(predictions.as_tensor(), &targets)
            .unwrap()
            .unwrap();
        let grads = output.loss.backward().unwrap();
        let grad = grads
            .get(predictions.as_tensor())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        // d/dp 12 * (p - 1)^2 at p = 0
        assert!((grad[0][0] + 24.0).abs() < 1e-4);
        assert!(grad[0][1..].iter().all(|g| g.abs() < 1e-6));
    }

    #[test]
    fn rescale_rejects_wrong_width() {
        let values = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(rescale(&values).is_err());
    }
}
