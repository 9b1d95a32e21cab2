//! Autoregressive decoder.
//!
//! The decoder never sees future targets: step `i` is fed the known
//! covariates of row `i` followed by its own prediction for row `i`, which is
//! why the next input is assembled inside the loop rather than precomputed.

use candle_core::{Error, IndexOp, Result, Tensor, D};
use candle_nn::{ops, Dropout, Linear, Module, VarBuilder};

use crate::{
    config::{Seq2SeqConfig, DECODER_STEPS, HORIZON},
    recurrent::RecurrentCell,
};

/// Additive-style attention over the fixed-length encoder outputs.
#[derive(Debug, Clone)]
pub struct Attention {
    score: Linear,
    combine: Linear,
    enc_len: usize,
}

impl Attention {
    pub fn new(config: &Seq2SeqConfig, vb: VarBuilder) -> Result<Self> {
        let feature_dim = config.decoder_feature_dim();
        let score = candle_nn::linear(feature_dim + config.dec_dim, config.enc_len, vb.pp("attn"))?;
        let combine = candle_nn::linear(
            config.encoder_output_dim() + feature_dim,
            feature_dim,
            vb.pp("attn_combined"),
        )?;
        Ok(Self {
            score,
            combine,
            enc_len: config.enc_len,
        })
    }

    /// Returns the attention weights `[batch, enc_len]` for one step.
    pub fn weights(&self, input: &Tensor, hidden: &Tensor) -> Result<Tensor> {
        let scores = self.score.forward(&Tensor::cat(&[input, hidden], 1)?)?;
        ops::softmax(&scores, D::Minus1)
    }

    /// Mixes the attended encoder context into the step input, keeping the
    /// input width unchanged.
    pub fn forward(&self, input: &Tensor, hidden: &Tensor, encoder_outputs: &Tensor) -> Result<Tensor> {
        let weights = self.weights(input, hidden)?;
        let context = weights.unsqueeze(1)?.matmul(encoder_outputs)?.squeeze(1)?;
        self.combine.forward(&Tensor::cat(&[&context, input], 1)?)
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    cell: RecurrentCell,
    fc: Linear,
    dropout: Dropout,
    attention: Option<Attention>,
    input_dim: usize,
}

impl Decoder {
    pub fn new(config: &Seq2SeqConfig, vb: VarBuilder) -> Result<Self> {
        let cell = RecurrentCell::new(
            config.cell,
            config.decoder_feature_dim(),
            config.dec_dim,
            vb.pp("rnn"),
        )?;
        let fc = candle_nn::linear(config.dec_dim, 1, vb.pp("fc"))?;
        let attention = if config.attention {
            Some(Attention::new(config, vb.clone())?)
        } else {
            None
        };
        Ok(Self {
            cell,
            fc,
            dropout: Dropout::new(config.dropout),
            attention,
            input_dim: config.decoder_input_dim(),
        })
    }

    /// Unrolls the horizon and returns predictions shaped `[batch, HORIZON]`.
    ///
    /// `decoder_input` is `[batch, DECODER_STEPS, input_dim]` with the target
    /// in channel 0. Only row 0's target is read; later rows contribute their
    /// covariates. Missing values (NaN) are fed as zero.
    pub fn forward(
        &self,
        decoder_input: &Tensor,
        encoder_outputs: &Tensor,
        hidden: &Tensor,
        site: Option<&Tensor>,
        dropout_active: bool,
    ) -> Result<Tensor> {
        let (_batch, steps, features) = decoder_input.dims3()?;
        if steps != DECODER_STEPS {
            return Err(Error::Msg(format!(
                "decoder expects {} rows per sample but received {}",
                DECODER_STEPS, steps
            )));
        }
        if features != self.input_dim {
            return Err(Error::Msg(format!(
                "decoder expected {} input features but received {}",
                self.input_dim, features
            )));
        }
        if let Some(attention) = &self.attention {
            let enc_len = encoder_outputs.dim(1)?;
            if enc_len != attention.enc_len {
                return Err(Error::Msg(format!(
                    "attention is sized for {} encoder steps but received {}",
                    attention.enc_len, enc_len
                )));
            }
        }

        let decoder_input = zero_missing(decoder_input)?;
        let mut input = decoder_input.i((.., 0, ..))?.contiguous()?;
        let mut state = self.cell.state_from_hidden(hidden)?;
        let mut predictions = Vec::with_capacity(HORIZON);

        for step in 1..DECODER_STEPS {
            let mut step_input = match site {
                Some(site) => Tensor::cat(&[&input, site], 1)?,
                None => input,
            };
            step_input = self.dropout.forward(&step_input, dropout_active)?;
            if let Some(attention) = &self.attention {
                step_input = attention.forward(&step_input, &state.h, encoder_outputs)?;
            }

            state = self.cell.step(&step_input, &state)?;
            let prediction = self.fc.forward(&state.h)?;

            input = if features > 1 {
                let covariates = decoder_input.i((.., step, 1..))?.contiguous()?;
                Tensor::cat(&[&covariates, &prediction], 1)?
            } else {
                prediction.clone()
            };
            predictions.push(prediction);
        }

        Tensor::cat(&predictions, 1)
    }
}

/// Replaces NaN entries with zero.
pub fn zero_missing(values: &Tensor) -> Result<Tensor> {
    let present = values.eq(values)?;
    present.where_cond(values, &values.zeros_like()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn zero_missing_keeps_observed_values() {
        let values = Tensor::new(&[[1.0f32, f32::NAN], [f32::NAN, -2.5]], &Device::Cpu).unwrap();
        let cleaned = zero_missing(&values).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(cleaned, vec![vec![1.0, 0.0], vec![0.0, -2.5]]);
    }
}
