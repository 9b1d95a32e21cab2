use candle_core::{Error, IndexOp, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::{
    config::Seq2SeqConfig,
    recurrent::{CellState, RecurrentCell},
};

/// Encoder result consumed by the decoder.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Per-step hidden states shaped `[batch, seq, enc_dim * directions]`.
    pub outputs: Tensor,
    /// Initial decoder hidden state shaped `[batch, dec_dim]`.
    pub hidden: Tensor,
}

/// Uni- or bidirectional recurrent encoder over the observed window.
#[derive(Debug, Clone)]
pub struct Encoder {
    forward_cell: RecurrentCell,
    backward_cell: Option<RecurrentCell>,
    fc: Linear,
    dropout: Dropout,
    input_dim: usize,
}

impl Encoder {
    pub fn new(config: &Seq2SeqConfig, vb: VarBuilder) -> Result<Self> {
        let feature_dim = config.encoder_feature_dim();
        let forward_cell =
            RecurrentCell::new(config.cell, feature_dim, config.enc_dim, vb.pp("rnn_forward"))?;
        let backward_cell = if config.bidirectional {
            Some(RecurrentCell::new(
                config.cell,
                feature_dim,
                config.enc_dim,
                vb.pp("rnn_backward"),
            )?)
        } else {
            None
        };
        let fc = candle_nn::linear(config.encoder_output_dim(), config.dec_dim, vb.pp("fc"))?;

        Ok(Self {
            forward_cell,
            backward_cell,
            fc,
            dropout: Dropout::new(config.dropout),
            input_dim: config.encoder_input_dim(),
        })
    }

    /// Encodes `inputs` shaped `[batch, seq, encoder_input_dim]`.
    ///
    /// `site` is the per-sample embedding `[batch, embedding_dim]`; it is
    /// repeated across every time step before dropout is applied.
    pub fn forward(
        &self,
        inputs: &Tensor,
        site: Option<&Tensor>,
        dropout_active: bool,
    ) -> Result<EncoderOutput> {
        let (batch, seq_len, features) = inputs.dims3()?;
        if features != self.input_dim {
            return Err(Error::Msg(format!(
                "encoder expected {} input features but received {}",
                self.input_dim, features
            )));
        }
        if seq_len == 0 {
            return Err(Error::Msg("encoder sequence must not be empty".into()));
        }

        let inputs = match site {
            Some(site) => {
                let repeated = site
                    .unsqueeze(1)?
                    .broadcast_as((batch, seq_len, site.dim(1)?))?
                    .contiguous()?;
                Tensor::cat(&[inputs, &repeated], 2)?
            }
            None => inputs.clone(),
        };
        let inputs = self.dropout.forward(&inputs, dropout_active)?;

        let forward_states = run_direction(&self.forward_cell, &inputs, false)?;
        let mut last = forward_states[seq_len - 1].clone();
        let mut outputs = Tensor::stack(&forward_states, 1)?;

        if let Some(cell) = &self.backward_cell {
            let backward_states = run_direction(cell, &inputs, true)?;
            // After the reverse pass the backward cell's final state sits at t = 0.
            last = Tensor::cat(&[&last, &backward_states[0]], 1)?;
            let backward_outputs = Tensor::stack(&backward_states, 1)?;
            outputs = Tensor::cat(&[&outputs, &backward_outputs], 2)?;
        }

        let hidden = self.fc.forward(&last)?.tanh()?;
        Ok(EncoderOutput { outputs, hidden })
    }
}

/// Runs one direction over the sequence and returns the hidden state for
/// each time step, indexed by input position.
fn run_direction(cell: &RecurrentCell, inputs: &Tensor, reverse: bool) -> Result<Vec<Tensor>> {
    let (batch, seq_len, _) = inputs.dims3()?;
    let mut state: CellState = cell.zero_state(batch)?;
    let mut hidden = Vec::with_capacity(seq_len);

    let order: Box<dyn Iterator<Item = usize>> = if reverse {
        Box::new((0..seq_len).rev())
    } else {
        Box::new(0..seq_len)
    };
    for t in order {
        let step_input = inputs.i((.., t, ..))?.contiguous()?;
        state = cell.step(&step_input, &state)?;
        hidden.push(state.h.clone());
    }

    if reverse {
        hidden.reverse();
    }
    Ok(hidden)
}
