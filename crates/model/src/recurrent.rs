//! Single-step recurrent cells with explicit state threading.
//!
//! Both the encoder and the decoder drive their cells one time step at a
//! time, so the wrapper only exposes `step`. Inputs are shaped
//! `(batch, in_dim)` and the hidden state is `(batch, hidden_dim)`. LSTM cells
//! additionally carry a memory cell of the same shape.

use candle_core::{Result, Tensor};
use candle_nn::{
    rnn::{self, GRUConfig, GRUState, LSTMConfig, LSTMState, GRU, LSTM, RNN},
    VarBuilder,
};

use crate::config::CellKind;

/// Hidden state carried between steps.
#[derive(Debug, Clone)]
pub struct CellState {
    pub h: Tensor,
    /// LSTM memory cell, `None` for GRU.
    pub c: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub enum RecurrentCell {
    Gru(GRU),
    Lstm(LSTM),
}

impl RecurrentCell {
    pub fn new(kind: CellKind, in_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        match kind {
            CellKind::Gru => rnn::gru(in_dim, hidden_dim, GRUConfig::default(), vb).map(Self::Gru),
            CellKind::Lstm => {
                rnn::lstm(in_dim, hidden_dim, LSTMConfig::default(), vb).map(Self::Lstm)
            }
        }
    }

    pub fn zero_state(&self, batch: usize) -> Result<CellState> {
        match self {
            RecurrentCell::Gru(cell) => {
                let state = cell.zero_state(batch)?;
                Ok(CellState {
                    h: state.h,
                    c: None,
                })
            }
            RecurrentCell::Lstm(cell) => {
                let state = cell.zero_state(batch)?;
                Ok(CellState {
                    h: state.h,
                    c: Some(state.c),
                })
            }
        }
    }

    /// State seeded from an externally computed hidden vector. The LSTM
    /// memory cell starts at zero.
    pub fn state_from_hidden(&self, hidden: &Tensor) -> Result<CellState> {
        let c = match self {
            RecurrentCell::Gru(_) => None,
            RecurrentCell::Lstm(_) => Some(hidden.zeros_like()?),
        };
        Ok(CellState {
            h: hidden.clone(),
            c,
        })
    }

    pub fn step(&self, input: &Tensor, state: &CellState) -> Result<CellState> {
        match self {
            RecurrentCell::Gru(cell) => {
                let next = cell.step(
                    input,
                    &GRUState {
                        h: state.h.clone(),
                    },
                )?;
                Ok(CellState { h: next.h, c: None })
            }
            RecurrentCell::Lstm(cell) => {
                let c = match &state.c {
                    Some(c) => c.clone(),
                    None => state.h.zeros_like()?,
                };
                let next = cell.step(
                    input,
                    &LSTMState {
                        h: state.h.clone(),
                        c,
                    },
                )?;
                Ok(CellState {
                    h: next.h,
                    c: Some(next.c),
                })
            }
        }
    }
}
