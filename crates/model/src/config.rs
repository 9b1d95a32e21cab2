use std::{fmt, str::FromStr};

use candle_core::{DType, Device, Error, Result};
use serde::{Deserialize, Serialize};

/// Number of future steps produced by the decoder.
pub const HORIZON: usize = 12;

/// Decoder rows per sample: the seed step followed by the forecast horizon.
pub const DECODER_STEPS: usize = HORIZON + 1;

/// Recurrent cell used by both the encoder and the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    #[default]
    Gru,
    Lstm,
}

impl FromStr for CellKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "gru" => Ok(CellKind::Gru),
            "lstm" => Ok(CellKind::Lstm),
            other => Err(Error::Msg(format!("unsupported recurrent cell '{}'", other))),
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellKind::Gru => f.write_str("gru"),
            CellKind::Lstm => f.write_str("lstm"),
        }
    }
}

/// Hyperparameters for the encoder-decoder forecaster.
#[derive(Debug, Clone)]
pub struct Seq2SeqConfig {
    /// Hidden size of each encoder direction.
    pub enc_dim: usize,
    /// Hidden size of the decoder cell.
    pub dec_dim: usize,
    /// Channels per decoder row (target plus known covariates).
    pub input_dim: usize,
    /// Extra lagged channels carried only by the encoder (`k - 1` of them).
    pub k: usize,
    /// Fixed encoder sequence length; sizes the attention scores.
    pub enc_len: usize,
    /// Width of the per-site embedding, `0` disables it.
    pub embedding_dim: usize,
    /// Number of distinct site ids the embedding table holds.
    pub n_sites: usize,
    pub attention: bool,
    pub cell: CellKind,
    pub bidirectional: bool,
    /// Dropout probability applied to encoder and decoder inputs.
    pub dropout: f32,
    pub dtype: DType,
    pub device: Device,
}

impl Default for Seq2SeqConfig {
    fn default() -> Self {
        Self {
            enc_dim: 64,
            dec_dim: 32,
            input_dim: 4,
            k: 5,
            enc_len: 48,
            embedding_dim: 5,
            n_sites: 200,
            attention: false,
            cell: CellKind::Gru,
            bidirectional: false,
            dropout: 0.5,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }
}

impl Seq2SeqConfig {
    pub fn encoder_input_dim(&self) -> usize {
        self.input_dim + self.k - 1
    }

    pub fn decoder_input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn uses_embedding(&self) -> bool {
        self.embedding_dim > 0
    }

    /// Encoder cell input width once the site embedding is appended.
    pub fn encoder_feature_dim(&self) -> usize {
        self.encoder_input_dim() + self.embedding_dim
    }

    /// Decoder cell input width once the site embedding is appended.
    pub fn decoder_feature_dim(&self) -> usize {
        self.decoder_input_dim() + self.embedding_dim
    }

    pub fn directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Width of each encoder output step (directions concatenated).
    pub fn encoder_output_dim(&self) -> usize {
        self.enc_dim * self.directions()
    }

    pub fn validate(&self) -> Result<()> {
        if self.enc_dim == 0 {
            return Err(Error::Msg("enc_dim must be greater than zero".into()));
        }
        if self.dec_dim == 0 {
            return Err(Error::Msg("dec_dim must be greater than zero".into()));
        }
        if self.input_dim == 0 {
            return Err(Error::Msg(
                "input_dim must include at least the target channel".into(),
            ));
        }
        if self.k == 0 {
            return Err(Error::Msg("k must be greater than zero".into()));
        }
        if self.enc_len == 0 {
            return Err(Error::Msg("enc_len must be greater than zero".into()));
        }
        if self.uses_embedding() && self.n_sites == 0 {
            return Err(Error::Msg(
                "n_sites must be greater than zero when the site embedding is enabled".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg(format!(
                "dropout must be in [0, 1) (got {})",
                self.dropout
            )));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "model dtype must be floating point (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }
}
