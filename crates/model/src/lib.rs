pub mod config;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod recurrent;
pub mod seq2seq;

pub use config::{CellKind, Seq2SeqConfig, DECODER_STEPS, HORIZON};
pub use decoder::{Attention, Decoder};
pub use embedding::SiteEmbedding;
pub use encoder::{Encoder, EncoderOutput};
pub use recurrent::{CellState, RecurrentCell};
pub use seq2seq::{ForecastBatch, ForwardMode, McPrediction, Seq2Seq};
