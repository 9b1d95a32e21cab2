//! Collation of pre-windowed samples into model batches.
//!
//! Windowing raw series is left to the caller; this module only receives
//! fixed-shape windows and stacks them into batch-first tensors.

use candle_core::{Device, Tensor};
use model::{ForecastBatch, Seq2SeqConfig, DECODER_STEPS};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{config::to_runtime_error, TrainingConfig, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One sample: the observed window plus the seed/horizon rows, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastWindow {
    pub site: u32,
    /// `enc_len * encoder_features` values.
    pub encoder: Vec<f32>,
    /// `DECODER_STEPS * decoder_features` values, target in column 0.
    pub decoder: Vec<f32>,
}

/// Expected per-window layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShape {
    pub enc_len: usize,
    pub encoder_features: usize,
    pub decoder_features: usize,
}

impl WindowShape {
    pub fn for_model(config: &Seq2SeqConfig) -> Self {
        Self {
            enc_len: config.enc_len,
            encoder_features: config.encoder_input_dim(),
            decoder_features: config.decoder_input_dim(),
        }
    }

    pub fn encoder_len(&self) -> usize {
        self.enc_len * self.encoder_features
    }

    pub fn decoder_len(&self) -> usize {
        DECODER_STEPS * self.decoder_features
    }
}

/// Source of batches for one data split, replayed once per epoch.
pub trait ForecastDataLoader: Send {
    /// Rewinds to the first batch of a new pass.
    fn reset(&mut self);

    fn next_batch(&mut self) -> Result<Option<ForecastBatch>>;

    /// Number of windows in the split.
    fn len(&self) -> usize;

    fn batch_size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_batches(&self) -> usize {
        let batch_size = self.batch_size().max(1);
        (self.len() + batch_size - 1) / batch_size
    }
}

/// Loader over windows held in memory. Batches are formed from consecutive
/// windows; the final batch may be short.
pub struct InMemoryDataLoader {
    windows: Vec<ForecastWindow>,
    order: Vec<usize>,
    cursor: usize,
    shape: WindowShape,
    batch_size: usize,
    device: Device,
    shuffle: Option<StdRng>,
}

impl InMemoryDataLoader {
    pub fn new(
        windows: Vec<ForecastWindow>,
        shape: WindowShape,
        batch_size: usize,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if shape.enc_len == 0 || shape.encoder_features == 0 || shape.decoder_features == 0 {
            return Err(TrainingError::initialization(
                "window shape dimensions must be greater than zero",
            ));
        }
        for (idx, window) in windows.iter().enumerate() {
            if window.encoder.len() != shape.encoder_len() {
                return Err(TrainingError::initialization(format!(
                    "window {} has {} encoder values, expected {}",
                    idx,
                    window.encoder.len(),
                    shape.encoder_len()
                )));
            }
            if window.decoder.len() != shape.decoder_len() {
                return Err(TrainingError::initialization(format!(
                    "window {} has {} decoder values, expected {}",
                    idx,
                    window.decoder.len(),
                    shape.decoder_len()
                )));
            }
        }

        let order = (0..windows.len()).collect();
        Ok(Self {
            windows,
            order,
            cursor: 0,
            shape,
            batch_size,
            device,
            shuffle: None,
        })
    }

    /// Reorders windows with a seeded RNG at every [`reset`](ForecastDataLoader::reset).
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(StdRng::seed_from_u64(seed));
        self
    }
}

impl ForecastDataLoader for InMemoryDataLoader {
    fn reset(&mut self) {
        self.cursor = 0;
        if let Some(rng) = self.shuffle.as_mut() {
            self.order.shuffle(rng);
        }
    }

    fn next_batch(&mut self) -> Result<Option<ForecastBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let selected = &self.order[self.cursor..end];
        self.cursor = end;

        let batch = selected.len();
        let mut ids = Vec::with_capacity(batch);
        let mut encoder = Vec::with_capacity(batch * self.shape.encoder_len());
        let mut decoder = Vec::with_capacity(batch * self.shape.decoder_len());
        for &idx in selected {
            let window = &self.windows[idx];
            ids.push(window.site);
            encoder.extend_from_slice(&window.encoder);
            decoder.extend_from_slice(&window.decoder);
        }

        let ids = Tensor::from_vec(ids, batch, &self.device).map_err(to_runtime_error)?;
        let encoder_input = Tensor::from_vec(
            encoder,
            (batch, self.shape.enc_len, self.shape.encoder_features),
            &self.device,
        )
        .map_err(to_runtime_error)?;
        let decoder_input = Tensor::from_vec(
            decoder,
            (batch, DECODER_STEPS, self.shape.decoder_features),
            &self.device,
        )
        .map_err(to_runtime_error)?;

        Ok(Some(ForecastBatch {
            ids,
            encoder_input,
            decoder_input,
        }))
    }

    fn len(&self) -> usize {
        self.windows.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Train, validation and test loaders handed to the trainer.
pub struct DataSplits {
    pub train: Box<dyn ForecastDataLoader>,
    pub validation: Box<dyn ForecastDataLoader>,
    pub test: Box<dyn ForecastDataLoader>,
}

impl DataSplits {
    /// Builds in-memory loaders sized by `config.data`; the training split is
    /// reshuffled each epoch when `data.shuffle` is set.
    pub fn from_windows(
        config: &TrainingConfig,
        device: &Device,
        train: Vec<ForecastWindow>,
        validation: Vec<ForecastWindow>,
        test: Vec<ForecastWindow>,
    ) -> Result<Self> {
        let shape = WindowShape::for_model(&config.model.to_model_config(device.clone()));
        let batch_size = config.data.batch_size;

        let mut train = InMemoryDataLoader::new(train, shape, batch_size, device.clone())?;
        if config.data.shuffle {
            train = train.with_shuffle(config.runtime.seed);
        }
        let validation = InMemoryDataLoader::new(validation, shape, batch_size, device.clone())?;
        let test = InMemoryDataLoader::new(test, shape, batch_size, device.clone())?;

        Ok(Self {
            train: Box::new(train),
            validation: Box::new(validation),
            test: Box::new(test),
        })
    }
}
