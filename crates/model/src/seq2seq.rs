use std::collections::HashMap;

use candle_core::{Error, IndexOp, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::{
    config::{Seq2SeqConfig, DECODER_STEPS},
    decoder::Decoder,
    embedding::SiteEmbedding,
    encoder::{Encoder, EncoderOutput},
};

/// One collated batch of pre-windowed samples, batch-first.
#[derive(Debug, Clone)]
pub struct ForecastBatch {
    /// Site ids shaped `[batch]` (`u32`).
    pub ids: Tensor,
    /// Observed window shaped `[batch, enc_len, input_dim + k - 1]`.
    pub encoder_input: Tensor,
    /// Seed row plus horizon rows shaped `[batch, DECODER_STEPS, input_dim]`.
    pub decoder_input: Tensor,
}

impl ForecastBatch {
    pub fn batch_size(&self) -> Result<usize> {
        self.ids.dims1()
    }

    /// Ground truth for the horizon, `decoder_input[:, 1.., 0]` → `[batch, HORIZON]`.
    pub fn targets(&self) -> Result<Tensor> {
        self.decoder_input
            .i((.., 1..DECODER_STEPS, 0))?
            .contiguous()
    }
}

/// Controls dropout and graph retention for a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Dropout active, result stays attached for backpropagation.
    Training,
    /// Dropout disabled.
    Inference,
    /// Dropout active, result detached from the graph.
    MonteCarlo,
}

impl ForwardMode {
    pub fn dropout_active(self) -> bool {
        matches!(self, ForwardMode::Training | ForwardMode::MonteCarlo)
    }
}

/// Aggregate of repeated stochastic forward passes.
#[derive(Debug, Clone)]
pub struct McPrediction {
    /// Every draw, `[samples, batch, HORIZON]`.
    pub samples: Tensor,
    pub mean: Tensor,
    /// Population standard deviation across draws.
    pub std: Tensor,
}

/// Recurrent encoder-decoder forecaster.
pub struct Seq2Seq {
    config: Seq2SeqConfig,
    varmap: VarMap,
    embedding: Option<SiteEmbedding>,
    encoder: Encoder,
    decoder: Decoder,
}

impl Seq2Seq {
    /// Builds the model with freshly initialised parameters owned by the model.
    pub fn new(config: Seq2SeqConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let embedding = if config.uses_embedding() {
            Some(SiteEmbedding::new(
                config.n_sites,
                config.embedding_dim,
                vb.pp("embedding"),
            )?)
        } else {
            None
        };
        let encoder = Encoder::new(&config, vb.pp("encoder"))?;
        let decoder = Decoder::new(&config, vb.pp("decoder"))?;

        Ok(Self {
            config,
            varmap,
            embedding,
            encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &Seq2SeqConfig {
        &self.config
    }

    /// Encodes the observed window, exposed for inspection and tests.
    pub fn encode(&self, batch: &ForecastBatch, mode: ForwardMode) -> Result<EncoderOutput> {
        let site = self.site_vectors(batch)?;
        self.encoder
            .forward(&batch.encoder_input, site.as_ref(), mode.dropout_active())
    }

    /// Predicts the horizon for `batch`, returning `[batch, HORIZON]`.
    pub fn forward(&self, batch: &ForecastBatch, mode: ForwardMode) -> Result<Tensor> {
        let batch_size = batch.batch_size()?;
        let encoder_batch = batch.encoder_input.dim(0)?;
        let decoder_batch = batch.decoder_input.dim(0)?;
        if encoder_batch != batch_size || decoder_batch != batch_size {
            return Err(Error::Msg(format!(
                "batch size mismatch: ids={} encoder={} decoder={}",
                batch_size, encoder_batch, decoder_batch
            )));
        }

        let dropout_active = mode.dropout_active();
        let site = self.site_vectors(batch)?;
        let encoded = self
            .encoder
            .forward(&batch.encoder_input, site.as_ref(), dropout_active)?;
        let predictions = self.decoder.forward(
            &batch.decoder_input,
            &encoded.outputs,
            &encoded.hidden,
            site.as_ref(),
            dropout_active,
        )?;

        match mode {
            ForwardMode::MonteCarlo => Ok(predictions.detach()),
            ForwardMode::Training | ForwardMode::Inference => Ok(predictions),
        }
    }

    /// Runs `samples` dropout-active passes and aggregates them per element.
    pub fn monte_carlo(&self, batch: &ForecastBatch, samples: usize) -> Result<McPrediction> {
        if samples == 0 {
            return Err(Error::Msg(
                "monte carlo estimation needs at least one sample".into(),
            ));
        }
        let mut draws = Vec::with_capacity(samples);
        for _ in 0..samples {
            draws.push(self.forward(batch, ForwardMode::MonteCarlo)?);
        }

        let samples = Tensor::stack(&draws, 0)?;
        let mean = samples.mean(0)?;
        let std = samples
            .broadcast_sub(&mean.unsqueeze(0)?)?
            .sqr()?
            .mean(0)?
            .sqrt()?;

        Ok(McPrediction { samples, mean, std })
    }

    /// Trainable parameters sorted by name.
    pub fn parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Msg("parameter store lock poisoned".into()))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn parameter_count(&self) -> Result<usize> {
        Ok(self
            .parameters()?
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum())
    }

    /// Snapshot of every parameter tensor keyed by name.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self
            .parameters()?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect())
    }

    fn site_vectors(&self, batch: &ForecastBatch) -> Result<Option<Tensor>> {
        match &self.embedding {
            Some(embedding) => embedding.forward(&batch.ids).map(Some),
            None => Ok(None),
        }
    }
}
