use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{
    rnn::{lstm, LSTMConfig, LSTMState, RNN},
    Module, VarBuilder,
};
use model::{CellKind, ForecastBatch, ForwardMode, Seq2Seq, Seq2SeqConfig, DECODER_STEPS, HORIZON};

const BATCH: usize = 4;
const ENC_LEN: usize = 5;

fn build_config(cell: CellKind, attention: bool, bidirectional: bool) -> Seq2SeqConfig {
    Seq2SeqConfig {
        enc_dim: 6,
        dec_dim: 4,
        input_dim: 3,
        k: 2,
        enc_len: ENC_LEN,
        embedding_dim: 2,
        n_sites: 3,
        attention,
        cell,
        bidirectional,
        dropout: 0.5,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

fn decoder_values(target_offset: f32) -> Vec<f32> {
    let mut values = Vec::with_capacity(BATCH * DECODER_STEPS * 3);
    for b in 0..BATCH {
        for row in 0..DECODER_STEPS {
            for channel in 0..3 {
                let base = ((b * 31 + row * 7 + channel * 3) % 11) as f32 / 11.0;
                let shift = if row > 0 && channel == 0 { target_offset } else { 0.0 };
                values.push(base + shift);
            }
        }
    }
    values
}

fn build_batch(enc_len: usize, decoder: Vec<f32>) -> Result<ForecastBatch> {
    let device = Device::Cpu;
    let encoder: Vec<f32> = (0..BATCH * enc_len * 4)
        .map(|i| ((i * 13) % 17) as f32 / 17.0 - 0.5)
        .collect();
    Ok(ForecastBatch {
        ids: Tensor::new(&[0u32, 1, 2, 1], &device)?,
        encoder_input: Tensor::from_vec(encoder, (BATCH, enc_len, 4), &device)?,
        decoder_input: Tensor::from_vec(decoder, (BATCH, DECODER_STEPS, 3), &device)?,
    })
}

#[test]
fn forward_produces_horizon_for_every_variant() -> Result<()> {
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;
    for cell in [CellKind::Gru, CellKind::Lstm] {
        for attention in [false, true] {
            for bidirectional in [false, true] {
                let model = Seq2Seq::new(build_config(cell, attention, bidirectional))?;
                let predictions = model.forward(&batch, ForwardMode::Training)?;
                assert_eq!(predictions.dims(), &[BATCH, HORIZON]);
                assert_eq!(predictions.dtype(), DType::F32);
            }
        }
    }
    Ok(())
}

#[test]
fn bidirectional_encoder_concatenates_directions() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Lstm, false, true))?;
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;

    let encoded = model.encode(&batch, ForwardMode::Inference)?;

    assert_eq!(encoded.outputs.dims(), &[BATCH, ENC_LEN, 12]);
    assert_eq!(encoded.hidden.dims(), &[BATCH, 4]);
    let hidden = encoded.hidden.flatten_all()?.to_vec1::<f32>()?;
    assert!(hidden.iter().all(|v| (-1.0..=1.0).contains(v)));
    Ok(())
}

#[test]
fn inference_is_deterministic() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Gru, true, false))?;
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;

    let first = model.forward(&batch, ForwardMode::Inference)?.to_vec2::<f32>()?;
    let second = model.forward(&batch, ForwardMode::Inference)?.to_vec2::<f32>()?;

    assert_eq!(first, second);
    Ok(())
}

#[test]
fn decoder_never_reads_future_targets() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Gru, false, false))?;
    let observed = build_batch(ENC_LEN, decoder_values(0.0))?;
    let perturbed = build_batch(ENC_LEN, decoder_values(100.0))?;

    let a = model.forward(&observed, ForwardMode::Inference)?.to_vec2::<f32>()?;
    let b = model.forward(&perturbed, ForwardMode::Inference)?.to_vec2::<f32>()?;

    assert_eq!(a, b);
    Ok(())
}

#[test]
fn missing_values_do_not_poison_predictions() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Lstm, true, true))?;
    let mut decoder = decoder_values(0.0);
    for (idx, value) in decoder.iter_mut().enumerate() {
        if idx % 3 == 0 {
            *value = f32::NAN;
        }
    }
    let batch = build_batch(ENC_LEN, decoder)?;

    let predictions = model.forward(&batch, ForwardMode::Inference)?;

    let values = predictions.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn attention_requires_configured_encoder_length() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Gru, true, false))?;
    let batch = build_batch(ENC_LEN + 1, decoder_values(0.0))?;

    assert!(model.forward(&batch, ForwardMode::Inference).is_err());

    let without_attention = Seq2Seq::new(build_config(CellKind::Gru, false, false))?;
    assert!(without_attention
        .forward(&batch, ForwardMode::Inference)
        .is_ok());
    Ok(())
}

#[test]
fn monte_carlo_without_dropout_collapses_to_inference() -> Result<()> {
    let mut config = build_config(CellKind::Gru, true, true);
    config.dropout = 0.0;
    let model = Seq2Seq::new(config)?;
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;

    let mc = model.monte_carlo(&batch, 3)?;
    let deterministic = model.forward(&batch, ForwardMode::Inference)?;

    assert_eq!(mc.samples.dims(), &[3, BATCH, HORIZON]);
    let spread = mc.std.flatten_all()?.to_vec1::<f32>()?;
    assert!(spread.iter().all(|v| v.abs() < 1e-6));
    let gap = (&mc.mean - &deterministic)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(gap < 1e-5);
    Ok(())
}

#[test]
fn monte_carlo_dropout_produces_spread() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Lstm, false, false))?;
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;

    let mc = model.monte_carlo(&batch, 10)?;

    assert_eq!(mc.mean.dims(), &[BATCH, HORIZON]);
    assert_eq!(mc.std.dims(), &[BATCH, HORIZON]);
    let total_spread = mc.std.sum_all()?.to_scalar::<f32>()?;
    assert!(total_spread > 0.0);
    assert!(model.monte_carlo(&batch, 0).is_err());
    Ok(())
}

#[test]
fn gradients_reach_every_parameter() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Lstm, true, true))?;
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;

    let predictions = model.forward(&batch, ForwardMode::Training)?;
    let loss = predictions.sqr()?.sum_all()?;
    let grads = loss.backward()?;

    let parameters = model.parameters()?;
    assert!(parameters
        .iter()
        .any(|(name, _)| name.starts_with("decoder.attn_combined")));
    assert!(parameters
        .iter()
        .any(|(name, _)| name.starts_with("encoder.rnn_backward")));
    for (name, var) in parameters {
        assert!(
            grads.get(var.as_tensor()).is_some(),
            "missing gradient for {name}"
        );
    }
    Ok(())
}

#[test]
fn embedding_can_be_disabled() -> Result<()> {
    let mut config = build_config(CellKind::Gru, false, false);
    config.embedding_dim = 0;
    let model = Seq2Seq::new(config)?;
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;

    let predictions = model.forward(&batch, ForwardMode::Inference)?;

    assert_eq!(predictions.dims(), &[BATCH, HORIZON]);
    assert!(model
        .parameters()?
        .iter()
        .all(|(name, _)| !name.starts_with("embedding")));
    Ok(())
}

/// Step-by-step unroll of a bidirectional LSTM encoder and an attention
/// decoder built from the model's own weights, with dropout off.
fn unrolled_reference(model: &Seq2Seq, batch: &ForecastBatch) -> Result<Tensor> {
    let config = model.config();
    let vb = VarBuilder::from_tensors(model.state_dict()?, DType::F32, &Device::Cpu);
    let feature_dim = config.encoder_feature_dim();

    let embedding = candle_nn::embedding(config.n_sites, config.embedding_dim, vb.pp("embedding"))?;
    let site = embedding.forward(&batch.ids)?;

    let forward_cell = lstm(feature_dim, config.enc_dim, LSTMConfig::default(), vb.pp("encoder.rnn_forward"))?;
    let backward_cell = lstm(feature_dim, config.enc_dim, LSTMConfig::default(), vb.pp("encoder.rnn_backward"))?;
    let encoder_fc = candle_nn::linear(2 * config.enc_dim, config.dec_dim, vb.pp("encoder.fc"))?;

    let decoder_cell = lstm(
        config.decoder_feature_dim(),
        config.dec_dim,
        LSTMConfig::default(),
        vb.pp("decoder.rnn"),
    )?;
    let decoder_fc = candle_nn::linear(config.dec_dim, 1, vb.pp("decoder.fc"))?;
    let attn = candle_nn::linear(
        config.decoder_feature_dim() + config.dec_dim,
        config.enc_len,
        vb.pp("decoder.attn"),
    )?;
    let attn_combined = candle_nn::linear(
        2 * config.enc_dim + config.decoder_feature_dim(),
        config.decoder_feature_dim(),
        vb.pp("decoder.attn_combined"),
    )?;

    let (batch_size, enc_len, _) = batch.encoder_input.dims3()?;
    let step_input = |t: usize| -> Result<Tensor> {
        Ok(Tensor::cat(&[&batch.encoder_input.i((.., t, ..))?, &site], 1)?)
    };

    let mut forward_states = Vec::with_capacity(enc_len);
    let mut state = forward_cell.zero_state(batch_size)?;
    for t in 0..enc_len {
        state = forward_cell.step(&step_input(t)?, &state)?;
        forward_states.push(state.h.clone());
    }
    let mut backward_states = vec![None; enc_len];
    let mut state = backward_cell.zero_state(batch_size)?;
    for t in (0..enc_len).rev() {
        state = backward_cell.step(&step_input(t)?, &state)?;
        backward_states[t] = Some(state.h.clone());
    }
    let backward_states: Vec<Tensor> = backward_states.into_iter().flatten().collect();

    let per_step: Vec<Tensor> = forward_states
        .iter()
        .zip(backward_states.iter())
        .map(|(f, b)| Tensor::cat(&[f, b], 1))
        .collect::<candle_core::Result<_>>()?;
    let encoder_outputs = Tensor::stack(&per_step, 1)?;
    let last = Tensor::cat(&[&forward_states[enc_len - 1], &backward_states[0]], 1)?;
    let hidden = encoder_fc.forward(&last)?.tanh()?;

    let mut input = batch.decoder_input.i((.., 0, ..))?;
    let mut state = LSTMState {
        h: hidden.clone(),
        c: hidden.zeros_like()?,
    };
    let mut predictions = Vec::with_capacity(HORIZON);
    for step in 1..DECODER_STEPS {
        let x = Tensor::cat(&[&input, &site], 1)?;
        let scores = attn.forward(&Tensor::cat(&[&x, &state.h], 1)?)?;
        let exp = scores.broadcast_sub(&scores.max_keepdim(1)?)?.exp()?;
        let weights = exp.broadcast_div(&exp.sum_keepdim(1)?)?;
        let context = weights
            .unsqueeze(2)?
            .broadcast_mul(&encoder_outputs)?
            .sum(1)?;
        let x = attn_combined.forward(&Tensor::cat(&[&context, &x], 1)?)?;

        state = decoder_cell.step(&x, &state)?;
        let prediction = decoder_fc.forward(&state.h)?;
        input = Tensor::cat(&[&batch.decoder_input.i((.., step, 1..))?, &prediction], 1)?;
        predictions.push(prediction);
    }
    Ok(Tensor::cat(&predictions, 1)?)
}

#[test]
fn forward_matches_step_by_step_unroll() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Lstm, true, true))?;
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;

    let predictions = model.forward(&batch, ForwardMode::Inference)?;
    let expected = unrolled_reference(&model, &batch)?;

    assert_eq!(predictions.dims(), expected.dims());
    let gap = (&predictions - &expected)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(gap < 1e-5, "max gap {gap}");
    Ok(())
}

#[test]
fn monte_carlo_spread_is_population_std() -> Result<()> {
    let model = Seq2Seq::new(build_config(CellKind::Gru, false, false))?;
    let batch = build_batch(ENC_LEN, decoder_values(0.0))?;

    let mc = model.monte_carlo(&batch, 2)?;

    let draws = mc.samples.to_vec3::<f32>()?;
    let std = mc.std.to_vec2::<f32>()?;
    let mean = mc.mean.to_vec2::<f32>()?;
    for b in 0..BATCH {
        for h in 0..HORIZON {
            let (a, c) = (draws[0][b][h], draws[1][b][h]);
            assert!((mean[b][h] - (a + c) / 2.0).abs() < 1e-5);
            assert!((std[b][h] - (a - c).abs() / 2.0).abs() < 1e-5);
        }
    }
    Ok(())
}
