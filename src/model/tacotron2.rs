//! Tacotron2 acoustic model, inference path.
//!
//! ```text
//! ids [B, T] ─→ Embedding ─→ N × (Conv + BatchNorm + ReLU) ─→ BiLSTM ─→ memory [B, T, E]
//!
//! memory ─→ autoregressive decoder, one step per n_frames_per_step frames:
//!   prev frame ─→ Prenet (2 × Linear + ReLU + dropout)
//!             ─→ attention LSTM cell ─→ location-sensitive attention ─→ context
//!             ─→ decoder LSTM cell ─→ linear projection (mel) + gate (stop token)
//!
//! mel [B, n_mel, frames] ─→ Postnet (5 × Conv + BatchNorm, tanh but last) ─→ + mel
//! ```
//!
//! Prenet dropout stays on at inference. Its masks come from a ChaCha RNG
//! seeded with `hparams.seed` at the start of every call, so the same input
//! always decodes to the same mel.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Conv1d, Embedding, Linear, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::layers::{self, BiLstm, ConvBatchNorm, LstmCell, LstmState};
use super::{AcousticModel, MelOutput};
use crate::Result;
use crate::checkpoint::Parameterized;
use crate::config::Hyperparameters;

/// Prenet dropout probability, applied at inference as well.
const PRENET_DROPOUT: f32 = 0.5;

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

struct Encoder {
    convolutions: Vec<ConvBatchNorm>,
    lstm: BiLstm,
}

impl Encoder {
    fn load(vb: VarBuilder, hp: &Hyperparameters) -> Result<Self> {
        let dim = hp.encoder_embedding_dim;
        let convolutions = (0..hp.encoder_n_convolutions)
            .map(|i| {
                ConvBatchNorm::load(
                    vb.pp(format!("convolutions.{i}")),
                    dim,
                    dim,
                    hp.encoder_kernel_size,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let lstm = BiLstm::load(vb.pp("lstm"), dim, dim / 2)?;
        Ok(Self { convolutions, lstm })
    }

    /// `[B, E, T]` → `[B, T, E]`
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for conv in &self.convolutions {
            x = conv.forward(&x)?.relu()?;
        }
        let x = x.transpose(1, 2)?.contiguous()?;
        self.lstm.forward(&x)
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

struct Prenet {
    layers: Vec<Linear>,
}

impl Prenet {
    fn load(vb: VarBuilder, in_dim: usize, sizes: &[usize]) -> Result<Self> {
        let mut layers = Vec::with_capacity(sizes.len());
        let mut prev = in_dim;
        for (i, &size) in sizes.iter().enumerate() {
            layers.push(layers::linear_norm(
                prev,
                size,
                false,
                vb.pp(format!("layers.{i}")),
            )?);
            prev = size;
        }
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor, rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?.relu()?;
            let mask =
                layers::dropout_mask(rng, PRENET_DROPOUT, x.dims2()?, x.dtype(), x.device())?;
            x = (x * mask)?;
        }
        Ok(x)
    }
}

struct LocationLayer {
    location_conv: Conv1d,
    location_dense: Linear,
}

impl LocationLayer {
    fn load(
        vb: VarBuilder,
        n_filters: usize,
        kernel_size: usize,
        attention_dim: usize,
    ) -> Result<Self> {
        Ok(Self {
            location_conv: layers::conv_norm(
                2,
                n_filters,
                kernel_size,
                false,
                vb.pp("location_conv"),
            )?,
            location_dense: layers::linear_norm(
                n_filters,
                attention_dim,
                false,
                vb.pp("location_dense"),
            )?,
        })
    }

    /// `[B, 2, T]` → `[B, T, A]`
    fn forward(&self, attention_weights_cat: &Tensor) -> Result<Tensor> {
        let x = self.location_conv.forward(attention_weights_cat)?;
        let x = x.transpose(1, 2)?.contiguous()?;
        Ok(self.location_dense.forward(&x)?)
    }
}

struct Attention {
    query_layer: Linear,
    memory_layer: Linear,
    v: Linear,
    location_layer: LocationLayer,
}

impl Attention {
    fn load(vb: VarBuilder, hp: &Hyperparameters) -> Result<Self> {
        Ok(Self {
            query_layer: layers::linear_norm(
                hp.attention_rnn_dim,
                hp.attention_dim,
                false,
                vb.pp("query_layer"),
            )?,
            memory_layer: layers::linear_norm(
                hp.encoder_embedding_dim,
                hp.attention_dim,
                false,
                vb.pp("memory_layer"),
            )?,
            v: layers::linear_norm(hp.attention_dim, 1, false, vb.pp("v"))?,
            location_layer: LocationLayer::load(
                vb.pp("location_layer"),
                hp.attention_location_n_filters,
                hp.attention_location_kernel_size,
                hp.attention_dim,
            )?,
        })
    }

    /// Returns `(context [B, E], weights [B, T])`.
    fn forward(
        &self,
        query: &Tensor,
        memory: &Tensor,
        processed_memory: &Tensor,
        attention_weights_cat: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let processed_query = self.query_layer.forward(&query.unsqueeze(1)?)?;
        let processed_location = self.location_layer.forward(attention_weights_cat)?;
        let energies = processed_location
            .broadcast_add(&processed_query)?
            .add(processed_memory)?
            .tanh()?;
        let energies = self.v.forward(&energies)?.squeeze(2)?;
        let weights = candle_nn::ops::softmax(&energies, D::Minus1)?;
        let context = weights.unsqueeze(1)?.matmul(memory)?.squeeze(1)?;
        Ok((context, weights))
    }
}

/// Mutable per-utterance decoder state.
struct DecoderState {
    attention: LstmState,
    decoder: LstmState,
    attention_weights: Tensor,
    attention_weights_cum: Tensor,
    attention_context: Tensor,
}

struct Decoder {
    prenet: Prenet,
    attention_rnn: LstmCell,
    attention_layer: Attention,
    decoder_rnn: LstmCell,
    linear_projection: Linear,
    gate_layer: Linear,
    frame_dim: usize,
    max_decoder_steps: usize,
    gate_threshold: f32,
}

impl Decoder {
    fn load(vb: VarBuilder, hp: &Hyperparameters) -> Result<Self> {
        let frame_dim = hp.n_mel_channels * hp.n_frames_per_step;
        let enc = hp.encoder_embedding_dim;
        Ok(Self {
            prenet: Prenet::load(vb.pp("prenet"), frame_dim, &[hp.prenet_dim, hp.prenet_dim])?,
            attention_rnn: LstmCell::load(
                vb.pp("attention_rnn"),
                hp.prenet_dim + enc,
                hp.attention_rnn_dim,
            )?,
            attention_layer: Attention::load(vb.pp("attention_layer"), hp)?,
            decoder_rnn: LstmCell::load(
                vb.pp("decoder_rnn"),
                hp.attention_rnn_dim + enc,
                hp.decoder_rnn_dim,
            )?,
            linear_projection: layers::linear_norm(
                hp.decoder_rnn_dim + enc,
                frame_dim,
                true,
                vb.pp("linear_projection"),
            )?,
            gate_layer: layers::linear_norm(
                hp.decoder_rnn_dim + enc,
                1,
                true,
                vb.pp("gate_layer"),
            )?,
            frame_dim,
            max_decoder_steps: hp.max_decoder_steps,
            gate_threshold: hp.gate_threshold,
        })
    }

    fn initial_state(&self, memory: &Tensor) -> Result<DecoderState> {
        let (batch, time, enc) = memory.dims3()?;
        let (dtype, device) = (memory.dtype(), memory.device());
        let weights = Tensor::zeros((batch, time), dtype, device)?;
        Ok(DecoderState {
            attention: self.attention_rnn.zero_state(batch, dtype, device)?,
            decoder: self.decoder_rnn.zero_state(batch, dtype, device)?,
            attention_weights: weights.clone(),
            attention_weights_cum: weights,
            attention_context: Tensor::zeros((batch, enc), dtype, device)?,
        })
    }

    /// One decoder step. Returns `(frame [B, frame_dim], gate [B, 1], weights [B, T])`.
    fn decode(
        &self,
        input: &Tensor,
        state: &mut DecoderState,
        memory: &Tensor,
        processed_memory: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let cell_input = Tensor::cat(&[input, &state.attention_context], 1)?;
        state.attention = self.attention_rnn.step(&cell_input, &state.attention)?;

        let weights_cat = Tensor::stack(
            &[&state.attention_weights, &state.attention_weights_cum],
            1,
        )?;
        let (context, weights) = self.attention_layer.forward(
            &state.attention.h,
            memory,
            processed_memory,
            &weights_cat,
        )?;
        state.attention_weights_cum = (&state.attention_weights_cum + &weights)?;
        state.attention_weights = weights.clone();
        state.attention_context = context;

        let decoder_input = Tensor::cat(&[&state.attention.h, &state.attention_context], 1)?;
        state.decoder = self.decoder_rnn.step(&decoder_input, &state.decoder)?;

        let hidden_context = Tensor::cat(&[&state.decoder.h, &state.attention_context], 1)?;
        let frame = self.linear_projection.forward(&hidden_context)?;
        let gate = self.gate_layer.forward(&hidden_context)?;
        Ok((frame, gate, weights))
    }

    /// Decode until every sequence in the batch emits a stop token.
    ///
    /// Returns `(frames [B, steps, frame_dim], gates [B, steps], alignments [B, steps, T])`.
    fn infer(&self, memory: &Tensor, rng: &mut ChaCha8Rng) -> Result<(Tensor, Tensor, Tensor)> {
        let batch = memory.dim(0)?;
        let processed_memory = self.attention_layer.memory_layer.forward(memory)?;
        let mut state = self.initial_state(memory)?;
        let mut input = Tensor::zeros((batch, self.frame_dim), memory.dtype(), memory.device())?;

        let mut frames = Vec::new();
        let mut gates = Vec::new();
        let mut alignments = Vec::new();
        loop {
            let prenet_out = self.prenet.forward(&input, rng)?;
            let (frame, gate, weights) =
                self.decode(&prenet_out, &mut state, memory, &processed_memory)?;

            let stop_probs: Vec<f32> = candle_nn::ops::sigmoid(&gate)?
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1()?;
            frames.push(frame.clone());
            gates.push(gate);
            alignments.push(weights);

            if stop_probs.iter().all(|&p| p > self.gate_threshold) {
                break;
            }
            if frames.len() == self.max_decoder_steps {
                tracing::warn!(
                    "Reached max decoder steps ({}), output truncated",
                    self.max_decoder_steps
                );
                break;
            }
            input = frame;
        }
        tracing::debug!("Decoder stopped after {} steps", frames.len());

        Ok((
            Tensor::stack(&frames, 1)?,
            Tensor::cat(&gates, 1)?,
            Tensor::stack(&alignments, 1)?,
        ))
    }
}

// ---------------------------------------------------------------------------
// Postnet
// ---------------------------------------------------------------------------

struct Postnet {
    convolutions: Vec<ConvBatchNorm>,
}

impl Postnet {
    fn load(vb: VarBuilder, hp: &Hyperparameters) -> Result<Self> {
        let n = hp.postnet_n_convolutions;
        let convolutions = (0..n)
            .map(|i| {
                let in_dim = if i == 0 { hp.n_mel_channels } else { hp.postnet_embedding_dim };
                let out_dim = if i + 1 == n { hp.n_mel_channels } else { hp.postnet_embedding_dim };
                ConvBatchNorm::load(
                    vb.pp(format!("convolutions.{i}")),
                    in_dim,
                    out_dim,
                    hp.postnet_kernel_size,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { convolutions })
    }

    fn forward(&self, mel: &Tensor) -> Result<Tensor> {
        let last = self.convolutions.len() - 1;
        let mut x = mel.clone();
        for (i, conv) in self.convolutions.iter().enumerate() {
            x = conv.forward(&x)?;
            if i < last {
                x = x.tanh()?;
            }
        }
        Ok(x)
    }
}

// ---------------------------------------------------------------------------
// Tacotron2
// ---------------------------------------------------------------------------

/// Tacotron2 with parameters owned by its own [`VarMap`].
pub struct Tacotron2 {
    varmap: VarMap,
    embedding: Embedding,
    encoder: Encoder,
    decoder: Decoder,
    postnet: Postnet,
    n_mel_channels: usize,
    n_frames_per_step: usize,
    seed: u64,
    device: Device,
}

impl Tacotron2 {
    /// Build a randomly initialised model ready to receive a checkpoint.
    pub fn new(hp: &Hyperparameters, dtype: DType, device: &Device) -> Result<Self> {
        hp.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let embedding =
            candle_nn::embedding(hp.n_symbols, hp.symbols_embedding_dim, vb.pp("embedding"))?;
        let encoder = Encoder::load(vb.pp("encoder"), hp)?;
        let decoder = Decoder::load(vb.pp("decoder"), hp)?;
        let postnet = Postnet::load(vb.pp("postnet"), hp)?;

        Ok(Self {
            varmap,
            embedding,
            encoder,
            decoder,
            postnet,
            n_mel_channels: hp.n_mel_channels,
            n_frames_per_step: hp.n_frames_per_step,
            seed: hp.seed,
            device: device.clone(),
        })
    }

    /// Synthesize mel spectrograms for `[B, T]` symbol ids.
    pub fn inference(&self, sequence: &Tensor) -> Result<MelOutput> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let sequence = sequence.to_device(&self.device)?;

        let embedded = self.embedding.forward(&sequence)?.transpose(1, 2)?.contiguous()?;
        let memory = self.encoder.forward(&embedded)?;
        let (frames, gates, alignments) = self.decoder.infer(&memory, &mut rng)?;

        let (batch, steps, _) = frames.dims3()?;
        let mel = frames
            .reshape((batch, steps * self.n_frames_per_step, self.n_mel_channels))?
            .transpose(1, 2)?
            .contiguous()?;
        let mel_postnet = (&mel + self.postnet.forward(&mel)?)?;

        tracing::debug!("Tacotron2 produced {} mel frames", steps * self.n_frames_per_step);
        Ok(MelOutput {
            mel,
            mel_postnet,
            gates,
            alignments,
        })
    }
}

impl Parameterized for Tacotron2 {
    fn parameters(&self) -> &VarMap {
        &self.varmap
    }
}

impl AcousticModel for Tacotron2 {
    fn n_mel_channels(&self) -> usize {
        self.n_mel_channels
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn infer(&self, sequence: &Tensor) -> Result<MelOutput> {
        self.inference(sequence)
    }
}

/// Small configuration for CPU tests.
#[cfg(test)]
pub(crate) fn tiny_hparams() -> Hyperparameters {
    Hyperparameters {
        n_mel_channels: 8,
        symbols_embedding_dim: 16,
        encoder_embedding_dim: 16,
        encoder_kernel_size: 3,
        encoder_n_convolutions: 2,
        decoder_rnn_dim: 16,
        prenet_dim: 8,
        max_decoder_steps: 4,
        attention_rnn_dim: 16,
        attention_dim: 8,
        attention_location_n_filters: 4,
        attention_location_kernel_size: 3,
        postnet_embedding_dim: 8,
        postnet_kernel_size: 3,
        postnet_n_convolutions: 3,
        ..Default::default()
    }
}
