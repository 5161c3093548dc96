//! Model components for Tacotron2 + WaveGlow synthesis.
//!
//! ## Components
//!
//! - [`tacotron2`]: acoustic model (symbol ids → mel spectrogram)
//! - [`waveglow`]: flow-based vocoder (mel spectrogram → waveform)
//! - [`denoiser`]: spectral bias subtraction for vocoder output
//! - [`layers`]: shared building blocks (LSTM cells, batch norm, weight norm)
//!
//! The synthesizer only talks to the models through [`AcousticModel`] and
//! [`Vocoder`], so either side can be swapped for a test double.

pub mod denoiser;
pub mod layers;
pub mod tacotron2;
pub mod waveglow;

use candle_core::{DType, Device, Tensor};

/// Acoustic model outputs for a batch of symbol sequences.
#[derive(Debug, Clone)]
pub struct MelOutput {
    /// Decoder mel frames before the post-net: `[B, n_mel, frames]`.
    pub mel: Tensor,
    /// Post-net refined mel: `[B, n_mel, frames]`.
    pub mel_postnet: Tensor,
    /// Stop-token logits: `[B, steps]`.
    pub gates: Tensor,
    /// Attention weights: `[B, steps, input_len]`.
    pub alignments: Tensor,
}

/// Text-to-mel model.
pub trait AcousticModel {
    fn n_mel_channels(&self) -> usize;

    fn device(&self) -> &Device;

    /// Run inference on `[B, T]` symbol ids (`u32`).
    fn infer(&self, sequence: &Tensor) -> crate::Result<MelOutput>;
}

/// Mel-to-waveform model.
pub trait Vocoder {
    fn n_mel_channels(&self) -> usize;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    /// Generate `[B, samples]` audio from a `[B, n_mel, frames]` mel.
    ///
    /// `sigma` scales the latent noise; `0.0` gives the noise-free output.
    fn infer(&self, mel: &Tensor, sigma: f64) -> crate::Result<Tensor>;
}
