//! Spectral bias removal for vocoder output.
//!
//! The vocoder's response to a silent (or random) mel at `sigma = 0` is a
//! stationary hiss. Its magnitude spectrum is measured once and subtracted
//! from every frame of synthesized audio.

use candle_core::{DType, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::Vocoder;
use super::layers;
use crate::audio::{Stft, StftConfig};
use crate::Result;

/// Mel frames used to measure the vocoder bias.
pub const BIAS_FRAMES: usize = 88;

/// Mel input used to measure the vocoder bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoiserMode {
    #[default]
    Zeros,
    Normal,
}

#[derive(Debug)]
pub struct Denoiser {
    stft: Stft,
    bias_spec: Vec<f32>,
}

impl Denoiser {
    /// Measure the bias spectrum of `vocoder`.
    ///
    /// `seed` only matters for [`DenoiserMode::Normal`].
    pub fn new<V: Vocoder + ?Sized>(
        vocoder: &V,
        config: StftConfig,
        mode: DenoiserMode,
        seed: u64,
    ) -> Result<Self> {
        let shape = [1, vocoder.n_mel_channels(), BIAS_FRAMES];
        let mel = match mode {
            DenoiserMode::Zeros => Tensor::zeros(&shape[..], vocoder.dtype(), vocoder.device())?,
            DenoiserMode::Normal => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                layers::gaussian_noise(&mut rng, &shape, vocoder.dtype(), vocoder.device())?
            }
        };

        let bias_audio: Vec<f32> = vocoder
            .infer(&mel, 0.0)?
            .get(0)?
            .to_dtype(DType::F32)?
            .to_vec1()?;
        let stft = Stft::new(config)?;
        let bias_spec = stft
            .transform(&bias_audio)
            .magnitude
            .into_iter()
            .next()
            .unwrap_or_else(|| vec![0.0; stft.num_bins()]);

        tracing::debug!(?mode, samples = bias_audio.len(), "Measured vocoder bias");
        Ok(Self::from_bias(stft, bias_spec))
    }

    /// Denoiser with a known bias spectrum of `stft.num_bins()` magnitudes.
    pub fn from_bias(stft: Stft, bias_spec: Vec<f32>) -> Self {
        Self { stft, bias_spec }
    }

    pub fn bias_spec(&self) -> &[f32] {
        &self.bias_spec
    }

    /// Subtract `strength` times the bias from every frame's magnitude.
    ///
    /// Magnitudes are floored at zero and the original phase is kept. The
    /// output has the same length as `audio`.
    pub fn denoise(&self, audio: &[f32], strength: f32) -> Vec<f32> {
        let mut spectrum = self.stft.transform(audio);
        for frame in &mut spectrum.magnitude {
            for (m, &bias) in frame.iter_mut().zip(&self.bias_spec) {
                *m = (*m - bias * strength).max(0.0);
            }
        }
        self.stft.inverse(&spectrum, audio.len())
    }
}
