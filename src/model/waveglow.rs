//! WaveGlow vocoder, inference path.
//!
//! ```text
//! mel [B, n_mel, F] ─→ ConvTranspose1d(k=1024, s=256) ─→ trim 768 ─→ [B, n_mel, F·256]
//!   ─→ squeeze into groups ─→ cond [B, n_mel·n_group, F·256/n_group]
//!
//! z ~ N(0, σ²) [B, n_remaining, F·256/n_group]
//! for k in (0..n_flows).rev():
//!     affine coupling: WN_k(z_a, cond) → (b, s);  z_b = (z_b - b) · exp(-s)
//!     inverse 1×1 conv
//!     every n_early_every flows: prepend fresh σ·N(0,1) channels
//! z ─→ interleave groups ─→ audio [B, F·256]
//! ```
//!
//! Noise comes from a ChaCha RNG reseeded on every call.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;
use candle_nn::{Conv1d, ConvTranspose1d, ConvTranspose1dConfig, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::Vocoder;
use super::layers::{self, WeightNormConv1d};
use crate::checkpoint::Parameterized;
use crate::{Error, Result};

/// Upsampler kernel size.
pub const UPSAMPLE_KERNEL: usize = 1024;
/// Upsampler stride, one mel frame per `UPSAMPLE_STRIDE` samples.
pub const UPSAMPLE_STRIDE: usize = 256;

/// Seed used for latent noise unless overridden with [`WaveGlow::with_seed`].
pub const DEFAULT_NOISE_SEED: u64 = 1234;

/// Affine coupling network settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WnConfig {
    pub n_layers: usize,
    pub n_channels: usize,
    pub kernel_size: usize,
}

impl Default for WnConfig {
    fn default() -> Self {
        Self {
            n_layers: 8,
            n_channels: 256,
            kernel_size: 3,
        }
    }
}

/// `waveglow_config` section of the vocoder JSON file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveGlowConfig {
    pub n_mel_channels: usize,
    pub n_flows: usize,
    pub n_group: usize,
    pub n_early_every: usize,
    pub n_early_size: usize,
    #[serde(rename = "WN_config")]
    pub wn_config: WnConfig,
}

impl Default for WaveGlowConfig {
    fn default() -> Self {
        Self {
            n_mel_channels: 80,
            n_flows: 12,
            n_group: 8,
            n_early_every: 4,
            n_early_size: 2,
            wn_config: WnConfig::default(),
        }
    }
}

impl WaveGlowConfig {
    /// Whether flow `k` emits early outputs (and, at inference, re-injects noise).
    fn is_early_flow(&self, k: usize) -> bool {
        k > 0 && k % self.n_early_every == 0
    }

    /// Channels still carried by the flows after every early output.
    pub fn n_remaining_channels(&self) -> usize {
        let early = (0..self.n_flows).filter(|&k| self.is_early_flow(k)).count();
        self.n_group.saturating_sub(early * self.n_early_size)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(Error::Config(format!("waveglow_config: {reason}")));
        if self.n_mel_channels == 0 || self.n_flows == 0 {
            return fail("n_mel_channels and n_flows must be positive".into());
        }
        if self.n_group < 2 || self.n_group % 2 != 0 || UPSAMPLE_STRIDE % self.n_group != 0 {
            return fail(format!(
                "n_group must be even and divide {UPSAMPLE_STRIDE}, got {}",
                self.n_group
            ));
        }
        if self.n_early_every == 0 || self.n_early_size % 2 != 0 {
            return fail("n_early_every must be positive and n_early_size even".into());
        }
        let early = (0..self.n_flows).filter(|&k| self.is_early_flow(k)).count();
        if early * self.n_early_size + 2 > self.n_group {
            return fail(format!(
                "{early} early outputs of {} channels leave nothing of n_group {}",
                self.n_early_size, self.n_group
            ));
        }
        let wn = &self.wn_config;
        if wn.n_layers == 0 || wn.n_channels == 0 || wn.kernel_size % 2 == 0 {
            return fail(format!(
                "WN_config needs positive n_layers/n_channels and an odd kernel_size, got {wn:?}"
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WN coupling network
// ---------------------------------------------------------------------------

struct Wn {
    start: WeightNormConv1d,
    cond_layer: WeightNormConv1d,
    in_layers: Vec<WeightNormConv1d>,
    res_skip_layers: Vec<WeightNormConv1d>,
    end: Conv1d,
    n_channels: usize,
}

impl Wn {
    fn load(
        vb: VarBuilder,
        n_in_channels: usize,
        n_cond_channels: usize,
        cfg: &WnConfig,
    ) -> Result<Self> {
        let n_channels = cfg.n_channels;
        let start = WeightNormConv1d::load(vb.pp("start"), n_in_channels, n_channels, 1, 1)?;
        let cond_layer = WeightNormConv1d::load(
            vb.pp("cond_layer"),
            n_cond_channels,
            2 * n_channels * cfg.n_layers,
            1,
            1,
        )?;

        let mut in_layers = Vec::with_capacity(cfg.n_layers);
        let mut res_skip_layers = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            in_layers.push(WeightNormConv1d::load(
                vb.pp(format!("in_layers.{i}")),
                n_channels,
                2 * n_channels,
                cfg.kernel_size,
                1 << i,
            )?);
            let res_skip_channels = if i + 1 < cfg.n_layers {
                2 * n_channels
            } else {
                n_channels
            };
            res_skip_layers.push(WeightNormConv1d::load(
                vb.pp(format!("res_skip_layers.{i}")),
                n_channels,
                res_skip_channels,
                1,
                1,
            )?);
        }

        let end = candle_nn::conv1d(
            n_channels,
            2 * n_in_channels,
            1,
            Default::default(),
            vb.pp("end"),
        )?;

        Ok(Self {
            start,
            cond_layer,
            in_layers,
            res_skip_layers,
            end,
            n_channels,
        })
    }

    /// `audio [B, n_half, T]`, `spect [B, n_mel·n_group, T]` → `[B, 2·n_half, T]`.
    fn forward(&self, audio: &Tensor, spect: &Tensor) -> Result<Tensor> {
        let n = self.n_channels;
        let last = self.in_layers.len() - 1;
        let mut audio = self.start.forward(audio)?;
        let mut output = audio.zeros_like()?;
        let spect = self.cond_layer.forward(spect)?;

        let pairs = self.in_layers.iter().zip(&self.res_skip_layers);
        for (i, (in_layer, res_skip)) in pairs.enumerate() {
            let cond = spect.narrow(1, i * 2 * n, 2 * n)?;
            let in_act = (in_layer.forward(&audio)? + cond)?;
            let t_act = in_act.narrow(1, 0, n)?.tanh()?;
            let s_act = candle_nn::ops::sigmoid(&in_act.narrow(1, n, n)?)?;
            let acts = (t_act * s_act)?;

            let res_skip_acts = res_skip.forward(&acts)?;
            if i < last {
                audio = (audio + res_skip_acts.narrow(1, 0, n)?)?;
                output = (output + res_skip_acts.narrow(1, n, n)?)?;
            } else {
                output = (output + res_skip_acts)?;
            }
        }
        Ok(self.end.forward(&output)?)
    }
}

// ---------------------------------------------------------------------------
// Invertible 1x1 convolution
// ---------------------------------------------------------------------------

struct Invertible1x1Conv {
    weight: Tensor,
}

impl Invertible1x1Conv {
    fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        let weight = vb.get_with_hints((channels, channels, 1), "weight", DEFAULT_KAIMING_NORMAL)?;
        Ok(Self { weight })
    }

    /// Apply `W⁻¹` along the channel axis of `[B, C, T]`.
    fn reverse(&self, z: &Tensor) -> Result<Tensor> {
        let matrix = self
            .weight
            .squeeze(2)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F64)?
            .to_vec2::<f64>()?;
        let inverse = invert_matrix(matrix)?;
        let channels = inverse.len();
        let flat: Vec<f64> = inverse.into_iter().flatten().collect();
        let w_inverse = Tensor::from_vec(flat, (channels, channels, 1), &Device::Cpu)?
            .to_dtype(z.dtype())?
            .to_device(z.device())?;
        Ok(z.conv1d(&w_inverse, 0, 1, 1, 1)?)
    }
}

/// Gauss-Jordan inversion with partial pivoting.
fn invert_matrix(mut a: Vec<Vec<f64>>) -> candle_core::Result<Vec<Vec<f64>>> {
    let n = a.len();
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            candle_core::bail!("invertible 1x1 convolution weight is singular");
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let p = a[col][col];
        for j in 0..n {
            a[col][j] /= p;
            inv[col][j] /= p;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[row][j] -= factor * a[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    Ok(inv)
}

// ---------------------------------------------------------------------------
// WaveGlow
// ---------------------------------------------------------------------------

/// WaveGlow with parameters owned by its own [`VarMap`].
pub struct WaveGlow {
    varmap: VarMap,
    upsample: ConvTranspose1d,
    wn: Vec<Wn>,
    convinv: Vec<Invertible1x1Conv>,
    config: WaveGlowConfig,
    seed: u64,
    dtype: DType,
    device: Device,
}

impl WaveGlow {
    /// Build a randomly initialised model ready to receive a checkpoint.
    pub fn new(config: &WaveGlowConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let upsample = candle_nn::conv_transpose1d(
            config.n_mel_channels,
            config.n_mel_channels,
            UPSAMPLE_KERNEL,
            ConvTranspose1dConfig {
                stride: UPSAMPLE_STRIDE,
                ..Default::default()
            },
            vb.pp("upsample"),
        )?;

        let n_cond_channels = config.n_mel_channels * config.n_group;
        let mut n_half = config.n_group / 2;
        let mut n_remaining = config.n_group;
        let mut wn = Vec::with_capacity(config.n_flows);
        let mut convinv = Vec::with_capacity(config.n_flows);
        for k in 0..config.n_flows {
            if config.is_early_flow(k) {
                n_half -= config.n_early_size / 2;
                n_remaining -= config.n_early_size;
            }
            convinv.push(Invertible1x1Conv::load(vb.pp(format!("convinv.{k}.conv")), n_remaining)?);
            wn.push(Wn::load(
                vb.pp(format!("WN.{k}")),
                n_half,
                n_cond_channels,
                &config.wn_config,
            )?);
        }

        Ok(Self {
            varmap,
            upsample,
            wn,
            convinv,
            config: *config,
            seed: DEFAULT_NOISE_SEED,
            dtype,
            device: device.clone(),
        })
    }

    /// Use `seed` for the latent noise of every subsequent call.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Generate `[B, frames·256]` audio from `[B, n_mel, frames]` mel.
    pub fn inference(&self, mel: &Tensor, sigma: f64) -> Result<Tensor> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let n_group = self.config.n_group;

        let mel = mel.to_device(&self.device)?.to_dtype(self.dtype)?;
        let spect = self.upsample.forward(&mel)?;
        let time_cutoff = UPSAMPLE_KERNEL - UPSAMPLE_STRIDE;
        let upsampled_len = spect.dim(2)? - time_cutoff;
        let spect = spect.narrow(2, 0, upsampled_len)?;

        let (batch, n_mel, len) = spect.dims3()?;
        let steps = len / n_group;
        let spect = spect
            .reshape((batch, n_mel, steps, n_group))?
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, steps, n_mel * n_group))?
            .permute((0, 2, 1))?
            .contiguous()?;

        let noise_shape = [batch, self.config.n_remaining_channels(), steps];
        let mut audio =
            (layers::gaussian_noise(&mut rng, &noise_shape, self.dtype, &self.device)? * sigma)?;

        for k in (0..self.config.n_flows).rev() {
            let n_half = audio.dim(1)? / 2;
            let audio_0 = audio.narrow(1, 0, n_half)?;
            let audio_1 = audio.narrow(1, n_half, n_half)?;

            let output = self.wn[k].forward(&audio_0, &spect)?;
            let b = output.narrow(1, 0, n_half)?;
            let s = output.narrow(1, n_half, n_half)?;
            let audio_1 = ((audio_1 - b)? * s.neg()?.exp()?)?;
            audio = self.convinv[k].reverse(&Tensor::cat(&[&audio_0, &audio_1], 1)?)?;

            if self.config.is_early_flow(k) {
                let z = layers::gaussian_noise(
                    &mut rng,
                    &[batch, self.config.n_early_size, steps],
                    self.dtype,
                    &self.device,
                )?;
                audio = Tensor::cat(&[&(z * sigma)?, &audio], 1)?;
            }
        }

        let audio = audio
            .permute((0, 2, 1))?
            .contiguous()?
            .reshape((batch, steps * n_group))?;
        tracing::debug!("WaveGlow produced {} samples", steps * n_group);
        Ok(audio)
    }
}

impl Parameterized for WaveGlow {
    fn parameters(&self) -> &VarMap {
        &self.varmap
    }
}

impl Vocoder for WaveGlow {
    fn n_mel_channels(&self) -> usize {
        self.config.n_mel_channels
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn infer(&self, mel: &Tensor, sigma: f64) -> Result<Tensor> {
        self.inference(mel, sigma)
    }
}

/// Small configuration for CPU tests.
#[cfg(test)]
pub(crate) fn tiny_config() -> WaveGlowConfig {
    WaveGlowConfig {
        n_mel_channels: 8,
        n_flows: 2,
        n_group: 4,
        n_early_every: 4,
        n_early_size: 2,
        wn_config: WnConfig {
            n_layers: 2,
            n_channels: 8,
            kernel_size: 3,
        },
    }
}
