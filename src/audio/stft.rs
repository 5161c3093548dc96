//! Short-time Fourier transform and its overlap-add inverse.
//!
//! Matches the Tacotron2/WaveGlow STFT layout:
//! - FFT size `filter_length` (one-sided spectrum of `filter_length/2 + 1` bins)
//! - periodic Hann window of `win_length`, zero-padded to `filter_length`
//! - hop `hop_length`
//! - reflect padding of `filter_length / 2` on both sides before framing
//!
//! The inverse divides the overlap-added frames by the summed squared window,
//! so `inverse(transform(x))` reconstructs `x`.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::config::Hyperparameters;
use crate::{Error, Result};

/// Window-sum values below this are treated as uncovered samples.
const WINDOW_SUM_FLOOR: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StftConfig {
    pub filter_length: usize,
    pub hop_length: usize,
    pub win_length: usize,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self {
            filter_length: 1024,
            hop_length: 256,
            win_length: 1024,
        }
    }
}

impl From<&Hyperparameters> for StftConfig {
    fn from(hp: &Hyperparameters) -> Self {
        Self {
            filter_length: hp.filter_length,
            hop_length: hp.hop_length,
            win_length: hp.win_length,
        }
    }
}

/// Per-frame magnitude and phase, `[num_frames][num_bins]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub magnitude: Vec<Vec<f32>>,
    pub phase: Vec<Vec<f32>>,
}

impl Spectrum {
    pub fn num_frames(&self) -> usize {
        self.magnitude.len()
    }
}

/// STFT processor with a precomputed window and FFT plans.
pub struct Stft {
    config: StftConfig,
    window: Vec<f64>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for Stft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stft").field("config", &self.config).finish()
    }
}

impl Stft {
    pub fn new(config: StftConfig) -> Result<Self> {
        if config.filter_length < 2
            || config.hop_length == 0
            || config.win_length == 0
            || config.win_length > config.filter_length
        {
            return Err(Error::Audio(format!("invalid STFT config {config:?}")));
        }

        let window = hann_window(config.win_length, config.filter_length);
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(config.filter_length);
        let inverse = planner.plan_fft_inverse(config.filter_length);

        Ok(Self {
            config,
            window,
            forward,
            inverse,
        })
    }

    pub fn num_bins(&self) -> usize {
        self.config.filter_length / 2 + 1
    }

    /// Magnitude/phase spectrum of `samples`.
    pub fn transform(&self, samples: &[f32]) -> Spectrum {
        let n_fft = self.config.filter_length;
        let hop = self.config.hop_length;
        let num_bins = self.num_bins();

        let signal: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let padded = reflect_pad(&signal, n_fft / 2);
        let num_frames = (padded.len() - n_fft) / hop + 1;

        let mut magnitude = Vec::with_capacity(num_frames);
        let mut phase = Vec::with_capacity(num_frames);

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            let mut buffer: Vec<Complex<f64>> = (0..n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();
            self.forward.process(&mut buffer);

            magnitude.push(buffer[..num_bins].iter().map(|c| c.norm() as f32).collect());
            phase.push(buffer[..num_bins].iter().map(|c| c.arg() as f32).collect());
        }

        Spectrum { magnitude, phase }
    }

    /// Overlap-add reconstruction, trimmed to `num_samples`.
    pub fn inverse(&self, spectrum: &Spectrum, num_samples: usize) -> Vec<f32> {
        let n_fft = self.config.filter_length;
        let hop = self.config.hop_length;
        let num_bins = self.num_bins();
        let num_frames = spectrum.num_frames();
        if num_frames == 0 {
            return vec![0.0; num_samples];
        }

        let total = n_fft + hop * (num_frames - 1);
        let mut signal = vec![0.0f64; total];
        let mut window_sum = vec![0.0f64; total];
        let scale = 1.0 / n_fft as f64;

        for (frame_idx, (magnitudes, phases)) in spectrum
            .magnitude
            .iter()
            .zip(&spectrum.phase)
            .enumerate()
        {
            let mut buffer = vec![Complex::new(0.0f64, 0.0); n_fft];
            for (bin, (&m, &p)) in magnitudes.iter().zip(phases).take(num_bins).enumerate() {
                buffer[bin] = Complex::from_polar(m as f64, p as f64);
            }
            // Hermitian symmetry for a real-valued output.
            for bin in 1..n_fft.div_ceil(2) {
                buffer[n_fft - bin] = buffer[bin].conj();
            }
            self.inverse.process(&mut buffer);

            let start = frame_idx * hop;
            for (i, value) in buffer.iter().enumerate() {
                let w = self.window[i];
                signal[start + i] += value.re * scale * w;
                window_sum[start + i] += w * w;
            }
        }

        for (sample, &sum) in signal.iter_mut().zip(&window_sum) {
            if sum > WINDOW_SUM_FLOOR {
                *sample /= sum;
            }
        }

        let mut out: Vec<f32> = signal
            .into_iter()
            .skip(n_fft / 2)
            .take(num_samples)
            .map(|s| s as f32)
            .collect();
        out.resize(num_samples, 0.0);
        out
    }
}

/// Periodic Hann window of `win_length`, centered in `filter_length` zeros.
fn hann_window(win_length: usize, filter_length: usize) -> Vec<f64> {
    let offset = (filter_length - win_length) / 2;
    let mut window = vec![0.0; filter_length];
    for i in 0..win_length {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / win_length as f64;
        window[offset + i] = 0.5 * (1.0 - phase.cos());
    }
    window
}

/// Reflect-pad a signal by `pad` on both sides.
///
/// Signals too short to reflect are zero-padded instead.
fn reflect_pad(signal: &[f64], pad: usize) -> Vec<f64> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(len + 2 * pad);

    if len <= pad {
        padded.resize(pad, 0.0);
        padded.extend_from_slice(signal);
        padded.resize(len + 2 * pad, 0.0);
        return padded;
    }

    // Left reflection: signal[pad], signal[pad-1], ..., signal[1]
    for i in (1..=pad).rev() {
        padded.push(signal[i]);
    }

    padded.extend_from_slice(signal);

    // Right reflection: signal[len-2], signal[len-3], ...
    for i in 0..pad {
        padded.push(signal[len - 2 - i]);
    }

    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(num_samples: usize, freq: f64, sample_rate: f64) -> Vec<f32> {
        (0..num_samples)
            .map(|i| {
                let t = i as f64 / sample_rate;
                (0.5 * (2.0 * std::f64::consts::PI * freq * t).sin()) as f32
            })
            .collect()
    }

    #[test]
    fn hann_window_properties() {
        let w = hann_window(1024, 1024);
        assert_eq!(w.len(), 1024);
        assert!(w[0].abs() < 1e-10);
        assert!((w[512] - 1.0).abs() < 1e-10);
        assert!((w[100] - w[1024 - 100]).abs() < 1e-10);
    }

    #[test]
    fn short_window_is_centered() {
        let w = hann_window(8, 16);
        assert!(w[..4].iter().all(|&v| v == 0.0));
        assert!(w[12..].iter().all(|&v| v == 0.0));
        assert!((w[8] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn reflect_pad_basic() {
        let signal = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let padded = reflect_pad(&signal, 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
    }

    #[test]
    fn reflect_pad_short_signal_falls_back_to_zeros() {
        let padded = reflect_pad(&[1.0, 2.0], 3);
        assert_eq!(padded, vec![0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn frame_count() {
        let stft = Stft::new(StftConfig::default()).unwrap();
        let spectrum = stft.transform(&vec![0.0; 4096]);
        // (4096 + 1024 - 1024) / 256 + 1
        assert_eq!(spectrum.num_frames(), 17);
        assert_eq!(spectrum.magnitude[0].len(), 513);
        assert_eq!(spectrum.phase[0].len(), 513);
    }

    #[test]
    fn sine_energy_lands_in_expected_bin() {
        let stft = Stft::new(StftConfig::default()).unwrap();
        // Bin 32 of a 1024-point FFT at 22050 Hz.
        let freq = 32.0 * 22050.0 / 1024.0;
        let spectrum = stft.transform(&sine(8192, freq, 22050.0));
        let frame = &spectrum.magnitude[16];
        let peak = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(bin, _)| bin)
            .unwrap();
        assert_eq!(peak, 32);
    }

    #[test]
    fn inverse_reconstructs_signal() {
        let stft = Stft::new(StftConfig::default()).unwrap();
        let signal = sine(4096, 440.0, 22050.0);
        let spectrum = stft.transform(&signal);
        let reconstructed = stft.inverse(&spectrum, signal.len());
        assert_eq!(reconstructed.len(), signal.len());
        let max_err = signal
            .iter()
            .zip(&reconstructed)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 1e-4, "max reconstruction error {max_err}");
    }

    #[test]
    fn inverse_of_empty_spectrum_is_silence() {
        let stft = Stft::new(StftConfig::default()).unwrap();
        let spectrum = Spectrum {
            magnitude: vec![],
            phase: vec![],
        };
        assert_eq!(stft.inverse(&spectrum, 10), vec![0.0; 10]);
    }

    #[test]
    fn invalid_config_rejected() {
        let config = StftConfig {
            filter_length: 512,
            hop_length: 128,
            win_length: 1024,
        };
        assert!(Stft::new(config).is_err());
    }
}
