//! End-to-end synthesis pipeline.
//!
//! [`Synthesizer`] composes the stages for one sentence:
//! 1. Clean the text and map it to symbol ids
//! 2. Tacotron2: ids → post-net mel spectrogram
//! 3. WaveGlow: mel → waveform at noise scale `sigma`
//! 4. Denoiser: subtract the vocoder's bias spectrum
//!
//! Multi-line input goes through [`Synthesizer::inference_phrase`], which
//! synthesizes every line on its own and stitches the results together with
//! silence in place of empty lines.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};

use crate::audio::StftConfig;
use crate::checkpoint::load_checkpoint;
use crate::config::Hyperparameters;
use crate::model::denoiser::{Denoiser, DenoiserMode};
use crate::model::tacotron2::Tacotron2;
use crate::model::waveglow::{WaveGlow, WaveGlowConfig};
use crate::model::{AcousticModel, Vocoder};
use crate::text::{SymbolEncoder, TextEncoder};
use crate::{Error, Result};

/// Zero samples substituted for an empty line.
pub const DEFAULT_SILENCE_LENGTH: usize = 4000;

/// Runtime knobs for synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOptions {
    /// Vocoder latent noise scale.
    pub sigma: f64,
    /// Bias subtraction strength; `0.0` disables the denoiser.
    pub denoiser_strength: f32,
    pub denoiser_mode: DenoiserMode,
    /// Silence inserted for empty lines by [`Synthesizer::inference_phrase_default`].
    pub silence_length: usize,
    /// Seed for vocoder noise.
    pub seed: u64,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            sigma: 0.666,
            denoiser_strength: 0.01,
            denoiser_mode: DenoiserMode::Zeros,
            silence_length: DEFAULT_SILENCE_LENGTH,
            seed: 1234,
        }
    }
}

/// Everything needed to build a [`Synthesizer`] from checkpoints.
#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub hparams: Hyperparameters,
    pub waveglow: WaveGlowConfig,
    pub tacotron_checkpoint: Option<PathBuf>,
    pub waveglow_checkpoint: Option<PathBuf>,
    pub options: SynthesisOptions,
    pub dtype: DType,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            hparams: Hyperparameters::default(),
            waveglow: WaveGlowConfig::default(),
            tacotron_checkpoint: None,
            waveglow_checkpoint: None,
            options: SynthesisOptions::default(),
            dtype: DType::F32,
        }
    }
}

impl SynthesizerConfig {
    pub fn validate(&self) -> Result<()> {
        require_checkpoints(
            self.tacotron_checkpoint.as_deref(),
            self.waveglow_checkpoint.as_deref(),
        )?;
        self.hparams.validate()?;
        self.waveglow.validate()?;
        check_mel_channels(self.hparams.n_mel_channels, self.waveglow.n_mel_channels)
    }
}

/// Both checkpoint paths must be given before anything is loaded.
pub fn require_checkpoints(tacotron: Option<&Path>, waveglow: Option<&Path>) -> Result<()> {
    let missing: Vec<&str> = [("tacotron", tacotron), ("waveglow", waveglow)]
        .into_iter()
        .filter(|(_, path)| path.is_none())
        .map(|(name, _)| name)
        .collect();
    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "both checkpoints are required for synthesis, missing {missing:?}"
        )));
    }
    Ok(())
}

fn check_mel_channels(acoustic: usize, vocoder: usize) -> Result<()> {
    if acoustic != vocoder {
        return Err(Error::Config(format!(
            "acoustic model emits {acoustic} mel channels but the vocoder expects {vocoder}"
        )));
    }
    Ok(())
}

/// Text-to-speech synthesizer holding a loaded acoustic model and vocoder.
pub struct Synthesizer<A = Tacotron2, V = WaveGlow, E = SymbolEncoder> {
    encoder: E,
    acoustic: A,
    vocoder: V,
    denoiser: Option<Denoiser>,
    options: SynthesisOptions,
    sampling_rate: u32,
}

impl Synthesizer {
    /// Build both models on `device` and load their checkpoints.
    pub fn new(config: &SynthesizerConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let (Some(tacotron_path), Some(waveglow_path)) =
            (&config.tacotron_checkpoint, &config.waveglow_checkpoint)
        else {
            return Err(Error::Config("both checkpoints are required for synthesis".into()));
        };

        let t0 = Instant::now();
        let acoustic = load_checkpoint(
            tacotron_path,
            Tacotron2::new(&config.hparams, config.dtype, device)?,
        )?;
        let vocoder = load_checkpoint(
            waveglow_path,
            WaveGlow::new(&config.waveglow, config.dtype, device)?.with_seed(config.options.seed),
        )?;
        tracing::info!("Models loaded in {:.2}s", t0.elapsed().as_secs_f64());

        let encoder = SymbolEncoder::from_names(&config.hparams.text_cleaners)?;
        Self::from_parts(
            encoder,
            acoustic,
            vocoder,
            config.options.clone(),
            StftConfig::from(&config.hparams),
            config.hparams.sampling_rate,
        )
    }
}

impl<A: AcousticModel, V: Vocoder, E: TextEncoder> Synthesizer<A, V, E> {
    /// Assemble a synthesizer from already loaded components.
    ///
    /// The denoiser is measured from `vocoder` when
    /// `options.denoiser_strength > 0`.
    pub fn from_parts(
        encoder: E,
        acoustic: A,
        vocoder: V,
        options: SynthesisOptions,
        stft: StftConfig,
        sampling_rate: u32,
    ) -> Result<Self> {
        check_mel_channels(acoustic.n_mel_channels(), vocoder.n_mel_channels())?;
        let denoiser = if options.denoiser_strength > 0.0 {
            Some(Denoiser::new(
                &vocoder,
                stft,
                options.denoiser_mode,
                options.seed,
            )?)
        } else {
            None
        };
        Ok(Self {
            encoder,
            acoustic,
            vocoder,
            denoiser,
            options,
            sampling_rate,
        })
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    /// Synthesize one sentence.
    pub fn inference(&self, text: &str) -> Result<(Vec<f32>, u32)> {
        let t0 = Instant::now();
        let ids = self.encoder.encode(text)?;
        let sequence = Tensor::new(ids.as_slice(), self.acoustic.device())?.unsqueeze(0)?;

        let mel = self
            .acoustic
            .infer(&sequence)?
            .mel_postnet
            .to_device(self.vocoder.device())?
            .to_dtype(self.vocoder.dtype())?;
        let audio: Vec<f32> = self
            .vocoder
            .infer(&mel, self.options.sigma)?
            .get(0)?
            .to_dtype(DType::F32)?
            .to_vec1()?;

        let audio = match &self.denoiser {
            Some(denoiser) => denoiser.denoise(&audio, self.options.denoiser_strength),
            None => audio,
        };

        tracing::info!(
            "Synthesized {} symbols → {} samples in {:.2}s",
            ids.len(),
            audio.len(),
            t0.elapsed().as_secs_f64()
        );
        Ok((audio, self.sampling_rate))
    }

    /// Synthesize every line of `phrase` and concatenate the results.
    ///
    /// Lines are split on `\n` (a trailing `\r` is dropped). Empty lines
    /// become `silence_length` zero samples; lines of whitespace are
    /// synthesized like any other text.
    pub fn inference_phrase(&self, phrase: &str, silence_length: usize) -> Result<(Vec<f32>, u32)> {
        let mut samples = Vec::new();
        for (index, line) in phrase.split('\n').enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                tracing::debug!("Line {index}: {silence_length} samples of silence");
                samples.resize(samples.len() + silence_length, 0.0);
            } else {
                tracing::debug!("Line {index}: {line:?}");
                let (audio, _) = self.inference(line)?;
                samples.extend_from_slice(&audio);
            }
        }
        Ok((samples, self.sampling_rate))
    }

    /// [`Synthesizer::inference_phrase`] with the configured silence length.
    pub fn inference_phrase_default(&self, phrase: &str) -> Result<(Vec<f32>, u32)> {
        self.inference_phrase(phrase, self.options.silence_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, Parameterized};
    use crate::model::MelOutput;
    use crate::model::tacotron2::tiny_hparams;
    use crate::model::waveglow::tiny_config;
    use std::collections::HashMap;
    use std::path::Path;

    const HOP: usize = 4;

    /// One id per character.
    struct CharEncoder;

    impl TextEncoder for CharEncoder {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.chars().map(|c| c as u32 % 97).collect())
        }
    }

    /// Emits one frame per id, filled with the id value.
    struct EchoAcoustic {
        n_mel: usize,
        device: Device,
    }

    impl AcousticModel for EchoAcoustic {
        fn n_mel_channels(&self) -> usize {
            self.n_mel
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn infer(&self, sequence: &Tensor) -> Result<MelOutput> {
            let frames = sequence.dim(1)?;
            let ids = sequence.to_dtype(DType::F32)?.reshape((1, 1, frames))?;
            let mel = ids.broadcast_as((1, self.n_mel, frames))?.contiguous()?;
            Ok(MelOutput {
                mel: mel.clone(),
                mel_postnet: mel,
                gates: Tensor::zeros((1, frames), DType::F32, &Device::Cpu)?,
                alignments: Tensor::zeros((1, frames, frames), DType::F32, &Device::Cpu)?,
            })
        }
    }

    /// Repeats the first mel channel `HOP` times per frame, offset by sigma.
    struct RepeatVocoder {
        n_mel: usize,
        device: Device,
    }

    impl Vocoder for RepeatVocoder {
        fn n_mel_channels(&self) -> usize {
            self.n_mel
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn dtype(&self) -> DType {
            DType::F32
        }

        fn infer(&self, mel: &Tensor, sigma: f64) -> Result<Tensor> {
            let frames = mel.dim(2)?;
            let first = mel.narrow(1, 0, 1)?.reshape((1, frames, 1))?;
            let audio = first
                .broadcast_as((1, frames, HOP))?
                .contiguous()?
                .reshape((1, frames * HOP))?;
            Ok((audio + sigma)?)
        }
    }

    fn fake_synthesizer() -> Synthesizer<EchoAcoustic, RepeatVocoder, CharEncoder> {
        fake_synthesizer_with(SynthesisOptions {
            denoiser_strength: 0.0,
            ..Default::default()
        })
    }

    fn fake_synthesizer_with(
        options: SynthesisOptions,
    ) -> Synthesizer<EchoAcoustic, RepeatVocoder, CharEncoder> {
        Synthesizer::from_parts(
            CharEncoder,
            EchoAcoustic {
                n_mel: 8,
                device: Device::Cpu,
            },
            RepeatVocoder {
                n_mel: 8,
                device: Device::Cpu,
            },
            options,
            StftConfig::default(),
            22050,
        )
        .unwrap()
    }

    #[test]
    fn empty_phrase_is_exact_silence() {
        let synth = fake_synthesizer();
        let (audio, sr) = synth.inference_phrase("", 4000).unwrap();
        assert_eq!(sr, 22050);
        assert_eq!(audio, vec![0.0; 4000]);
    }

    #[test]
    fn configured_silence_length_is_used() {
        let synth = fake_synthesizer_with(SynthesisOptions {
            denoiser_strength: 0.0,
            silence_length: 10,
            ..Default::default()
        });
        let (audio, _) = synth.inference_phrase_default("").unwrap();
        assert_eq!(audio, vec![0.0; 10]);
        let (audio, _) = synth.inference_phrase_default("ab

cd").unwrap();
        assert_eq!(audio.len(), 4 * HOP + 10);
    }

    #[test]
    fn lines_are_synthesized_independently_and_concatenated() {
        let synth = fake_synthesizer();
        let (a, _) = synth.inference("abc").unwrap();
        let (b, _) = synth.inference("de").unwrap();
        let (joined, _) = synth.inference_phrase("abc\nde", 4000).unwrap();
        assert_eq!(joined, [a, b].concat());
    }

    #[test]
    fn phrase_length_counts_segments_and_silences() {
        let synth = fake_synthesizer();
        let (audio, _) = synth.inference_phrase("ab\n\nxyz\n", 100).unwrap();
        // 2 + 3 characters at HOP samples each, two empty lines.
        assert_eq!(audio.len(), (2 + 3) * HOP + 2 * 100);
        assert!(audio[2 * HOP..2 * HOP + 100].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn carriage_returns_are_dropped() {
        let synth = fake_synthesizer();
        let (crlf, _) = synth.inference_phrase("ab\r\n\r\ncd", 10).unwrap();
        let (lf, _) = synth.inference_phrase("ab\n\ncd", 10).unwrap();
        assert_eq!(crlf, lf);
    }

    #[test]
    fn whitespace_line_is_synthesized() {
        let synth = fake_synthesizer();
        let (audio, _) = synth.inference_phrase(" ", 4000).unwrap();
        assert_eq!(audio.len(), HOP);
    }

    #[test]
    fn sigma_reaches_vocoder() {
        let synth = fake_synthesizer();
        let (audio, _) = synth.inference("a").unwrap();
        let expected = ('a' as u32 % 97) as f32 + 0.666;
        assert!(audio.iter().all(|&s| (s - expected).abs() < 1e-5));
    }

    #[test]
    fn mel_channel_mismatch_is_config_error() {
        let result = Synthesizer::from_parts(
            CharEncoder,
            EchoAcoustic {
                n_mel: 80,
                device: Device::Cpu,
            },
            RepeatVocoder {
                n_mel: 8,
                device: Device::Cpu,
            },
            SynthesisOptions::default(),
            StftConfig::default(),
            22050,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn missing_checkpoint_paths_are_config_error() {
        let config = SynthesizerConfig::default();
        let err = Synthesizer::new(&config, &Device::Cpu).err().unwrap();
        match err {
            Error::Config(message) => assert!(message.contains("tacotron"), "{message}"),
            other => panic!("expected config error, got {other}"),
        }
    }

    #[test]
    fn checkpoint_paths_checked_without_touching_files() {
        let present = Path::new("/nonexistent/tacotron.safetensors");
        assert!(require_checkpoints(Some(present), Some(present)).is_ok());
        match require_checkpoints(None, Some(present)) {
            Err(Error::Config(message)) => {
                assert!(message.contains("tacotron"), "{message}");
                assert!(!message.contains("waveglow"), "{message}");
            }
            other => panic!("expected config error, got {other:?}"),
        }
        assert!(matches!(require_checkpoints(None, None), Err(Error::Config(_))));
    }

    fn save_with_prefix(model: &impl Parameterized, path: &Path) {
        let state_dict: HashMap<String, Tensor> = model
            .state_dict()
            .unwrap()
            .into_iter()
            .map(|(name, tensor)| (format!("module.{name}"), tensor))
            .collect();
        Checkpoint::save(path, &state_dict).unwrap();
    }

    fn tiny_config_with_checkpoints(dir: &Path) -> SynthesizerConfig {
        let hparams = tiny_hparams();
        let waveglow = tiny_config();
        let tacotron_path = dir.join("tacotron2.safetensors");
        let waveglow_path = dir.join("waveglow.safetensors");
        save_with_prefix(
            &Tacotron2::new(&hparams, DType::F32, &Device::Cpu).unwrap(),
            &tacotron_path,
        );
        save_with_prefix(
            &WaveGlow::new(&waveglow, DType::F32, &Device::Cpu).unwrap(),
            &waveglow_path,
        );
        SynthesizerConfig {
            hparams,
            waveglow,
            tacotron_checkpoint: Some(tacotron_path),
            waveglow_checkpoint: Some(waveglow_path),
            ..Default::default()
        }
    }

    #[test]
    fn missing_checkpoint_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config_with_checkpoints(dir.path());
        config.waveglow_checkpoint = Some(dir.path().join("absent.safetensors"));
        let err = Synthesizer::new(&config, &Device::Cpu).err().unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn config_mel_mismatch_rejected_before_loading() {
        let mut config = SynthesizerConfig {
            tacotron_checkpoint: Some("never-read.safetensors".into()),
            waveglow_checkpoint: Some("never-read.safetensors".into()),
            ..Default::default()
        };
        config.waveglow.n_mel_channels = 40;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn tiny_models_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config_with_checkpoints(dir.path());
        let synth = Synthesizer::new(&config, &Device::Cpu).unwrap();
        assert_eq!(synth.sampling_rate(), 22050);

        let (first, sr) = synth.inference("안녕").unwrap();
        assert_eq!(sr, 22050);
        assert!(!first.is_empty());
        assert_eq!(first.len() % 256, 0);
        assert!(first.iter().all(|s| s.is_finite()));

        let (again, _) = synth.inference("안녕").unwrap();
        assert_eq!(first, again);

        let (second, _) = synth.inference("하세요 1").unwrap();
        let (phrase, _) = synth.inference_phrase("안녕\n\n하세요 1", 500).unwrap();
        let expected = [first, vec![0.0; 500], second].concat();
        assert_eq!(phrase, expected);
    }
}
