//! Configuration for the Tacotron2 acoustic model and the WaveGlow vocoder.
//!
//! [`Hyperparameters`] matches the reference Tacotron2 `hparams` defaults and
//! is assembled once per process from those defaults plus a
//! `name=value,...` override string. [`VocoderFileConfig`] is the WaveGlow
//! JSON document with its four required sections.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::waveglow::WaveGlowConfig;
use crate::text::symbols;
use crate::{Error, Result};

/// Tacotron2 hyperparameters, shared by model construction and inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    // --- Experiment ---
    pub epochs: usize,
    pub iters_per_checkpoint: usize,
    pub seed: u64,
    pub fp16_run: bool,
    pub distributed_run: bool,
    pub dist_backend: String,
    pub dist_url: String,
    pub cudnn_enabled: bool,
    pub cudnn_benchmark: bool,
    pub ignore_layers: Vec<String>,

    // --- Data ---
    pub load_mel_from_disk: bool,
    pub training_files: String,
    pub validation_files: String,
    pub text_cleaners: Vec<String>,

    // --- Audio ---
    pub max_wav_value: f32,
    pub sampling_rate: u32,
    pub filter_length: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub n_mel_channels: usize,
    pub mel_fmin: f32,
    pub mel_fmax: f32,

    // --- Model ---
    pub n_symbols: usize,
    pub symbols_embedding_dim: usize,

    // Encoder
    pub encoder_kernel_size: usize,
    pub encoder_n_convolutions: usize,
    pub encoder_embedding_dim: usize,

    // Decoder
    pub n_frames_per_step: usize,
    pub decoder_rnn_dim: usize,
    pub prenet_dim: usize,
    pub max_decoder_steps: usize,
    pub gate_threshold: f32,
    pub p_attention_dropout: f32,
    pub p_decoder_dropout: f32,

    // Attention
    pub attention_rnn_dim: usize,
    pub attention_dim: usize,

    // Location layer
    pub attention_location_n_filters: usize,
    pub attention_location_kernel_size: usize,

    // Post-net
    pub postnet_embedding_dim: usize,
    pub postnet_kernel_size: usize,
    pub postnet_n_convolutions: usize,

    // --- Optimization ---
    pub use_saved_learning_rate: bool,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub grad_clip_thresh: f64,
    pub batch_size: usize,
    pub mask_padding: bool,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epochs: 500,
            iters_per_checkpoint: 1000,
            seed: 1234,
            fp16_run: false,
            distributed_run: false,
            dist_backend: "nccl".to_string(),
            dist_url: "tcp://localhost:54321".to_string(),
            cudnn_enabled: true,
            cudnn_benchmark: false,
            ignore_layers: vec!["embedding.weight".to_string()],
            load_mel_from_disk: false,
            training_files: "filelists/train_filelist.txt".to_string(),
            validation_files: "filelists/val_filelist.txt".to_string(),
            text_cleaners: vec!["korean_cleaners".to_string()],
            max_wav_value: 32768.0,
            sampling_rate: 22050,
            filter_length: 1024,
            hop_length: 256,
            win_length: 1024,
            n_mel_channels: 80,
            mel_fmin: 0.0,
            mel_fmax: 8000.0,
            n_symbols: symbols::SYMBOLS.len(),
            symbols_embedding_dim: 512,
            encoder_kernel_size: 5,
            encoder_n_convolutions: 3,
            encoder_embedding_dim: 512,
            n_frames_per_step: 1,
            decoder_rnn_dim: 1024,
            prenet_dim: 256,
            max_decoder_steps: 1000,
            gate_threshold: 0.5,
            p_attention_dropout: 0.1,
            p_decoder_dropout: 0.1,
            attention_rnn_dim: 1024,
            attention_dim: 128,
            attention_location_n_filters: 32,
            attention_location_kernel_size: 31,
            postnet_embedding_dim: 512,
            postnet_kernel_size: 5,
            postnet_n_convolutions: 5,
            use_saved_learning_rate: false,
            learning_rate: 1e-3,
            weight_decay: 1e-6,
            grad_clip_thresh: 1.0,
            batch_size: 64,
            mask_padding: true,
        }
    }
}

impl Hyperparameters {
    /// Apply a comma-separated `name=value` override string.
    ///
    /// Values are parsed as JSON when possible (`sampling_rate=16000`,
    /// `fp16_run=true`, `text_cleaners=["basic_cleaners"]`) and fall back to a
    /// plain string otherwise. Unknown names are rejected.
    pub fn with_overrides(self, overrides: &str) -> Result<Self> {
        if overrides.trim().is_empty() {
            return Ok(self);
        }

        let Value::Object(mut fields) = serde_json::to_value(&self)? else {
            return Err(Error::Config("hyperparameters did not serialize to an object".into()));
        };

        for pair in split_top_level(overrides) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, raw) = pair.split_once('=').ok_or_else(|| {
                Error::Config(format!("hparam override '{pair}' is not name=value"))
            })?;
            let name = name.trim();
            if !fields.contains_key(name) {
                return Err(Error::Config(format!("unknown hparam '{name}'")));
            }
            let raw = raw.trim();
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            fields.insert(name.to_string(), value);
        }

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| Error::Config(format!("hparam override: {e}")))
    }

    /// Check the invariants the inference path relies on.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_rate == 0 {
            return Err(Error::Config("sampling_rate must be positive".into()));
        }
        if self.n_frames_per_step == 0 {
            return Err(Error::Config("n_frames_per_step must be at least 1".into()));
        }
        if self.max_decoder_steps == 0 {
            return Err(Error::Config("max_decoder_steps must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.gate_threshold) {
            return Err(Error::Config(format!(
                "gate_threshold must be in [0, 1), got {}",
                self.gate_threshold
            )));
        }
        if self.encoder_embedding_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "encoder_embedding_dim must be even for the bidirectional LSTM, got {}",
                self.encoder_embedding_dim
            )));
        }
        if self.symbols_embedding_dim != self.encoder_embedding_dim {
            return Err(Error::Config(format!(
                "symbols_embedding_dim ({}) must equal encoder_embedding_dim ({})",
                self.symbols_embedding_dim, self.encoder_embedding_dim
            )));
        }
        if self.encoder_kernel_size % 2 == 0
            || self.postnet_kernel_size % 2 == 0
            || self.attention_location_kernel_size % 2 == 0
        {
            return Err(Error::Config("convolution kernel sizes must be odd".into()));
        }
        if self.postnet_n_convolutions < 2 {
            return Err(Error::Config(format!(
                "postnet_n_convolutions must be at least 2, got {}",
                self.postnet_n_convolutions
            )));
        }
        if self.win_length > self.filter_length || self.hop_length == 0 {
            return Err(Error::Config(format!(
                "invalid STFT setup: filter_length={}, hop_length={}, win_length={}",
                self.filter_length, self.hop_length, self.win_length
            )));
        }
        if self.text_cleaners.is_empty() {
            return Err(Error::Config("text_cleaners must name at least one cleaner".into()));
        }
        Ok(())
    }
}

/// Split on commas that are not nested inside `[...]` or `"..."`.
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => depth = depth.saturating_sub(1),
            ',' if !in_string && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// The WaveGlow JSON configuration document.
///
/// `train_config`, `data_config` and `dist_config` are flat maps handed to
/// the training launcher untouched; `waveglow_config` describes the vocoder
/// architecture and is used for both training and synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocoderFileConfig {
    pub train_config: Map<String, Value>,
    pub data_config: Map<String, Value>,
    pub dist_config: Map<String, Value>,
    pub waveglow_config: WaveGlowConfig,
}

impl VocoderFileConfig {
    /// Sections every vocoder configuration file must contain.
    pub const REQUIRED_SECTIONS: [&'static str; 4] =
        ["train_config", "data_config", "dist_config", "waveglow_config"];

    /// Read and validate a vocoder configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read vocoder config {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Parse a vocoder configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)?;
        let Value::Object(sections) = &document else {
            return Err(Error::Config("vocoder config must be a JSON object".into()));
        };

        let missing: Vec<&str> = Self::REQUIRED_SECTIONS
            .iter()
            .copied()
            .filter(|name| !sections.get(*name).is_some_and(Value::is_object))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "vocoder config is missing sections {missing:?}"
            )));
        }

        let config: Self = serde_json::from_value(document)
            .map_err(|e| Error::Config(format!("vocoder config: {e}")))?;
        config.waveglow_config.validate()?;
        Ok(config)
    }

    /// Point the trainer's checkpoint output at `output_directory`, so both
    /// models persist into the same directory.
    pub fn with_output_directory(mut self, output_directory: &Path) -> Self {
        self.train_config.insert(
            "output_directory".to_string(),
            Value::String(output_directory.display().to_string()),
        );
        self
    }

    /// Sampling rate declared by the data section, when present.
    pub fn sampling_rate(&self) -> Option<u32> {
        self.data_config
            .get("sampling_rate")
            .and_then(Value::as_u64)
            .and_then(|rate| u32::try_from(rate).ok())
    }
}
