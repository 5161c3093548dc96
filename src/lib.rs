//! Tacotron2 + WaveGlow text-to-speech in pure Rust.
//!
//! A candle-based implementation of the Tacotron2 acoustic model and the
//! WaveGlow vocoder, composed into a synthesis pipeline for Korean text.
//! Loads safetensors checkpoints exported from the PyTorch training code,
//! including ones saved from data-parallel wrappers.
//!
//! ## Architecture
//!
//! ```text
//! text ─→ cleaners (numbers, Latin letters, jamo) ─→ symbol ids
//!                        ↓
//!              Tacotron2 (encoder + attention decoder + post-net)
//!                        ↓
//!              WaveGlow (mel → waveform, noise scale σ)
//!                        ↓
//!              Denoiser (bias spectrum subtraction)
//!                        ↓
//!              one segment per line, silence for empty lines ─→ WAV
//! ```
//!
//! ## Modules
//!
//! - [`text`]: cleaners, number reading, symbol table
//! - [`model`]: Tacotron2, WaveGlow, denoiser
//! - [`checkpoint`]: strict checkpoint loading
//! - [`audio`]: STFT, WAV I/O
//! - [`pipeline`]: end-to-end synthesis
//! - [`training`]: training job resolution and launch
//! - [`config`]: hyperparameters and vocoder configuration

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod text;
pub mod training;

mod error;

pub use error::{Error, Result};
