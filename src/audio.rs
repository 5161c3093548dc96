//! Audio utilities: STFT analysis/resynthesis and WAV I/O.
//!
//! Synthesis output is mono f32 at the acoustic model's sampling rate.

pub mod stft;
mod wav;

pub use stft::{Spectrum, Stft, StftConfig};
pub use wav::write_wav;
