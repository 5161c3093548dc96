//! WAV file I/O.

use crate::Result;
use std::path::Path;

/// Write mono f32 samples as a 32-bit float WAV file.
///
/// Samples are written unscaled; synthesized audio is not clipped.
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    tracing::debug!(samples = samples.len(), sample_rate, "wrote wav");
    Ok(())
}
