//! Waveform file I/O

use crate::{Result, VerifyError};
use std::path::Path;

/// Mono waveform normalized to [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Samples widened for analysis
    pub fn to_f64(&self) -> Vec<f64> {
        self.samples.iter().map(|&s| s as f64).collect()
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Peak absolute amplitude
    pub fn peak(&self) -> f32 {
        self.samples.iter().map(|s| s.abs()).fold(0.0, f32::max)
    }
}

/// Waveform persistence capability
pub trait WaveformCodec: Send + Sync {
    /// Write mono samples to `path`
    fn write(&self, path: &Path, samples: &[f32], sample_rate: u32) -> Result<()>;

    /// Read `path` as a mono waveform
    fn read(&self, path: &Path) -> Result<Waveform>;
}

/// hound-backed WAV codec: writes 16-bit PCM, reads any PCM/float WAV
#[derive(Debug, Clone, Copy, Default)]
pub struct HoundCodec;

impl HoundCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Full-scale divisor for integer PCM of the given width
fn int_scale(bits: u16) -> f64 {
    match bits {
        16 => 32767.0,
        24 => 8388607.0,
        32 => 2147483647.0,
        b => ((1i64 << (b.clamp(2, 32) - 1)) - 1) as f64,
    }
}

/// Average interleaved frames down to one channel
fn downmix(interleaved: Vec<f64>, num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return interleaved.into_iter().map(|s| s as f32).collect();
    }

    let scale = 1.0 / num_channels as f64;
    interleaved
        .chunks_exact(num_channels)
        .map(|frame| (frame.iter().sum::<f64>() * scale) as f32)
        .collect()
}

impl WaveformCodec for HoundCodec {
    fn write(&self, path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in samples {
            let quantized = (sample.clamp(-1.0, 1.0) as f64 * 32767.0).round() as i16;
            writer.write_sample(quantized)?;
        }
        writer.finalize()?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Waveform> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.channels == 0 {
            return Err(VerifyError::Analysis(format!(
                "{}: no channels",
                path.display()
            )));
        }

        let interleaved: Vec<f64> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .map(|s| s.map(|v| v as f64))
                .collect::<std::result::Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let scale = int_scale(spec.bits_per_sample);
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f64 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        Ok(Waveform::new(
            downmix(interleaved, spec.channels as usize),
            spec.sample_rate,
        ))
    }
}
