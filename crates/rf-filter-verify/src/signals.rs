//! Deterministic test signal generation

use crate::wav::WaveformCodec;
use crate::{dbfs_to_linear, Result, VerifyError};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

/// Default length of impulse, step and silence signals (samples)
pub const DEFAULT_LENGTH: usize = 32768;

/// Default white noise seed
pub const DEFAULT_NOISE_SEED: u64 = 42;

/// A generated waveform with its cache identity
#[derive(Debug, Clone)]
pub struct TestSignal {
    /// Identity, also the file stem when persisted
    pub name: String,

    /// Samples in [-1, 1]
    pub samples: Vec<f32>,

    pub sample_rate: u32,

    pub description: String,

    path: Option<PathBuf>,
}

impl TestSignal {
    fn build(
        name: String,
        samples: Vec<f32>,
        sample_rate: u32,
        description: String,
    ) -> Result<Self> {
        if sample_rate == 0 {
            return Err(VerifyError::Config("sample rate must be positive".into()));
        }
        if samples.is_empty() {
            return Err(VerifyError::Config(format!("signal '{}' has no samples", name)));
        }
        Ok(Self {
            name,
            samples,
            sample_rate,
            description,
            path: None,
        })
    }

    /// Single sample of `amplitude` at t = 0
    pub fn impulse(sample_rate: u32, length: usize, amplitude: f64) -> Result<Self> {
        let mut samples = vec![0.0f32; length];
        if let Some(first) = samples.first_mut() {
            *first = amplitude as f32;
        }
        Self::build(
            format!("impulse_{}", sample_rate),
            samples,
            sample_rate,
            format!("Unit impulse, {} samples at {} Hz", length, sample_rate),
        )
    }

    /// Constant `amplitude` from t = 0
    pub fn step(sample_rate: u32, length: usize, amplitude: f64) -> Result<Self> {
        Self::build(
            format!("step_{}", sample_rate),
            vec![amplitude as f32; length],
            sample_rate,
            format!("Unit step, {} samples at {} Hz", length, sample_rate),
        )
    }

    /// Logarithmic cosine sweep from `f0` to `f1` (default 0.45·sr), endpoint included
    pub fn chirp(
        sample_rate: u32,
        duration: f64,
        f0: f64,
        f1: Option<f64>,
        level_dbfs: f64,
    ) -> Result<Self> {
        let f1 = f1.unwrap_or(0.45 * sample_rate as f64);
        if !(f0 > 0.0 && f1 > 0.0) {
            return Err(VerifyError::Config(format!(
                "chirp frequencies must be positive, got {} -> {}",
                f0, f1
            )));
        }
        if !(duration > 0.0) {
            return Err(VerifyError::Config("chirp duration must be positive".into()));
        }

        let n = num_samples(duration, sample_rate);
        let amplitude = dbfs_to_linear(level_dbfs);
        let step = if n > 1 { duration / (n - 1) as f64 } else { 0.0 };
        let ratio = f1 / f0;

        let samples = (0..n)
            .map(|i| {
                let t = i as f64 * step;
                let phase = if (f1 - f0).abs() < f64::EPSILON {
                    2.0 * PI * f0 * t
                } else {
                    let beta = duration / ratio.ln();
                    2.0 * PI * beta * f0 * (ratio.powf(t / duration) - 1.0)
                };
                (amplitude * phase.cos()) as f32
            })
            .collect();

        Self::build(
            format!("chirp_{}-{}_{}", f0 as i64, f1 as i64, sample_rate),
            samples,
            sample_rate,
            format!(
                "Log chirp {:.0}-{:.0} Hz, {} dBFS, {}s",
                f0, f1, level_dbfs, duration
            ),
        )
    }

    /// Steady sine tone
    pub fn sine(sample_rate: u32, frequency: f64, duration: f64, level_dbfs: f64) -> Result<Self> {
        let samples = tone(&[frequency], duration, sample_rate, dbfs_to_linear(level_dbfs));
        Self::build(
            format!("sine_{}hz_{}", frequency as i64, sample_rate),
            samples,
            sample_rate,
            format!("Sine {:.0} Hz, {} dBFS, {}s", frequency, level_dbfs, duration),
        )
    }

    /// Sum of two equal-level tones
    pub fn two_tone(
        sample_rate: u32,
        f1: f64,
        f2: f64,
        duration: f64,
        level_dbfs: f64,
    ) -> Result<Self> {
        let samples = tone(&[f1, f2], duration, sample_rate, dbfs_to_linear(level_dbfs));
        Self::build(
            format!("twotone_{}_{}hz_{}", f1 as i64, f2 as i64, sample_rate),
            samples,
            sample_rate,
            format!("Two-tone {:.0}+{:.0} Hz, {} dBFS each", f1, f2, level_dbfs),
        )
    }

    /// Seeded Gaussian white noise, clipped to full scale
    pub fn white_noise(sample_rate: u32, duration: f64, rms_dbfs: f64, seed: u64) -> Result<Self> {
        let n = num_samples(duration, sample_rate);
        let rms = dbfs_to_linear(rms_dbfs);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut samples = Vec::with_capacity(n);
        while samples.len() < n {
            // Box-Muller; 1 - u keeps ln() away from zero
            let u1 = 1.0 - rng.random::<f64>();
            let u2 = rng.random::<f64>();
            let radius = (-2.0 * u1.ln()).sqrt();
            let angle = 2.0 * PI * u2;
            for z in [radius * angle.cos(), radius * angle.sin()] {
                if samples.len() < n {
                    samples.push((z * rms).clamp(-1.0, 1.0) as f32);
                }
            }
        }

        Self::build(
            format!("whitenoise_{}", sample_rate),
            samples,
            sample_rate,
            format!("White noise, {} dBFS RMS, {}s", rms_dbfs, duration),
        )
    }

    /// Very low frequency sine for DC behaviour
    pub fn near_dc(sample_rate: u32, frequency: f64, duration: f64, level_dbfs: f64) -> Result<Self> {
        let samples = tone(&[frequency], duration, sample_rate, dbfs_to_linear(level_dbfs));
        Self::build(
            format!("neardc_{}hz_{}", frequency as i64, sample_rate),
            samples,
            sample_rate,
            format!("Near-DC sine {:.1} Hz, {} dBFS", frequency, level_dbfs),
        )
    }

    /// Digital silence
    pub fn silence(sample_rate: u32, length: usize) -> Result<Self> {
        Self::build(
            format!("silence_{}", sample_rate),
            vec![0.0; length],
            sample_rate,
            format!("Digital silence, {} samples", length),
        )
    }

    /// Give the signal a distinct cache identity
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.path = None;
        self
    }

    /// Persisted location, once saved
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write `<dir>/<name>.wav` unless it already exists; the existing file is reused untouched
    pub fn save(&mut self, dir: &Path, codec: &dyn WaveformCodec) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }

        let path = dir.join(format!("{}.wav", self.name));
        if !path.exists() {
            std::fs::create_dir_all(dir).map_err(|e| VerifyError::persist(dir, e))?;
            codec
                .write(&path, &self.samples, self.sample_rate)
                .map_err(|e| VerifyError::persist(&path, e))?;
            log::debug!("Wrote test signal {}", path.display());
        }

        self.path = Some(path.clone());
        Ok(path)
    }

    /// Samples widened for analysis
    pub fn to_f64(&self) -> Vec<f64> {
        self.samples.iter().map(|&s| s as f64).collect()
    }

    /// Peak absolute amplitude
    pub fn peak(&self) -> f64 {
        self.samples.iter().map(|s| s.abs() as f64).fold(0.0, f64::max)
    }

    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

fn num_samples(duration: f64, sample_rate: u32) -> usize {
    if duration > 0.0 {
        (duration * sample_rate as f64) as usize
    } else {
        0
    }
}

/// Sum of unit sines at `freqs`, each scaled by `amplitude`
fn tone(freqs: &[f64], duration: f64, sample_rate: u32, amplitude: f64) -> Vec<f32> {
    let sr = sample_rate.max(1) as f64;
    (0..num_samples(duration, sample_rate))
        .map(|i| {
            let t = i as f64 / sr;
            let sum: f64 = freqs.iter().map(|f| (2.0 * PI * f * t).sin()).sum();
            (amplitude * sum) as f32
        })
        .collect()
}
