//! FFT provider and spectral helpers

use crate::{Result, VerifyError};
use num_complex::Complex64;
use parking_lot::Mutex;
use realfft::RealFftPlanner;
use std::f64::consts::PI;

/// Forward real FFT capability
pub trait FftProvider: Send + Sync {
    /// Transform `input` (length n) into its n/2+1 one-sided bins
    fn forward(&self, input: &[f64]) -> Result<Vec<Complex64>>;
}

/// realfft-backed provider; plans are cached per length
pub struct RealFftProvider {
    planner: Mutex<RealFftPlanner<f64>>,
}

impl RealFftProvider {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(RealFftPlanner::new()),
        }
    }
}

impl Default for RealFftProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FftProvider for RealFftProvider {
    fn forward(&self, input: &[f64]) -> Result<Vec<Complex64>> {
        if input.is_empty() {
            return Err(VerifyError::Fft("cannot transform an empty buffer".into()));
        }

        let fft = self.planner.lock().plan_fft_forward(input.len());

        let mut buffer = input.to_vec();
        let mut spectrum = fft.make_output_vec();
        fft.process(&mut buffer, &mut spectrum)
            .map_err(|e| VerifyError::Fft(e.to_string()))?;

        Ok(spectrum)
    }
}

/// Symmetric Hann window of length `n`
pub fn hann_window(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (n - 1) as f64;
            (0..n)
                .map(|k| 0.5 - 0.5 * (2.0 * PI * k as f64 / denom).cos())
                .collect()
        }
    }
}

/// Smallest power of two >= n (1 for n = 0)
pub fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Center frequency of each one-sided bin of an `n_fft` transform
pub fn bin_frequencies(n_fft: usize, sample_rate: u32) -> Vec<f64> {
    let resolution = sample_rate as f64 / n_fft as f64;
    (0..n_fft / 2 + 1).map(|k| k as f64 * resolution).collect()
}

/// Nearest bin for `freq` in an `n_fft` transform, clamped to Nyquist
pub fn freq_to_bin(freq: f64, n_fft: usize, sample_rate: u32) -> usize {
    let bin = (freq * n_fft as f64 / sample_rate as f64).round();
    if bin <= 0.0 {
        0
    } else {
        (bin as usize).min(n_fft / 2)
    }
}

/// Power ratio to dB with a tiny floor
pub fn power_to_db(power: f64) -> f64 {
    10.0 * (power + 1e-12).log10()
}

/// Hann-windowed, zero-padded one-sided spectrum of `samples`
pub fn windowed_spectrum(
    fft: &dyn FftProvider,
    samples: &[f64],
    n_fft: usize,
) -> Result<Vec<Complex64>> {
    let window = hann_window(samples.len());
    let mut buffer = vec![0.0; n_fft.max(samples.len())];
    for (dst, (&x, &w)) in buffer.iter_mut().zip(samples.iter().zip(window.iter())) {
        *dst = x * w;
    }
    fft.forward(&buffer)
}

/// Remove 2π jumps between consecutive phase values
pub fn unwrap_phase(phase: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phase.len());
    let Some(&first) = phase.first() else {
        return out;
    };
    out.push(first);

    let mut correction = 0.0;
    for pair in phase.windows(2) {
        let delta = pair[1] - pair[0];
        if delta.abs() >= PI {
            let mut wrapped = (delta + PI).rem_euclid(2.0 * PI) - PI;
            if wrapped == -PI && delta > 0.0 {
                wrapped = PI;
            }
            correction += wrapped - delta;
        }
        out.push(pair[1] + correction);
    }
    out
}

/// Unit-spacing numerical derivative: central differences inside, one-sided at the ends
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => {
            let mut out = Vec::with_capacity(n);
            out.push(values[1] - values[0]);
            for i in 1..n - 1 {
                out.push((values[i + 1] - values[i - 1]) / 2.0);
            }
            out.push(values[n - 1] - values[n - 2]);
            out
        }
    }
}

/// Index of the largest finite value
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fft_of_sine_peaks_at_bin() {
        let fft = RealFftProvider::new();
        let n = 1024;
        let samples: Vec<f64> = (0..n)
            .map(|i| (2.0 * PI * 64.0 * i as f64 / n as f64).sin())
            .collect();

        let spectrum = fft.forward(&samples).unwrap();
        assert_eq!(spectrum.len(), n / 2 + 1);

        let mags: Vec<f64> = spectrum.iter().map(|c| c.norm()).collect();
        assert_eq!(argmax(&mags), Some(64));
        assert_relative_eq!(mags[64], n as f64 / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_fft_rejects_empty() {
        let fft = RealFftProvider::new();
        assert!(matches!(fft.forward(&[]), Err(VerifyError::Fft(_))));
    }

    #[test]
    fn test_hann_window_is_symmetric() {
        let w = hann_window(5);
        assert_relative_eq!(w[0], 0.0);
        assert_relative_eq!(w[2], 1.0);
        assert_relative_eq!(w[4], 0.0);
        assert_relative_eq!(w[1], w[3]);
        assert_eq!(hann_window(1), vec![1.0]);
        assert!(hann_window(0).is_empty());
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1000), 1024);
        assert_eq!(next_power_of_two(1024), 1024);
        assert_eq!(next_power_of_two(44100), 65536);
    }

    #[test]
    fn test_freq_to_bin() {
        assert_eq!(freq_to_bin(1000.0, 1024, 44100), 23);
        assert_eq!(freq_to_bin(-5.0, 1024, 44100), 0);
        assert_eq!(freq_to_bin(1e9, 1024, 44100), 512);
    }

    #[test]
    fn test_unwrap_linear_phase() {
        let truth: Vec<f64> = (0..50).map(|i| -0.4 * i as f64).collect();
        let wrapped: Vec<f64> = truth
            .iter()
            .map(|p| (p + PI).rem_euclid(2.0 * PI) - PI)
            .collect();

        let unwrapped = unwrap_phase(&wrapped);
        for (u, t) in unwrapped.iter().zip(truth.iter()) {
            assert_relative_eq!(*u, *t, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_gradient_edges() {
        assert_eq!(gradient(&[1.0, 4.0, 9.0, 16.0]), vec![3.0, 4.0, 6.0, 7.0]);
        assert_eq!(gradient(&[2.0]), vec![0.0]);
    }

    #[test]
    fn test_argmax_ignores_nan() {
        assert_eq!(argmax(&[1.0, f64::NAN, 3.0, 2.0]), Some(2));
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[5.0, 5.0]), Some(0));
    }
}
