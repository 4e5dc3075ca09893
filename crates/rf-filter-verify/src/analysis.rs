//! Metric extraction from filter output waveforms
//!
//! Every measurement is a pure function of its input samples. Spectra share
//! one discipline: a window sized to the input, zero-padding to a power of
//! two, and a realfft transform through the injected [`FftProvider`].

use crate::config::AnalysisConfig;
use crate::metrics::{
    AliasingMetrics, ImdMetrics, LinearMetrics, NoiseMetrics, ResonanceMetrics,
    SelfOscillationMetrics, StepMetrics, ThdMetrics,
};
use crate::spectral::{
    argmax, bin_frequencies, freq_to_bin, gradient, hann_window, next_power_of_two, power_to_db,
    unwrap_phase, windowed_spectrum, FftProvider, RealFftProvider,
};
use crate::{linear_to_dbfs, Result, VerifyError};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;

/// Alias ratio reported when the tone band carries no energy (dB)
pub const ALIAS_FLOOR_DB: f64 = -120.0;

/// Magnitude and unwrapped phase of an impulse response
#[derive(Debug, Clone)]
pub struct FrequencyResponse {
    pub freqs: Vec<f64>,
    pub magnitude_db: Vec<f64>,
    pub phase_rad: Vec<f64>,
}

impl FrequencyResponse {
    /// Group delay in seconds, `-dφ/dω`
    pub fn group_delay(&self) -> Vec<f64> {
        group_delay(&self.phase_rad, &self.freqs)
    }
}

/// Time-frequency power grid
#[derive(Debug, Clone)]
pub struct Spectrogram {
    /// Segment centers (s)
    pub times: Vec<f64>,
    pub freqs: Vec<f64>,
    /// `frames[t][f]` in dB
    pub frames: Vec<Vec<f64>>,
}

impl Spectrogram {
    /// Time-averaged dB level of one frequency bin
    pub fn mean_db(&self, bin: usize) -> f64 {
        if self.frames.is_empty() {
            return f64::NEG_INFINITY;
        }
        self.frames.iter().map(|frame| frame[bin]).sum::<f64>() / self.frames.len() as f64
    }

    /// Highest dB level of one frequency bin over time
    pub fn max_db(&self, bin: usize) -> f64 {
        self.frames
            .iter()
            .map(|frame| frame[bin])
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Welch power spectral density
#[derive(Debug, Clone)]
pub struct PowerSpectrum {
    pub freqs: Vec<f64>,
    pub psd_db: Vec<f64>,
}

impl PowerSpectrum {
    /// Level at the bin nearest `freq`
    pub fn level_at(&self, freq: f64) -> f64 {
        let idx = self
            .freqs
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| (*a - freq).abs().total_cmp(&(*b - freq).abs()))
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.psd_db.get(idx).copied().unwrap_or(f64::NEG_INFINITY)
    }
}

/// Group delay (s) from unwrapped phase and bin frequencies
pub fn group_delay(phase_rad: &[f64], freqs: &[f64]) -> Vec<f64> {
    let omega: Vec<f64> = freqs.iter().map(|f| 2.0 * PI * f).collect();
    let d_phase = gradient(phase_rad);
    let d_omega = gradient(&omega);

    d_phase
        .iter()
        .zip(d_omega.iter())
        .map(|(&dp, &dw)| {
            let dw = if dw.abs() < 1e-10 { 1e-10 } else { dw };
            -dp / dw
        })
        .collect()
}

/// Root mean square level
pub fn rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64).sqrt()
}

/// Taper that is 1 at t = 0 and falls to 0 at the end (right half of a Hann window)
fn decay_window(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (n - 1) as f64;
            (0..n)
                .map(|k| 0.5 + 0.5 * (PI * k as f64 / denom).cos())
                .collect()
        }
    }
}

fn ensure_samples(samples: &[f64], what: &str) -> Result<()> {
    if samples.is_empty() {
        return Err(VerifyError::Analysis(format!("{}: empty signal", what)));
    }
    Ok(())
}

/// Index range of bins strictly inside (lo, hi)
fn band_bins(freqs: &[f64], lo: f64, hi: f64) -> impl Iterator<Item = usize> + '_ {
    freqs
        .iter()
        .enumerate()
        .filter(move |&(_, &f)| f > lo && f < hi)
        .map(|(i, _)| i)
}

/// Analysis engine
pub struct Analyzer {
    fft: Arc<dyn FftProvider>,
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(fft: Arc<dyn FftProvider>, config: AnalysisConfig) -> Self {
        Self { fft, config }
    }

    /// realfft provider with default tunables
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(RealFftProvider::new()), AnalysisConfig::default())
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Peak power within ±`peak_search_bins` of `bin`; 0 when `bin` is past Nyquist
    fn peak_power(&self, magnitude: &[f64], bin: usize) -> f64 {
        if bin >= magnitude.len() {
            return 0.0;
        }
        let lo = bin.saturating_sub(self.config.peak_search_bins);
        let hi = (bin + self.config.peak_search_bins + 1).min(magnitude.len());
        let peak = magnitude[lo..hi].iter().copied().fold(0.0, f64::max);
        peak * peak
    }

    /// Hann spectrum magnitudes scaled so a full-scale sine peaks at 1.0
    fn tone_spectrum(&self, samples: &[f64]) -> Result<(Vec<f64>, usize)> {
        let n_fft = next_power_of_two(samples.len());
        let spectrum = windowed_spectrum(self.fft.as_ref(), samples, n_fft)?;

        let window_sum: f64 = hann_window(samples.len()).iter().sum();
        let scale = if window_sum > 0.0 { 2.0 / window_sum } else { 1.0 };

        Ok((spectrum.iter().map(|c| c.norm() * scale).collect(), n_fft))
    }

    /// Frequency and phase response of an impulse response
    pub fn frequency_response(&self, samples: &[f64], sample_rate: u32) -> Result<FrequencyResponse> {
        ensure_samples(samples, "frequency response")?;

        let n_fft = next_power_of_two(samples.len() * 2);
        let window = decay_window(samples.len());
        let mut buffer = vec![0.0; n_fft];
        for (dst, (&x, &w)) in buffer.iter_mut().zip(samples.iter().zip(window.iter())) {
            *dst = x * w;
        }

        let spectrum = self.fft.forward(&buffer)?;
        let magnitude_db = spectrum.iter().map(|c| linear_to_dbfs(c.norm())).collect();
        let phase: Vec<f64> = spectrum.iter().map(|c| c.arg()).collect();

        Ok(FrequencyResponse {
            freqs: bin_frequencies(n_fft, sample_rate),
            magnitude_db,
            phase_rad: unwrap_phase(&phase),
        })
    }

    /// -3 dB point, passband ripple, stopband depth and group delay at cutoff
    pub fn linear_metrics(&self, samples: &[f64], sample_rate: u32) -> Result<LinearMetrics> {
        let response = self.frequency_response(samples, sample_rate)?;
        let mag = &response.magnitude_db;
        let n = mag.len();

        let target = mag[0] - 3.0;
        let cutoff_idx = mag
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| (*a - target).abs().total_cmp(&(*b - target).abs()))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let passband = &mag[..((n as f64 * 0.1) as usize).max(1)];
        let passband_ripple_db = passband.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            - passband.iter().copied().fold(f64::INFINITY, f64::min);

        let stopband = &mag[((n as f64 * 0.6) as usize).min(n - 1)..];
        let stopband_atten_db = -stopband.iter().copied().fold(f64::INFINITY, f64::min);

        let delay = response.group_delay();

        Ok(LinearMetrics {
            cutoff_measured_hz: response.freqs[cutoff_idx],
            passband_ripple_db,
            stopband_atten_db,
            group_delay_ms_at_cutoff: delay[cutoff_idx] * 1000.0,
        })
    }

    /// Total harmonic distortion of a steady tone at `fundamental_hz`
    pub fn thd(
        &self,
        samples: &[f64],
        sample_rate: u32,
        fundamental_hz: f64,
        input_level_dbfs: f64,
    ) -> Result<ThdMetrics> {
        ensure_samples(samples, "THD")?;
        let (magnitude, n_fft) = self.tone_spectrum(samples)?;

        let fundamental_bin = freq_to_bin(fundamental_hz, n_fft, sample_rate);
        if fundamental_hz <= 0.0 || fundamental_bin >= magnitude.len() - 1 {
            return Err(VerifyError::Analysis(format!(
                "fundamental {} Hz outside the analysable band",
                fundamental_hz
            )));
        }
        let fundamental_power = self.peak_power(&magnitude, fundamental_bin);

        let mut harmonic_power = 0.0;
        let mut harmonics_db = Vec::new();
        for k in 2..=self.config.num_harmonics {
            let bin = (fundamental_hz * k as f64 * n_fft as f64 / sample_rate as f64).round() as usize;
            if bin >= magnitude.len() {
                break;
            }
            let power = self.peak_power(&magnitude, bin);
            harmonic_power += power;
            harmonics_db.push(linear_to_dbfs(power.sqrt()));
        }
        harmonics_db.truncate(self.config.reported_harmonics);

        let thd_percent = if fundamental_power > 0.0 {
            (harmonic_power / fundamental_power).sqrt() * 100.0
        } else {
            0.0
        };

        Ok(ThdMetrics {
            input_level_dbfs,
            thd_percent,
            fundamental_dbfs: linear_to_dbfs(fundamental_power.sqrt()),
            harmonics_db,
        })
    }

    /// Second and third order intermodulation of a two-tone signal
    pub fn imd(&self, samples: &[f64], sample_rate: u32, f1: f64, f2: f64) -> Result<ImdMetrics> {
        ensure_samples(samples, "IMD")?;
        let (magnitude, n_fft) = self.tone_spectrum(samples)?;
        let nyquist = sample_rate as f64 / 2.0;

        let power_at = |freq: f64| {
            let bin = (freq * n_fft as f64 / sample_rate as f64).round() as usize;
            self.peak_power(&magnitude, bin)
        };

        let fundamental_power = power_at(f1) + power_at(f2);

        let products = [
            ("f2-f1", (f2 - f1).abs()),
            ("f1+f2", f1 + f2),
            ("2f1-f2", (2.0 * f1 - f2).abs()),
            ("2f2-f1", (2.0 * f2 - f1).abs()),
            ("2f1+f2", 2.0 * f1 + f2),
            ("2f2+f1", 2.0 * f2 + f1),
        ];

        let mut sidebands = BTreeMap::new();
        let mut imd_power = 0.0;
        for (name, freq) in products {
            if freq < nyquist {
                let power = power_at(freq);
                imd_power += power;
                sidebands.insert(name.to_string(), linear_to_dbfs(power.sqrt()));
            }
        }

        let imd_db = if fundamental_power > 0.0 {
            linear_to_dbfs((imd_power / fundamental_power).sqrt())
        } else {
            self.config.imd_floor_db
        };

        Ok(ImdMetrics { imd_db, sidebands })
    }

    /// STFT power grid, 50% overlap, per-segment mean removal
    pub fn spectrogram(&self, samples: &[f64], sample_rate: u32) -> Result<Spectrogram> {
        ensure_samples(samples, "spectrogram")?;

        let nperseg = self.config.spectrogram_segment.min(samples.len());
        let window = hann_window(nperseg);
        let window_sum: f64 = window.iter().sum();
        if window_sum <= 0.0 {
            return Err(VerifyError::Analysis(format!(
                "spectrogram: {} samples is too short to window",
                samples.len()
            )));
        }
        let scale = 1.0 / (window_sum * window_sum);

        let step = nperseg - nperseg / 2;
        let num_segments = (samples.len() - nperseg) / step + 1;
        let freqs = bin_frequencies(nperseg, sample_rate);

        let mut times = Vec::with_capacity(num_segments);
        let mut frames = Vec::with_capacity(num_segments);
        for seg in 0..num_segments {
            let start = seg * step;
            let power = self.segment_power(&samples[start..start + nperseg], &window, scale)?;
            frames.push(power.into_iter().map(power_to_db).collect());
            times.push((start as f64 + nperseg as f64 / 2.0) / sample_rate as f64);
        }

        Ok(Spectrogram { times, freqs, frames })
    }

    /// One-sided scaled power of a detrended, windowed segment
    fn segment_power(&self, segment: &[f64], window: &[f64], scale: f64) -> Result<Vec<f64>> {
        let mean = segment.iter().sum::<f64>() / segment.len() as f64;
        let buffer: Vec<f64> = segment
            .iter()
            .zip(window.iter())
            .map(|(&x, &w)| (x - mean) * w)
            .collect();

        let spectrum = self.fft.forward(&buffer)?;
        let last = spectrum.len() - 1;
        let has_nyquist = segment.len() % 2 == 0;

        Ok(spectrum
            .iter()
            .enumerate()
            .map(|(k, c)| {
                let p = c.norm_sqr() * scale;
                if k == 0 || (k == last && has_nyquist) {
                    p
                } else {
                    2.0 * p
                }
            })
            .collect())
    }

    /// Strongest time-averaged bin within (0.5·cutoff, 1.5·cutoff)
    pub fn resonance_peak(
        &self,
        samples: &[f64],
        sample_rate: u32,
        cutoff_hz: f64,
    ) -> Result<ResonanceMetrics> {
        let spec = self.spectrogram(samples, sample_rate)?;
        let band: Vec<usize> = band_bins(&spec.freqs, cutoff_hz * 0.5, cutoff_hz * 1.5).collect();

        let (peak_freq_hz, peak_amplitude_db) = if band.is_empty() {
            (cutoff_hz, -80.0)
        } else {
            let means: Vec<f64> = band.iter().map(|&b| spec.mean_db(b)).collect();
            let peak = argmax(&means).map(|i| band[i]).unwrap_or(band[0]);
            let amplitude = band
                .iter()
                .map(|&b| spec.max_db(b))
                .fold(f64::NEG_INFINITY, f64::max);
            (spec.freqs[peak], amplitude)
        };

        Ok(ResonanceMetrics {
            peak_freq_hz,
            peak_amplitude_db,
            freq_error_percent: (peak_freq_hz - cutoff_hz).abs() / cutoff_hz * 100.0,
        })
    }

    /// Overshoot, settling time and DC gain of a step response
    pub fn step_metrics(&self, samples: &[f64], sample_rate: u32) -> Result<StepMetrics> {
        ensure_samples(samples, "step response")?;

        let n = samples.len();
        let steady_start =
            ((n as f64 * (1.0 - self.config.steady_state_fraction)) as usize).min(n - 1);
        let tail = &samples[steady_start..];
        let dc_gain = tail.iter().sum::<f64>() / tail.len() as f64;

        if dc_gain.abs() < 1e-10 {
            return Ok(StepMetrics::zero());
        }

        let peak = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let overshoot_pct = if dc_gain > 0.0 {
            ((peak - dc_gain) / dc_gain * 100.0).max(0.0)
        } else {
            0.0
        };

        let tolerance = dc_gain.abs() * self.config.settling_tolerance;
        let settling_time_ms = samples
            .iter()
            .rposition(|&x| (x - dc_gain).abs() >= tolerance)
            .map(|i| (i + 1) as f64 / sample_rate as f64 * 1000.0)
            .unwrap_or(0.0);

        Ok(StepMetrics {
            overshoot_pct,
            settling_time_ms,
            dc_gain,
        })
    }

    /// RMS level and dominant frequency of the output of a silent input
    pub fn self_oscillation(&self, samples: &[f64], sample_rate: u32) -> Result<SelfOscillationMetrics> {
        ensure_samples(samples, "self-oscillation")?;

        let rms_dbfs = linear_to_dbfs(rms(samples));
        let oscillating = rms_dbfs > self.config.oscillation_threshold_dbfs;

        let dominant_freq_hz = if oscillating {
            let (magnitude, n_fft) = self.tone_spectrum(samples)?;
            let freqs = bin_frequencies(n_fft, sample_rate);
            argmax(&magnitude).map(|i| freqs[i]).unwrap_or(0.0)
        } else {
            0.0
        };

        Ok(SelfOscillationMetrics {
            oscillating,
            dominant_freq_hz,
            rms_dbfs,
        })
    }

    /// Welch PSD, density scaling, in dB
    pub fn psd(&self, samples: &[f64], sample_rate: u32) -> Result<PowerSpectrum> {
        ensure_samples(samples, "PSD")?;

        let nperseg = self.config.psd_segment.min(samples.len());
        let window = hann_window(nperseg);
        let energy: f64 = window.iter().map(|w| w * w).sum();
        if energy <= 0.0 {
            return Err(VerifyError::Analysis(format!(
                "PSD: {} samples is too short to window",
                samples.len()
            )));
        }
        let scale = 1.0 / (sample_rate as f64 * energy);

        let step = nperseg - nperseg / 2;
        let num_segments = (samples.len() - nperseg) / step + 1;

        let mut accum = vec![0.0; nperseg / 2 + 1];
        for seg in 0..num_segments {
            let start = seg * step;
            let power = self.segment_power(&samples[start..start + nperseg], &window, scale)?;
            for (acc, p) in accum.iter_mut().zip(power) {
                *acc += p;
            }
        }

        Ok(PowerSpectrum {
            freqs: bin_frequencies(nperseg, sample_rate),
            psd_db: accum
                .into_iter()
                .map(|p| power_to_db(p / num_segments as f64))
                .collect(),
        })
    }

    /// Output PSD around cutoff and attenuation relative to the input at 4x cutoff
    pub fn noise_metrics(
        &self,
        output: &PowerSpectrum,
        input: &PowerSpectrum,
        cutoff_hz: f64,
    ) -> NoiseMetrics {
        let psd_at_4x_cutoff_db = output.level_at(cutoff_hz * 4.0);
        NoiseMetrics {
            psd_at_cutoff_db: output.level_at(cutoff_hz),
            psd_at_4x_cutoff_db,
            stopband_atten_db: input.level_at(cutoff_hz * 4.0) - psd_at_4x_cutoff_db,
        }
    }

    /// Energy below the tone (alias band) relative to energy around it, in dB
    pub fn alias_ratio(&self, samples: &[f64], sample_rate: u32, test_freq_hz: f64) -> Result<f64> {
        ensure_samples(samples, "aliasing")?;
        let (magnitude, n_fft) = self.tone_spectrum(samples)?;
        let freqs = bin_frequencies(n_fft, sample_rate);

        let energy = |lo: f64, hi: f64| -> f64 {
            band_bins(&freqs, lo, hi).map(|i| magnitude[i] * magnitude[i]).sum()
        };

        let main = energy(test_freq_hz * 0.9, test_freq_hz * 1.1);
        let alias = energy(self.config.alias_band_floor_hz, test_freq_hz * 0.5);

        Ok(if main > 0.0 {
            power_to_db(alias / main)
        } else {
            ALIAS_FLOOR_DB
        })
    }

    /// Alias ratio of the output, of the input, and their difference
    pub fn aliasing(
        &self,
        output: &[f64],
        input: &[f64],
        sample_rate: u32,
        test_freq_hz: f64,
    ) -> Result<AliasingMetrics> {
        let alias_ratio_db = self.alias_ratio(output, sample_rate, test_freq_hz)?;
        let input_alias_ratio_db = self.alias_ratio(input, sample_rate, test_freq_hz)?;
        Ok(AliasingMetrics {
            test_freq_hz,
            alias_ratio_db,
            input_alias_ratio_db,
            alias_increase_db: alias_ratio_db - input_alias_ratio_db,
        })
    }
}
