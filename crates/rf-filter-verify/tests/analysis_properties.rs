//! Analysis Engine property tests
//!
//! Known filters and synthetic responses with analytically predictable metrics.

use approx::assert_relative_eq;
use rf_filter_verify::metrics::TestCategory;
use rf_filter_verify::{Analyzer, HoundCodec, TestSignal, WaveformCodec};
use std::f64::consts::PI;

const SAMPLE_RATE: u32 = 44100;

/// One-pole lowpass with its -3 dB point at `cutoff_hz`
fn one_pole(input: &[f64], cutoff_hz: f64) -> Vec<f64> {
    let a = 1.0 - (-2.0 * PI * cutoff_hz / SAMPLE_RATE as f64).exp();
    let mut state = 0.0;
    input
        .iter()
        .map(|&x| {
            state += a * (x - state);
            state
        })
        .collect()
}

/// Underdamped second-order step response
fn ringing_step(len: usize, gain: f64) -> Vec<f64> {
    (0..len)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE as f64;
            gain * (1.0 - (-t / 0.002).exp() * (2.0 * PI * 500.0 * t).cos())
        })
        .collect()
}

#[test]
fn test_one_pole_cutoff_is_measured() {
    let analyzer = Analyzer::with_defaults();
    let impulse = TestSignal::impulse(SAMPLE_RATE, 32768, 1.0).unwrap();

    for cutoff in [200.0, 1000.0, 5000.0] {
        let response = one_pole(&impulse.to_f64(), cutoff);
        let metrics = analyzer.linear_metrics(&response, SAMPLE_RATE).unwrap();
        let error = (metrics.cutoff_measured_hz - cutoff).abs() / cutoff;
        assert!(error < 0.1, "cutoff {} measured {}", cutoff, metrics.cutoff_measured_hz);
        assert!(metrics.group_delay_ms_at_cutoff > 0.0);
        assert!(metrics.stopband_atten_db > 0.0);
    }
}

#[test]
fn test_step_metrics_scale_invariance() {
    let analyzer = Analyzer::with_defaults();
    let unit = analyzer.step_metrics(&ringing_step(32768, 1.0), SAMPLE_RATE).unwrap();
    let doubled = analyzer.step_metrics(&ringing_step(32768, 2.0), SAMPLE_RATE).unwrap();

    assert!(unit.overshoot_pct > 1.0);
    assert_relative_eq!(doubled.overshoot_pct, unit.overshoot_pct, epsilon = 1e-9);
    assert_relative_eq!(doubled.settling_time_ms, unit.settling_time_ms, epsilon = 1e-9);
    assert_relative_eq!(doubled.dc_gain, 2.0 * unit.dc_gain, epsilon = 1e-9);
}

#[test]
fn test_lowpassed_noise_is_attenuated_above_cutoff() {
    let analyzer = Analyzer::with_defaults();
    let noise = TestSignal::white_noise(SAMPLE_RATE, 5.0, -18.0, 42).unwrap().to_f64();
    let filtered = one_pole(&noise, 1000.0);

    let input_psd = analyzer.psd(&noise, SAMPLE_RATE).unwrap();
    let output_psd = analyzer.psd(&filtered, SAMPLE_RATE).unwrap();
    let metrics = analyzer.noise_metrics(&output_psd, &input_psd, 1000.0);

    // A one-pole rolls off 6 dB/octave: about 12 dB two octaves up
    assert!(metrics.stopband_atten_db > 9.0 && metrics.stopband_atten_db < 15.0);
    assert!(metrics.psd_at_cutoff_db > metrics.psd_at_4x_cutoff_db);
}

#[test]
fn test_saved_signal_reads_back_within_quantization() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let codec = HoundCodec::new();
    let mut chirp = TestSignal::chirp(SAMPLE_RATE, 0.5, 20.0, None, -6.0)?;

    let path = chirp.save(dir.path(), &codec)?;
    assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("chirp_20-19845_44100.wav"));

    let waveform = codec.read(&path)?;
    assert_eq!(waveform.sample_rate, SAMPLE_RATE);
    assert_eq!(waveform.samples.len(), chirp.samples.len());
    for (a, b) in waveform.samples.iter().zip(chirp.samples.iter()) {
        assert!((a - b).abs() <= 1.0 / 32767.0);
    }
    Ok(())
}

#[test]
fn test_category_names_parse() {
    for category in TestCategory::ALL {
        assert_eq!(category.as_str().parse::<TestCategory>().unwrap(), category);
    }
}
