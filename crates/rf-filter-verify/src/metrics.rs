//! Result schema: test categories and per-category metrics

use crate::VerifyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The eight verification categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TestCategory {
    #[serde(rename = "linear_response", alias = "linear")]
    LinearResponse,
    #[serde(rename = "resonance")]
    Resonance,
    #[serde(rename = "selfoscillation")]
    SelfOscillation,
    #[serde(rename = "thd")]
    Thd,
    #[serde(rename = "imd")]
    Imd,
    #[serde(rename = "aliasing")]
    Aliasing,
    #[serde(rename = "step")]
    Step,
    #[serde(rename = "noise")]
    Noise,
}

impl TestCategory {
    /// All categories in execution order
    pub const ALL: [TestCategory; 8] = [
        TestCategory::LinearResponse,
        TestCategory::Resonance,
        TestCategory::SelfOscillation,
        TestCategory::Thd,
        TestCategory::Imd,
        TestCategory::Aliasing,
        TestCategory::Step,
        TestCategory::Noise,
    ];

    /// Serialized name, also the metrics file stem and top-level test directory
    pub fn as_str(&self) -> &'static str {
        match self {
            TestCategory::LinearResponse => "linear_response",
            TestCategory::Resonance => "resonance",
            TestCategory::SelfOscillation => "selfoscillation",
            TestCategory::Thd => "thd",
            TestCategory::Imd => "imd",
            TestCategory::Aliasing => "aliasing",
            TestCategory::Step => "step",
            TestCategory::Noise => "noise",
        }
    }
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestCategory {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" | "linear_response" => Ok(TestCategory::LinearResponse),
            "resonance" => Ok(TestCategory::Resonance),
            "selfoscillation" => Ok(TestCategory::SelfOscillation),
            "thd" => Ok(TestCategory::Thd),
            "imd" => Ok(TestCategory::Imd),
            "aliasing" => Ok(TestCategory::Aliasing),
            "step" => Ok(TestCategory::Step),
            "noise" => Ok(TestCategory::Noise),
            other => Err(VerifyError::Config(format!("unknown test category '{}'", other))),
        }
    }
}

/// Impulse-response derived metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinearMetrics {
    /// Frequency closest to the DC level minus 3 dB
    pub cutoff_measured_hz: f64,

    /// Max - min magnitude over the lowest 10% of bins (dB)
    pub passband_ripple_db: f64,

    /// Negated minimum magnitude over the upper 40% of bins (dB)
    pub stopband_atten_db: f64,

    /// Group delay at the measured cutoff (ms)
    pub group_delay_ms_at_cutoff: f64,
}

/// Chirp spectrogram peak near cutoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResonanceMetrics {
    pub peak_freq_hz: f64,
    pub peak_amplitude_db: f64,
    pub freq_error_percent: f64,
}

/// Output of a filter fed with silence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelfOscillationMetrics {
    pub oscillating: bool,

    /// 0 when not oscillating
    pub dominant_freq_hz: f64,

    pub rms_dbfs: f64,
}

/// Harmonic distortion of a steady sine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThdMetrics {
    pub input_level_dbfs: f64,
    pub thd_percent: f64,
    pub fundamental_dbfs: f64,

    /// Levels of harmonics 2, 3, ... (dBFS)
    pub harmonics_db: Vec<f64>,
}

/// Two-tone intermodulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImdMetrics {
    pub imd_db: f64,

    /// Product name (e.g. `2f1-f2`) to level in dBFS
    pub sidebands: BTreeMap<String, f64>,
}

/// Energy folded below a high test tone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasingMetrics {
    pub test_freq_hz: f64,

    /// Alias band over tone band, filter output (dB)
    pub alias_ratio_db: f64,

    /// Same ratio for the unfiltered input (dB)
    pub input_alias_ratio_db: f64,

    /// `alias_ratio_db - input_alias_ratio_db`
    pub alias_increase_db: f64,
}

/// Unit step response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepMetrics {
    pub overshoot_pct: f64,
    pub settling_time_ms: f64,
    pub dc_gain: f64,
}

impl StepMetrics {
    pub fn zero() -> Self {
        Self {
            overshoot_pct: 0.0,
            settling_time_ms: 0.0,
            dc_gain: 0.0,
        }
    }
}

/// Welch PSD of filtered white noise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoiseMetrics {
    pub psd_at_cutoff_db: f64,
    pub psd_at_4x_cutoff_db: f64,

    /// Input PSD minus output PSD at 4x cutoff (dB)
    pub stopband_atten_db: f64,
}

/// Metrics payload, one variant per category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CategoryMetrics {
    Linear(LinearMetrics),
    Resonance(ResonanceMetrics),
    SelfOscillation(SelfOscillationMetrics),
    Thd(ThdMetrics),
    Imd(ImdMetrics),
    Aliasing(AliasingMetrics),
    Step(StepMetrics),
    Noise(NoiseMetrics),
}

impl CategoryMetrics {
    /// Category this payload belongs to
    pub fn category(&self) -> TestCategory {
        match self {
            CategoryMetrics::Linear(_) => TestCategory::LinearResponse,
            CategoryMetrics::Resonance(_) => TestCategory::Resonance,
            CategoryMetrics::SelfOscillation(_) => TestCategory::SelfOscillation,
            CategoryMetrics::Thd(_) => TestCategory::Thd,
            CategoryMetrics::Imd(_) => TestCategory::Imd,
            CategoryMetrics::Aliasing(_) => TestCategory::Aliasing,
            CategoryMetrics::Step(_) => TestCategory::Step,
            CategoryMetrics::Noise(_) => TestCategory::Noise,
        }
    }
}

/// One analyzed (filter, parameter tuple) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAnalysisResult")]
pub struct AnalysisResult {
    pub filter_name: String,
    test_case: TestCategory,
    pub cutoff_hz: f64,
    pub resonance: f64,
    pub oversample: u32,
    metrics: CategoryMetrics,
    pub plots_generated: Vec<String>,
}

impl AnalysisResult {
    pub fn new(
        filter_name: impl Into<String>,
        cutoff_hz: f64,
        resonance: f64,
        oversample: u32,
        metrics: CategoryMetrics,
    ) -> Self {
        Self {
            filter_name: filter_name.into(),
            test_case: metrics.category(),
            cutoff_hz,
            resonance,
            oversample,
            metrics,
            plots_generated: Vec::new(),
        }
    }

    /// Attach plot artifact references
    pub fn with_plots(mut self, plots: Vec<String>) -> Self {
        self.plots_generated = plots;
        self
    }

    pub fn test_case(&self) -> TestCategory {
        self.test_case
    }

    pub fn metrics(&self) -> &CategoryMetrics {
        &self.metrics
    }
}

#[derive(Deserialize)]
struct RawAnalysisResult {
    filter_name: String,
    test_case: TestCategory,
    cutoff_hz: f64,
    resonance: f64,
    oversample: u32,
    metrics: CategoryMetrics,
    #[serde(default)]
    plots_generated: Vec<String>,
}

impl TryFrom<RawAnalysisResult> for AnalysisResult {
    type Error = String;

    fn try_from(raw: RawAnalysisResult) -> Result<Self, Self::Error> {
        if raw.metrics.category() != raw.test_case {
            return Err(format!(
                "test_case '{}' does not match {} metrics",
                raw.test_case,
                raw.metrics.category()
            ));
        }
        Ok(AnalysisResult::new(
            raw.filter_name,
            raw.cutoff_hz,
            raw.resonance,
            raw.oversample,
            raw.metrics,
        )
        .with_plots(raw.plots_generated))
    }
}
