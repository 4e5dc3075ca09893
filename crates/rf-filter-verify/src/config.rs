//! Configuration for verification runs

use crate::metrics::TestCategory;
use crate::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default sample rate for generated test signals
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Filter variants emitted by the reference filter-under-test executable
pub const DEFAULT_FILTERS: &[&str] = &[
    "Stilson",
    "Simplified",
    "Huovilainen",
    "Improved",
    "Krajeski",
    "RKSimulation",
    "Microtracker",
    "MusicDSP",
    "OberheimVariation",
    "Hyperion",
];

/// Default cutoff sweep (Hz)
pub const DEFAULT_CUTOFFS: &[f64] = &[50.0, 200.0, 800.0, 1000.0, 2500.0, 5000.0, 12000.0];

/// Default oversampling factors (0 = no oversampling)
pub const DEFAULT_OVERSAMPLES: &[u32] = &[0, 4];

/// Top-level configuration of a verification run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Root directory; each run creates `<output_root>/<run_id>/`
    pub output_root: PathBuf,

    /// Sample rate of generated signals (Hz)
    pub sample_rate: u32,

    /// Categories to run, in execution order
    pub tests: Vec<TestCategory>,

    /// Allow-list of filter variants to analyze
    pub filters: Vec<String>,

    /// Variants the filter-under-test is known to emit (empty = accept any name)
    pub known_filters: Vec<String>,

    /// Reuse outputs already present on disk instead of invoking the filter
    pub skip_existing: bool,

    /// Run the parameter tuples of a category on the rayon pool
    pub parallel: bool,

    /// Fixed run id (resume into an existing run directory); timestamp when unset
    pub run_id: Option<String>,

    /// Kill the filter process after this many seconds
    pub process_timeout_secs: Option<f64>,

    /// Parameter grids
    pub matrix: MatrixConfig,

    /// Analysis tunables
    pub analysis: AnalysisConfig,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("filter_validation"),
            sample_rate: DEFAULT_SAMPLE_RATE,
            tests: TestCategory::ALL.to_vec(),
            filters: DEFAULT_FILTERS.iter().map(|s| s.to_string()).collect(),
            known_filters: DEFAULT_FILTERS.iter().map(|s| s.to_string()).collect(),
            skip_existing: false,
            parallel: false,
            run_id: None,
            process_timeout_secs: None,
            matrix: MatrixConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl VerifyConfig {
    /// Small grid for smoke runs: one cutoff, no oversampling
    pub fn quick() -> Self {
        Self {
            matrix: MatrixConfig {
                cutoffs: vec![1000.0],
                oversamples: vec![0],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| VerifyError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(config)
    }

    /// Save the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(VerifyError::Config("sample rate must be positive".into()));
        }

        if !self.known_filters.is_empty() {
            let unknown: Vec<&str> = self
                .filters
                .iter()
                .filter(|f| !self.known_filters.contains(f))
                .map(|f| f.as_str())
                .collect();
            if !unknown.is_empty() {
                return Err(VerifyError::Config(format!(
                    "unknown filters: {}",
                    unknown.join(", ")
                )));
            }
        }

        if let Some(timeout) = self.process_timeout_secs {
            if !(timeout > 0.0) {
                return Err(VerifyError::Config(format!(
                    "process timeout must be positive, got {}",
                    timeout
                )));
            }
        }

        self.matrix.validate()?;
        self.analysis.validate()
    }

    /// Builder pattern: set output root
    pub fn with_output_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.output_root = root.into();
        self
    }

    /// Builder pattern: set sample rate
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Builder pattern: set categories to run
    pub fn with_tests(mut self, tests: &[TestCategory]) -> Self {
        self.tests = tests.to_vec();
        self
    }

    /// Builder pattern: set the filter allow-list
    pub fn with_filters<S: AsRef<str>>(mut self, filters: &[S]) -> Self {
        self.filters = filters.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    /// Builder pattern: set the known filter variants
    pub fn with_known_filters<S: AsRef<str>>(mut self, filters: &[S]) -> Self {
        self.known_filters = filters.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    /// Builder pattern: enable skip-existing
    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    /// Builder pattern: enable parallel tuple execution
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Builder pattern: pin the run id
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Builder pattern: set the filter process timeout
    pub fn with_process_timeout(mut self, secs: f64) -> Self {
        self.process_timeout_secs = Some(secs);
        self
    }

    /// Builder pattern: set cutoff sweep
    pub fn with_cutoffs(mut self, cutoffs: &[f64]) -> Self {
        self.matrix.cutoffs = cutoffs.to_vec();
        self
    }

    /// Builder pattern: set oversampling factors
    pub fn with_oversamples(mut self, oversamples: &[u32]) -> Self {
        self.matrix.oversamples = oversamples.to_vec();
        self
    }
}

/// Parameter grids for the eight test categories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Cutoff sweep shared by linear, resonance and self-oscillation tests (Hz)
    pub cutoffs: Vec<f64>,

    /// Oversampling factors swept by linear and aliasing tests
    pub oversamples: Vec<u32>,

    pub linear: LinearPlan,
    pub resonance: ResonancePlan,
    pub self_oscillation: SelfOscillationPlan,
    pub thd: ThdPlan,
    pub imd: ImdPlan,
    pub aliasing: AliasingPlan,
    pub step: StepPlan,
    pub noise: NoisePlan,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            cutoffs: DEFAULT_CUTOFFS.to_vec(),
            oversamples: DEFAULT_OVERSAMPLES.to_vec(),
            linear: LinearPlan::default(),
            resonance: ResonancePlan::default(),
            self_oscillation: SelfOscillationPlan::default(),
            thd: ThdPlan::default(),
            imd: ImdPlan::default(),
            aliasing: AliasingPlan::default(),
            step: StepPlan::default(),
            noise: NoisePlan::default(),
        }
    }
}

impl MatrixConfig {
    /// Check grid values against the filter-under-test contract
    pub fn validate(&self) -> Result<()> {
        if let Some(c) = self.cutoffs.iter().find(|c| !(**c > 0.0)) {
            return Err(VerifyError::Config(format!("cutoff must be positive, got {}", c)));
        }

        if let Some(os) = self
            .oversamples
            .iter()
            .find(|&&os| os != 0 && !(os.is_power_of_two() && os >= 2))
        {
            return Err(VerifyError::Config(format!(
                "oversample factor must be 0 or a power of two >= 2, got {}",
                os
            )));
        }

        let resonances = [self.resonance.resonance, self.self_oscillation.resonance, self.aliasing.resonance]
            .into_iter()
            .chain(self.step.resonances.iter().copied())
            .chain(self.noise.resonances.iter().copied());
        for r in resonances {
            if !(0.0..=1.0).contains(&r) {
                return Err(VerifyError::Config(format!(
                    "resonance must be within [0, 1], got {}",
                    r
                )));
            }
        }

        let fixed_cutoffs = [
            self.thd.cutoff_hz,
            self.imd.cutoff_hz,
            self.aliasing.cutoff_hz,
            self.step.cutoff_hz,
            self.noise.cutoff_hz,
        ];
        if let Some(c) = fixed_cutoffs.iter().find(|c| !(**c > 0.0)) {
            return Err(VerifyError::Config(format!("cutoff must be positive, got {}", c)));
        }

        if self.linear.impulse_length == 0 || self.step.length == 0 {
            return Err(VerifyError::Config("signal length must be positive".into()));
        }

        Ok(())
    }

    /// Cutoffs of the sweep that also appear in `subset`, in sweep order
    pub fn restricted_cutoffs(&self, subset: &[f64]) -> Vec<f64> {
        self.cutoffs
            .iter()
            .copied()
            .filter(|c| subset.iter().any(|s| (s - c).abs() < 1e-9))
            .collect()
    }
}

/// Linear response: impulse input, cutoff × oversample sweep, resonance 0
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearPlan {
    pub impulse_length: usize,
}

impl Default for LinearPlan {
    fn default() -> Self {
        Self { impulse_length: 32768 }
    }
}

/// Resonance peak tracking: chirp input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResonancePlan {
    /// Cutoffs tested, intersected with the main sweep
    pub cutoffs: Vec<f64>,
    pub resonance: f64,
    pub chirp_duration_sec: f64,
    pub chirp_level_dbfs: f64,
}

impl Default for ResonancePlan {
    fn default() -> Self {
        Self {
            cutoffs: vec![200.0, 1000.0, 5000.0],
            resonance: 0.9,
            chirp_duration_sec: 5.0,
            chirp_level_dbfs: -12.0,
        }
    }
}

/// Self-oscillation: silence input at maximum resonance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfOscillationPlan {
    /// Cutoffs tested, intersected with the main sweep
    pub cutoffs: Vec<f64>,
    pub resonance: f64,
    pub silence_duration_sec: f64,
}

impl Default for SelfOscillationPlan {
    fn default() -> Self {
        Self {
            cutoffs: vec![200.0, 1000.0, 5000.0],
            resonance: 1.0,
            silence_duration_sec: 2.0,
        }
    }
}

/// THD: steady sine swept over input level
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThdPlan {
    /// Kept above the test tone
    pub cutoff_hz: f64,
    pub test_freq_hz: f64,
    pub levels_dbfs: Vec<f64>,
    pub duration_sec: f64,
}

impl Default for ThdPlan {
    fn default() -> Self {
        Self {
            cutoff_hz: 5000.0,
            test_freq_hz: 1000.0,
            levels_dbfs: vec![-18.0, -12.0, -6.0],
            duration_sec: 1.0,
        }
    }
}

/// IMD: single two-tone configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImdPlan {
    pub cutoff_hz: f64,
    pub f1_hz: f64,
    pub f2_hz: f64,
    pub level_dbfs: f64,
    pub duration_sec: f64,
}

impl Default for ImdPlan {
    fn default() -> Self {
        Self {
            cutoff_hz: 2500.0,
            f1_hz: 1000.0,
            f2_hz: 1200.0,
            level_dbfs: -12.0,
            duration_sec: 1.0,
        }
    }
}

/// Aliasing: high tones near/above cutoff, with and without oversampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AliasingPlan {
    pub cutoff_hz: f64,
    pub resonance: f64,
    pub test_freqs_hz: Vec<f64>,
    /// Factors tested, intersected with the main oversample sweep
    pub oversamples: Vec<u32>,
    pub level_dbfs: f64,
    pub duration_sec: f64,
}

impl Default for AliasingPlan {
    fn default() -> Self {
        Self {
            cutoff_hz: 15000.0,
            resonance: 0.9,
            test_freqs_hz: vec![10000.0, 15000.0],
            oversamples: vec![0, 4],
            level_dbfs: -6.0,
            duration_sec: 1.0,
        }
    }
}

/// Step response: DC step swept over resonance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepPlan {
    pub cutoff_hz: f64,
    pub resonances: Vec<f64>,
    pub length: usize,
}

impl Default for StepPlan {
    fn default() -> Self {
        Self {
            cutoff_hz: 1000.0,
            resonances: vec![0.0, 0.5, 0.9],
            length: 32768,
        }
    }
}

/// Noise shaping: white noise swept over resonance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoisePlan {
    pub cutoff_hz: f64,
    pub resonances: Vec<f64>,
    pub duration_sec: f64,
    pub rms_dbfs: f64,
    pub seed: u64,
}

impl Default for NoisePlan {
    fn default() -> Self {
        Self {
            cutoff_hz: 1000.0,
            resonances: vec![0.0, 0.9],
            duration_sec: 5.0,
            rms_dbfs: -18.0,
            seed: 42,
        }
    }
}

/// Search windows, thresholds and segment sizes used by the analysis engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Half-width of the peak search around an expected bin
    pub peak_search_bins: usize,

    /// Highest harmonic included in THD
    pub num_harmonics: usize,

    /// Harmonics reported in THD metrics
    pub reported_harmonics: usize,

    /// RMS above this level counts as self-oscillation (dBFS)
    pub oscillation_threshold_dbfs: f64,

    /// Settling band as a fraction of DC gain
    pub settling_tolerance: f64,

    /// Tail fraction averaged for the steady-state value
    pub steady_state_fraction: f64,

    /// STFT segment length for resonance tracking
    pub spectrogram_segment: usize,

    /// Welch segment length for PSD
    pub psd_segment: usize,

    /// IMD reported when the fundamentals carry no power (dB)
    pub imd_floor_db: f64,

    /// Lower edge of the alias band, excludes DC (Hz)
    pub alias_band_floor_hz: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            peak_search_bins: 2,
            num_harmonics: 10,
            reported_harmonics: 5,
            oscillation_threshold_dbfs: -60.0,
            settling_tolerance: 0.02,
            steady_state_fraction: 0.1,
            spectrogram_segment: 2048,
            psd_segment: 4096,
            imd_floor_db: -120.0,
            alias_band_floor_hz: 100.0,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_harmonics < 2 {
            return Err(VerifyError::Config("num_harmonics must be at least 2".into()));
        }
        if self.spectrogram_segment < 2 || self.psd_segment < 2 {
            return Err(VerifyError::Config("segment lengths must be at least 2".into()));
        }
        if !(self.settling_tolerance > 0.0) {
            return Err(VerifyError::Config("settling tolerance must be positive".into()));
        }
        if !(self.steady_state_fraction > 0.0 && self.steady_state_fraction <= 1.0) {
            return Err(VerifyError::Config(
                "steady-state fraction must be within (0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Builder pattern: set the peak search half-width
    pub fn with_peak_search_bins(mut self, bins: usize) -> Self {
        self.peak_search_bins = bins;
        self
    }

    /// Builder pattern: set the self-oscillation threshold
    pub fn with_oscillation_threshold(mut self, dbfs: f64) -> Self {
        self.oscillation_threshold_dbfs = dbfs;
        self
    }

    /// Builder pattern: set the settling band
    pub fn with_settling_tolerance(mut self, tolerance: f64) -> Self {
        self.settling_tolerance = tolerance;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VerifyConfig::default();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.tests.len(), 8);
        assert_eq!(config.filters.len(), 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = VerifyConfig::default()
            .with_tests(&[TestCategory::Thd])
            .with_filters(&["Stilson"])
            .with_cutoffs(&[1000.0])
            .with_oversamples(&[0, 2])
            .with_skip_existing(true)
            .with_run_id("fixed");

        assert_eq!(config.tests, vec![TestCategory::Thd]);
        assert_eq!(config.filters, vec!["Stilson".to_string()]);
        assert_eq!(config.matrix.oversamples, vec![0, 2]);
        assert!(config.skip_existing);
        assert_eq!(config.run_id.as_deref(), Some("fixed"));
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let config = VerifyConfig::default().with_filters(&["Stilson", "Nope"]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Nope"));
    }

    #[test]
    fn test_any_filter_when_known_list_empty() {
        let config = VerifyConfig::default()
            .with_known_filters::<&str>(&[])
            .with_filters(&["Bypass"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_oversample_rejected() {
        let config = VerifyConfig::default().with_oversamples(&[0, 3]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_restricted_cutoffs_keep_sweep_order() {
        let matrix = MatrixConfig::default();
        let restricted = matrix.restricted_cutoffs(&[5000.0, 200.0, 1000.0]);
        assert_eq!(restricted, vec![200.0, 1000.0, 5000.0]);

        let narrow = MatrixConfig {
            cutoffs: vec![1000.0],
            ..Default::default()
        };
        assert_eq!(narrow.restricted_cutoffs(&[200.0, 1000.0]), vec![1000.0]);
    }

    #[test]
    fn test_json_roundtrip_with_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "tests": ["thd", "linear"], "sample_rate": 48000 }"#).unwrap();

        let config = VerifyConfig::load(&path).unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.tests, vec![TestCategory::Thd, TestCategory::LinearResponse]);
        assert_eq!(config.matrix.thd.levels_dbfs, vec![-18.0, -12.0, -6.0]);
    }

    #[test]
    fn test_unknown_test_name_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "tests": ["warp"] }"#).unwrap();

        assert!(matches!(VerifyConfig::load(&path), Err(VerifyError::Config(_))));
    }
}
