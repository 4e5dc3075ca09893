//! # rf-filter-verify
//!
//! Objective verification harness for audio filter implementations.
//!
//! ## Features
//!
//! - **Signal Generation**: impulse, step, log chirp, sine, two-tone, white noise,
//!   near-DC sine and silence, all fully determined by their parameters
//! - **External Filter Runner**: drives a filter-under-test executable through its
//!   documented CLI contract and discovers its output files
//! - **Analysis Engine**: frequency/phase response, group delay, THD, IMD,
//!   spectrogram peak tracking, step response, self-oscillation, Welch PSD, aliasing
//! - **Test Matrix**: eight test categories swept over cutoff, resonance and
//!   oversampling grids with skip-existing caching
//! - **Reports**: per-category JSON documents and a run summary
//!
//! ## Example
//!
//! ```rust,ignore
//! use rf_filter_verify::{MatrixRunner, VerifyConfig};
//!
//! let config = VerifyConfig::default()
//!     .with_output_root("filter_validation")
//!     .with_process_timeout(60.0);
//! let runner = MatrixRunner::for_executable(config, "build/RunFilters");
//!
//! let summary = runner.run()?;
//! println!("{}", summary.render_text());
//! ```

pub mod analysis;
pub mod config;
pub mod invoker;
pub mod metrics;
pub mod orchestrator;
pub mod signals;
pub mod spectral;
pub mod summary;
pub mod wav;

pub use analysis::{Analyzer, FrequencyResponse, Spectrogram};
pub use config::{AnalysisConfig, MatrixConfig, VerifyConfig};
pub use invoker::{FilterInvoker, InvocationRequest, ProcessInvoker};
pub use metrics::{AnalysisResult, CategoryMetrics, TestCategory};
pub use orchestrator::{ComparisonCurve, MatrixRunner, PlotRenderer, RunLayout, TestCaseConfig};
pub use signals::TestSignal;
pub use spectral::{FftProvider, RealFftProvider};
pub use summary::MetricsSummary;
pub use wav::{HoundCodec, Waveform, WaveformCodec};

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while verifying filters
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Filter executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Filter process exited with {status}: {stderr}")]
    ProcessFailed { status: String, stderr: String },

    #[error("Filter process timed out after {0:.1}s")]
    ProcessTimeout(f64),

    #[error("FFT error: {0}")]
    Fft(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: Box<VerifyError>,
    },
}

impl VerifyError {
    /// Wrap an error with the path that could not be written
    pub fn persist(path: impl Into<PathBuf>, source: impl Into<VerifyError>) -> Self {
        Self::Persist {
            path: path.into(),
            source: Box::new(source.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VerifyError>;

/// Convert a dBFS level to linear amplitude
pub fn dbfs_to_linear(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Convert a linear amplitude to dBFS, floored by a tiny epsilon instead of -inf
pub fn linear_to_dbfs(amplitude: f64) -> f64 {
    20.0 * (amplitude.abs() + 1e-12).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_conversions() {
        assert!((dbfs_to_linear(0.0) - 1.0).abs() < 1e-12);
        assert!((dbfs_to_linear(-6.0) - 0.501).abs() < 0.001);
        assert!((linear_to_dbfs(1.0)).abs() < 1e-9);
        assert!((linear_to_dbfs(-0.5) - (-6.02)).abs() < 0.01);
    }

    #[test]
    fn test_silence_floor() {
        assert!((linear_to_dbfs(0.0) - (-240.0)).abs() < 1e-9);
    }
}
