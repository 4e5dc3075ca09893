//! Test matrix execution
//!
//! Each category expands into parameter tuples. A tuple is one filter
//! invocation writing into its own directory under `wav/`; every output file
//! of an allow-listed filter variant becomes one [`AnalysisResult`].
//!
//! ```text
//! <output_root>/<run_id>/
//!   inputs/             generated test signals
//!   wav/<category>/...  filter outputs, one directory per tuple
//!   metrics/            <category>.json and summary.json
//! ```

use crate::analysis::{Analyzer, PowerSpectrum};
use crate::config::VerifyConfig;
use crate::invoker::{
    discover_outputs, extract_filter_name, FilterInvoker, InvocationRequest, ProcessInvoker,
};
use crate::metrics::{AnalysisResult, CategoryMetrics, TestCategory};
use crate::signals::TestSignal;
use crate::spectral::{FftProvider, RealFftProvider};
use crate::summary::MetricsSummary;
use crate::wav::{HoundCodec, Waveform, WaveformCodec};
use crate::{Result, VerifyError};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Chirp start frequency for resonance tracking (Hz)
const CHIRP_START_HZ: f64 = 20.0;

/// Directory layout of one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunLayout {
    pub root: PathBuf,
    pub inputs: PathBuf,
    pub wav: PathBuf,
    pub metrics: PathBuf,
    /// Only created by plot renderers
    pub plots: PathBuf,
}

impl RunLayout {
    pub fn new(output_root: &Path, run_id: &str) -> Self {
        let root = output_root.join(run_id);
        Self {
            inputs: root.join("inputs"),
            wav: root.join("wav"),
            metrics: root.join("metrics"),
            plots: root.join("plots"),
            root,
        }
    }

    /// Create `inputs/`, `wav/` and `metrics/`
    pub fn create(&self) -> Result<()> {
        for dir in [&self.inputs, &self.wav, &self.metrics] {
            std::fs::create_dir_all(dir).map_err(|e| VerifyError::persist(dir, e))?;
        }
        Ok(())
    }

    /// Output directory of one parameter tuple
    pub fn test_dir(&self, category: TestCategory, subdir: &str) -> PathBuf {
        let base = self.wav.join(category.as_str());
        if subdir.is_empty() {
            base
        } else {
            base.join(subdir)
        }
    }

    pub fn category_metrics_path(&self, category: TestCategory) -> PathBuf {
        self.metrics.join(format!("{}.json", category.as_str()))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.metrics.join("summary.json")
    }
}

/// Declarative recipe for one parameter tuple
#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseConfig {
    pub signal_type: String,
    pub cutoff_hz: f64,
    pub resonance: f64,
    pub oversample: u32,
    pub description: String,
}

/// Renders plot artifacts for analyzed outputs
pub trait PlotRenderer: Send + Sync {
    /// Plots for one analyzed output; returned strings become `plots_generated`
    fn render(
        &self,
        case: &TestCaseConfig,
        filter_name: &str,
        output: &Waveform,
        metrics: &CategoryMetrics,
        plots_dir: &Path,
    ) -> Result<Vec<String>>;

    /// Overlay of every filter's magnitude response at one cutoff
    fn render_comparison(
        &self,
        _cutoff_hz: u32,
        _curves: &[ComparisonCurve],
        _plots_dir: &Path,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// One filter's magnitude response for cross-filter comparison
#[derive(Debug, Clone)]
pub struct ComparisonCurve {
    pub filter_name: String,
    pub oversample: u32,
    pub freqs: Vec<f64>,
    pub magnitude_db: Vec<f64>,
}

/// Progress of a category through the matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryState {
    NotStarted,
    SignalReady,
    Invoked,
    OutputsDiscovered,
    Analyzed,
    CategoryComplete,
}

impl fmt::Display for CategoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CategoryState::NotStarted => "not started",
            CategoryState::SignalReady => "signal ready",
            CategoryState::Invoked => "invoked",
            CategoryState::OutputsDiscovered => "outputs discovered",
            CategoryState::Analyzed => "analyzed",
            CategoryState::CategoryComplete => "complete",
        };
        f.write_str(name)
    }
}

fn trace(category: TestCategory, state: CategoryState, detail: &str) {
    log::debug!("[{}] {}{}", category, state, detail);
}

/// What to measure on each output of a tuple
#[derive(Debug, Clone)]
enum Measurement {
    Linear,
    Resonance,
    SelfOscillation,
    Thd { freq_hz: f64, level_dbfs: f64 },
    Imd { f1_hz: f64, f2_hz: f64 },
    Aliasing { freq_hz: f64 },
    Step,
    Noise { input_psd: Arc<PowerSpectrum> },
}

impl Measurement {
    /// Compares the output against the input as persisted (decoded from its file)
    fn needs_decoded_input(&self) -> bool {
        matches!(self, Measurement::Aliasing { .. })
    }
}

/// An input signal on disk, plus its decoded samples when a measurement needs them
struct SavedInput {
    path: PathBuf,
    decoded: Option<Arc<Vec<f64>>>,
}

#[derive(Debug, Clone)]
struct PlannedCase {
    config: TestCaseConfig,
    signal: usize,
    subdir: String,
    measurement: Measurement,
}

/// Signals and tuples of one category
#[derive(Debug, Clone)]
struct CategoryPlan {
    category: TestCategory,
    signals: Vec<TestSignal>,
    cases: Vec<PlannedCase>,
}

/// Drives generation, invocation and analysis over the whole matrix
pub struct MatrixRunner {
    config: VerifyConfig,
    invoker: Arc<dyn FilterInvoker>,
    codec: Arc<dyn WaveformCodec>,
    analyzer: Analyzer,
    plotter: Option<Arc<dyn PlotRenderer>>,
}

impl MatrixRunner {
    /// Runner with the hound codec and realfft provider
    pub fn new(config: VerifyConfig, invoker: Arc<dyn FilterInvoker>) -> Self {
        let analyzer = Analyzer::new(Arc::new(RealFftProvider::new()), config.analysis.clone());
        Self {
            config,
            invoker,
            codec: Arc::new(HoundCodec::new()),
            analyzer,
            plotter: None,
        }
    }

    /// Runner driving an external filter executable, honoring the configured timeout
    pub fn for_executable(config: VerifyConfig, executable: impl Into<PathBuf>) -> Self {
        let mut invoker = ProcessInvoker::new(executable);
        if let Some(secs) = config.process_timeout_secs {
            invoker = invoker.with_timeout(secs);
        }
        Self::new(config, Arc::new(invoker))
    }

    /// Builder pattern: replace the waveform codec
    pub fn with_codec(mut self, codec: Arc<dyn WaveformCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Builder pattern: replace the FFT provider
    pub fn with_fft(mut self, fft: Arc<dyn FftProvider>) -> Self {
        self.analyzer = Analyzer::new(fft, self.config.analysis.clone());
        self
    }

    /// Builder pattern: attach a plot renderer
    pub fn with_plot_renderer(mut self, plotter: Arc<dyn PlotRenderer>) -> Self {
        self.plotter = Some(plotter);
        self
    }

    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    /// Run id of the next run: the pinned one, or a local timestamp
    pub fn run_id(&self) -> String {
        self.config
            .run_id
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d_%H%M%S").to_string())
    }

    /// Run every requested category and persist per-category metrics and the summary
    pub fn run(&self) -> Result<MetricsSummary> {
        self.config.validate()?;

        // Every plan is built before anything touches the disk
        let plans = self
            .config
            .tests
            .iter()
            .map(|&category| self.plan(category))
            .collect::<Result<Vec<_>>>()?;
        if !plans.is_empty() {
            self.invoker.validate()?;
        }

        let run_id = self.run_id();
        let layout = RunLayout::new(&self.config.output_root, &run_id);
        layout.create()?;
        log::info!("Verification run {} in {}", run_id, layout.root.display());

        let mut results = Vec::new();
        for plan in plans {
            let category = plan.category;
            let category_results = self.run_plan(plan, &layout)?;
            save_category(&layout.category_metrics_path(category), &category_results)?;
            results.extend(category_results);
        }

        if self.config.tests.contains(&TestCategory::LinearResponse) {
            self.render_comparisons(&layout);
        }

        let summary = MetricsSummary::assemble(
            run_id,
            self.config.sample_rate,
            self.config.filters.clone(),
            self.config.tests.clone(),
            results,
        );
        summary.save(layout.summary_path())?;
        log::info!("{} test cases analyzed", summary.total_test_cases);

        Ok(summary)
    }

    /// Run a single category into an existing layout
    pub fn run_category(&self, category: TestCategory, layout: &RunLayout) -> Result<Vec<AnalysisResult>> {
        let plan = self.plan(category)?;
        self.run_plan(plan, layout)
    }

    fn run_plan(&self, mut plan: CategoryPlan, layout: &RunLayout) -> Result<Vec<AnalysisResult>> {
        let category = plan.category;
        trace(category, CategoryState::NotStarted, "");
        if plan.cases.is_empty() {
            log::warn!("{}: parameter grid is empty, nothing to run", category);
            trace(category, CategoryState::CategoryComplete, ": 0 results");
            return Ok(Vec::new());
        }
        log::info!("Running {} tests ({} tuples)", category, plan.cases.len());

        let decode = plan.cases.iter().any(|c| c.measurement.needs_decoded_input());
        let mut inputs = Vec::with_capacity(plan.signals.len());
        for signal in &mut plan.signals {
            let path = signal.save(&layout.inputs, self.codec.as_ref())?;
            let decoded = if decode {
                Some(Arc::new(self.codec.read(&path)?.to_f64()))
            } else {
                None
            };
            inputs.push(SavedInput { path, decoded });
        }
        trace(category, CategoryState::SignalReady, "");

        let per_case: Vec<Vec<AnalysisResult>> = if self.config.parallel {
            plan.cases
                .par_iter()
                .map(|case| self.run_case(category, case, &inputs[case.signal], layout))
                .collect()
        } else {
            plan.cases
                .iter()
                .map(|case| self.run_case(category, case, &inputs[case.signal], layout))
                .collect()
        };

        let results: Vec<AnalysisResult> = per_case.into_iter().flatten().collect();
        trace(
            category,
            CategoryState::CategoryComplete,
            &format!(": {} results", results.len()),
        );
        Ok(results)
    }

    /// One tuple: invoke (or reuse cached outputs), then analyze each output
    fn run_case(
        &self,
        category: TestCategory,
        case: &PlannedCase,
        input: &SavedInput,
        layout: &RunLayout,
    ) -> Vec<AnalysisResult> {
        let request = InvocationRequest::new(
            &input.path,
            case.config.cutoff_hz,
            case.config.resonance,
            case.config.oversample,
            layout.test_dir(category, &case.subdir),
        );

        let cached = if self.config.skip_existing {
            match discover_outputs(&request) {
                Ok(outputs) => outputs,
                Err(e) => {
                    log::warn!("{}: cannot scan {}: {}", category, request.output_dir.display(), e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let outputs = if !cached.is_empty() {
            trace(
                category,
                CategoryState::OutputsDiscovered,
                &format!(": reusing {} outputs in {}", cached.len(), request.output_dir.display()),
            );
            cached
        } else {
            match self.invoker.invoke(&request) {
                Ok(outputs) => {
                    trace(
                        category,
                        CategoryState::Invoked,
                        &format!(": {} -> {} outputs", case.config.description, outputs.len()),
                    );
                    outputs
                }
                Err(e) => {
                    log::warn!("{}: skipping {}: {}", category, case.config.description, e);
                    return Vec::new();
                }
            }
        };

        let mut results = Vec::new();
        for path in &outputs {
            match self.analyze_output(case, path, input, layout) {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => log::warn!("{}: skipping {}: {}", category, path.display(), e),
            }
        }
        trace(
            category,
            CategoryState::Analyzed,
            &format!(": {} ({} results)", case.config.description, results.len()),
        );
        results
    }

    fn analyze_output(
        &self,
        case: &PlannedCase,
        path: &Path,
        input: &SavedInput,
        layout: &RunLayout,
    ) -> Result<Option<AnalysisResult>> {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let filter_name = extract_filter_name(stem);
        if !self.config.filters.iter().any(|f| f == filter_name) {
            return Ok(None);
        }

        let waveform = self.codec.read(path)?;
        let samples = waveform.to_f64();
        let sr = waveform.sample_rate;
        let config = &case.config;

        let metrics = match &case.measurement {
            Measurement::Linear => CategoryMetrics::Linear(self.analyzer.linear_metrics(&samples, sr)?),
            Measurement::Resonance => CategoryMetrics::Resonance(
                self.analyzer.resonance_peak(&samples, sr, config.cutoff_hz)?,
            ),
            Measurement::SelfOscillation => {
                CategoryMetrics::SelfOscillation(self.analyzer.self_oscillation(&samples, sr)?)
            }
            Measurement::Thd { freq_hz, level_dbfs } => CategoryMetrics::Thd(
                self.analyzer.thd(&samples, sr, *freq_hz, *level_dbfs)?,
            ),
            Measurement::Imd { f1_hz, f2_hz } => {
                CategoryMetrics::Imd(self.analyzer.imd(&samples, sr, *f1_hz, *f2_hz)?)
            }
            Measurement::Aliasing { freq_hz } => {
                let reference = input.decoded.as_ref().ok_or_else(|| {
                    VerifyError::Analysis(format!("{} was not decoded", input.path.display()))
                })?;
                CategoryMetrics::Aliasing(self.analyzer.aliasing(&samples, reference, sr, *freq_hz)?)
            }
            Measurement::Step => CategoryMetrics::Step(self.analyzer.step_metrics(&samples, sr)?),
            Measurement::Noise { input_psd } => {
                let output_psd = self.analyzer.psd(&samples, sr)?;
                CategoryMetrics::Noise(self.analyzer.noise_metrics(
                    &output_psd,
                    input_psd,
                    config.cutoff_hz,
                ))
            }
        };

        let plots = match &self.plotter {
            Some(plotter) => plotter
                .render(config, filter_name, &waveform, &metrics, &layout.plots)
                .unwrap_or_else(|e| {
                    log::warn!("Plot rendering failed for {}: {}", path.display(), e);
                    Vec::new()
                }),
            None => Vec::new(),
        };

        Ok(Some(
            AnalysisResult::new(
                filter_name,
                config.cutoff_hz,
                config.resonance,
                config.oversample,
                metrics,
            )
            .with_plots(plots),
        ))
    }

    /// Regroup a run's linear-response outputs by cutoff into per-filter magnitude curves
    pub fn collect_linear_comparison(&self, wav_dir: &Path) -> Result<BTreeMap<u32, Vec<ComparisonCurve>>> {
        let mut groups: BTreeMap<u32, Vec<ComparisonCurve>> = BTreeMap::new();
        let linear_dir = wav_dir.join(TestCategory::LinearResponse.as_str());
        if !linear_dir.is_dir() {
            return Ok(groups);
        }

        let mut subdirs: Vec<PathBuf> = std::fs::read_dir(&linear_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        subdirs.sort();

        for subdir in subdirs {
            let Some((cutoff, oversample)) = subdir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_linear_dir)
            else {
                continue;
            };

            let mut files: Vec<PathBuf> = std::fs::read_dir(&subdir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("wav")))
                .collect();
            files.sort();

            let curves = groups.entry(cutoff).or_default();
            for path in files {
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                let filter_name = extract_filter_name(stem);
                if !self.config.filters.iter().any(|f| f == filter_name) {
                    continue;
                }

                let waveform = self.codec.read(&path)?;
                let response = self
                    .analyzer
                    .frequency_response(&waveform.to_f64(), waveform.sample_rate)?;
                curves.push(ComparisonCurve {
                    filter_name: filter_name.to_string(),
                    oversample,
                    freqs: response.freqs,
                    magnitude_db: response.magnitude_db,
                });
            }
        }

        groups.retain(|_, curves| !curves.is_empty());
        Ok(groups)
    }

    fn render_comparisons(&self, layout: &RunLayout) {
        let Some(plotter) = &self.plotter else {
            return;
        };

        match self.collect_linear_comparison(&layout.wav) {
            Ok(groups) => {
                for (cutoff, curves) in groups {
                    if let Err(e) = plotter.render_comparison(cutoff, &curves, &layout.plots) {
                        log::warn!("Comparison plot for {} Hz failed: {}", cutoff, e);
                    }
                }
            }
            Err(e) => log::warn!("Cannot collect linear responses: {}", e),
        }
    }

    /// Expand one category into its signals and tuples
    fn plan(&self, category: TestCategory) -> Result<CategoryPlan> {
        let sr = self.config.sample_rate;
        let matrix = &self.config.matrix;
        let mut signals = Vec::new();
        let mut cases = Vec::new();

        let case = |signal_type: &str, cutoff_hz: f64, resonance: f64, oversample: u32, description: String| {
            TestCaseConfig {
                signal_type: signal_type.to_string(),
                cutoff_hz,
                resonance,
                oversample,
                description,
            }
        };

        match category {
            TestCategory::LinearResponse => {
                signals.push(TestSignal::impulse(sr, matrix.linear.impulse_length, 1.0)?);
                for &cutoff in &matrix.cutoffs {
                    for &os in &matrix.oversamples {
                        cases.push(PlannedCase {
                            config: case(
                                "impulse",
                                cutoff,
                                0.0,
                                os,
                                format!("linear response c={} os={}", cutoff, os),
                            ),
                            signal: 0,
                            subdir: tuple_dir(cutoff, 0.0, os),
                            measurement: Measurement::Linear,
                        });
                    }
                }
            }
            TestCategory::Resonance => {
                let plan = &matrix.resonance;
                signals.push(TestSignal::chirp(
                    sr,
                    plan.chirp_duration_sec,
                    CHIRP_START_HZ,
                    None,
                    plan.chirp_level_dbfs,
                )?);
                for cutoff in matrix.restricted_cutoffs(&plan.cutoffs) {
                    cases.push(PlannedCase {
                        config: case(
                            "chirp",
                            cutoff,
                            plan.resonance,
                            0,
                            format!("resonance c={} r={:.2}", cutoff, plan.resonance),
                        ),
                        signal: 0,
                        subdir: tuple_dir(cutoff, plan.resonance, 0),
                        measurement: Measurement::Resonance,
                    });
                }
            }
            TestCategory::SelfOscillation => {
                let plan = &matrix.self_oscillation;
                let length = (plan.silence_duration_sec * sr as f64) as usize;
                signals.push(TestSignal::silence(sr, length)?);
                for cutoff in matrix.restricted_cutoffs(&plan.cutoffs) {
                    cases.push(PlannedCase {
                        config: case(
                            "silence",
                            cutoff,
                            plan.resonance,
                            0,
                            format!("self-oscillation c={} r={:.2}", cutoff, plan.resonance),
                        ),
                        signal: 0,
                        subdir: tuple_dir(cutoff, plan.resonance, 0),
                        measurement: Measurement::SelfOscillation,
                    });
                }
            }
            TestCategory::Thd => {
                let plan = &matrix.thd;
                for (index, &level) in plan.levels_dbfs.iter().enumerate() {
                    let name = format!("sine_{}hz_{}dbfs_{}", plan.test_freq_hz as i64, level, sr);
                    signals.push(
                        TestSignal::sine(sr, plan.test_freq_hz, plan.duration_sec, level)?.with_name(name),
                    );
                    cases.push(PlannedCase {
                        config: case(
                            "sine",
                            plan.cutoff_hz,
                            0.0,
                            0,
                            format!("THD {} Hz at {} dBFS", plan.test_freq_hz, level),
                        ),
                        signal: index,
                        subdir: format!("level{}dbfs", level),
                        measurement: Measurement::Thd {
                            freq_hz: plan.test_freq_hz,
                            level_dbfs: level,
                        },
                    });
                }
            }
            TestCategory::Imd => {
                let plan = &matrix.imd;
                signals.push(TestSignal::two_tone(
                    sr,
                    plan.f1_hz,
                    plan.f2_hz,
                    plan.duration_sec,
                    plan.level_dbfs,
                )?);
                cases.push(PlannedCase {
                    config: case(
                        "twotone",
                        plan.cutoff_hz,
                        0.0,
                        0,
                        format!("IMD {}+{} Hz", plan.f1_hz, plan.f2_hz),
                    ),
                    signal: 0,
                    subdir: String::new(),
                    measurement: Measurement::Imd {
                        f1_hz: plan.f1_hz,
                        f2_hz: plan.f2_hz,
                    },
                });
            }
            TestCategory::Aliasing => {
                let plan = &matrix.aliasing;
                let oversamples: Vec<u32> = plan
                    .oversamples
                    .iter()
                    .copied()
                    .filter(|os| matrix.oversamples.contains(os))
                    .collect();

                for (index, &freq) in plan.test_freqs_hz.iter().enumerate() {
                    let name = format!("sine_{}hz_alias_{}", freq as i64, sr);
                    let signal = TestSignal::sine(sr, freq, plan.duration_sec, plan.level_dbfs)?.with_name(name);
                    signals.push(signal);

                    for &os in &oversamples {
                        cases.push(PlannedCase {
                            config: case(
                                "sine",
                                plan.cutoff_hz,
                                plan.resonance,
                                os,
                                format!("aliasing {} Hz os={}", freq, os),
                            ),
                            signal: index,
                            subdir: format!("f{}_os{}", freq as i64, os),
                            measurement: Measurement::Aliasing { freq_hz: freq },
                        });
                    }
                }
            }
            TestCategory::Step => {
                let plan = &matrix.step;
                signals.push(TestSignal::step(sr, plan.length, 1.0)?);
                for &resonance in &plan.resonances {
                    cases.push(PlannedCase {
                        config: case(
                            "step",
                            plan.cutoff_hz,
                            resonance,
                            0,
                            format!("step r={:.2}", resonance),
                        ),
                        signal: 0,
                        subdir: format!("r{:.2}", resonance),
                        measurement: Measurement::Step,
                    });
                }
            }
            TestCategory::Noise => {
                let plan = &matrix.noise;
                let noise = TestSignal::white_noise(sr, plan.duration_sec, plan.rms_dbfs, plan.seed)?;
                let input_psd = Arc::new(self.analyzer.psd(&noise.to_f64(), sr)?);
                signals.push(noise);
                for &resonance in &plan.resonances {
                    cases.push(PlannedCase {
                        config: case(
                            "whitenoise",
                            plan.cutoff_hz,
                            resonance,
                            0,
                            format!("noise r={:.2}", resonance),
                        ),
                        signal: 0,
                        subdir: format!("r{:.2}", resonance),
                        measurement: Measurement::Noise {
                            input_psd: Arc::clone(&input_psd),
                        },
                    });
                }
            }
        }

        Ok(CategoryPlan {
            category,
            signals,
            cases,
        })
    }
}

/// `c<cutoff>_r<resonance>_os<oversample>`
fn tuple_dir(cutoff: f64, resonance: f64, oversample: u32) -> String {
    format!("c{}_r{:.2}_os{}", cutoff as i64, resonance, oversample)
}

/// Cutoff and oversample factor from a `c<cutoff>_r<res>_os<n>` directory name
fn parse_linear_dir(name: &str) -> Option<(u32, u32)> {
    let mut parts = name.split('_');
    let cutoff = parts.next()?.strip_prefix('c')?.parse().ok()?;
    let oversample = parts
        .find_map(|p| p.strip_prefix("os"))
        .and_then(|os| os.parse().ok())
        .unwrap_or(0);
    Some((cutoff, oversample))
}

fn save_category(path: &Path, results: &[AnalysisResult]) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(path, json).map_err(|e| VerifyError::persist(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Copies the input to one output per variant
    struct CopyInvoker {
        variants: Vec<&'static str>,
        calls: Mutex<Vec<InvocationRequest>>,
    }

    impl CopyInvoker {
        fn new(variants: &[&'static str]) -> Self {
            Self {
                variants: variants.to_vec(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl FilterInvoker for CopyInvoker {
        fn invoke(&self, request: &InvocationRequest) -> Result<Vec<PathBuf>> {
            self.calls.lock().push(request.clone());
            std::fs::create_dir_all(&request.output_dir)?;
            for variant in &self.variants {
                std::fs::copy(&request.input, request.output_dir.join(request.output_file_name(variant)))?;
            }
            discover_outputs(request)
        }
    }

    fn config(root: &Path, tests: &[TestCategory]) -> VerifyConfig {
        VerifyConfig::quick()
            .with_output_root(root)
            .with_tests(tests)
            .with_filters(&["Stilson", "Improved"])
            .with_run_id("run")
    }

    #[test]
    fn test_layout_paths() {
        let layout = RunLayout::new(Path::new("/out"), "2026-01-01_000000");
        assert_eq!(layout.inputs, Path::new("/out/2026-01-01_000000/inputs"));
        assert_eq!(
            layout.test_dir(TestCategory::LinearResponse, "c1000_r0.00_os4"),
            Path::new("/out/2026-01-01_000000/wav/linear_response/c1000_r0.00_os4")
        );
        assert_eq!(layout.test_dir(TestCategory::Imd, ""), Path::new("/out/2026-01-01_000000/wav/imd"));
        assert_eq!(
            layout.category_metrics_path(TestCategory::SelfOscillation),
            Path::new("/out/2026-01-01_000000/metrics/selfoscillation.json")
        );
    }

    #[test]
    fn test_plan_grids() {
        let runner = MatrixRunner::new(
            VerifyConfig::default(),
            Arc::new(CopyInvoker::new(&["Stilson"])),
        );

        let linear = runner.plan(TestCategory::LinearResponse).unwrap();
        assert_eq!(linear.cases.len(), 7 * 2);
        assert_eq!(linear.cases[1].subdir, "c50_r0.00_os4");

        let resonance = runner.plan(TestCategory::Resonance).unwrap();
        let cutoffs: Vec<f64> = resonance.cases.iter().map(|c| c.config.cutoff_hz).collect();
        assert_eq!(cutoffs, vec![200.0, 1000.0, 5000.0]);
        assert_eq!(resonance.cases[0].subdir, "c200_r0.90_os0");
        assert_eq!(resonance.signals[0].samples.len(), 5 * 44100);

        let thd = runner.plan(TestCategory::Thd).unwrap();
        let names: Vec<&str> = thd.signals.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "sine_1000hz_-18dbfs_44100",
                "sine_1000hz_-12dbfs_44100",
                "sine_1000hz_-6dbfs_44100"
            ]
        );
        assert_eq!(thd.cases[1].subdir, "level-12dbfs");

        let aliasing = runner.plan(TestCategory::Aliasing).unwrap();
        let dirs: Vec<&str> = aliasing.cases.iter().map(|c| c.subdir.as_str()).collect();
        assert_eq!(dirs, vec!["f10000_os0", "f10000_os4", "f15000_os0", "f15000_os4"]);
        assert_eq!(aliasing.signals[1].name, "sine_15000hz_alias_44100");

        let step = runner.plan(TestCategory::Step).unwrap();
        let dirs: Vec<&str> = step.cases.iter().map(|c| c.subdir.as_str()).collect();
        assert_eq!(dirs, vec!["r0.00", "r0.50", "r0.90"]);

        let selfosc = runner.plan(TestCategory::SelfOscillation).unwrap();
        assert_eq!(selfosc.signals[0].samples.len(), 2 * 44100);
        assert_eq!(selfosc.cases[0].config.resonance, 1.0);
    }

    #[test]
    fn test_empty_grid_leaves_other_categories_running() {
        let dir = tempfile::tempdir().unwrap();
        let tests = [TestCategory::LinearResponse, TestCategory::Resonance, TestCategory::Aliasing];
        // No resonance cutoff survives, and aliasing only runs at 0x or 4x
        let config = config(dir.path(), &tests)
            .with_cutoffs(&[100.0])
            .with_oversamples(&[2]);
        let invoker = Arc::new(CopyInvoker::new(&["Stilson"]));
        let runner = MatrixRunner::new(config, invoker.clone());

        let summary = runner.run().unwrap();
        assert_eq!(summary.total_test_cases, 1);
        assert_eq!(summary.results[0].test_case(), TestCategory::LinearResponse);
        assert_eq!(summary.results_for(TestCategory::Resonance).count(), 0);
        assert_eq!(invoker.calls.lock().len(), 1);

        let metrics = dir.path().join("run/metrics");
        let resonance = std::fs::read_to_string(metrics.join("resonance.json")).unwrap();
        assert_eq!(resonance.trim(), "[]");
        let aliasing = std::fs::read_to_string(metrics.join("aliasing.json")).unwrap();
        assert_eq!(aliasing.trim(), "[]");
        // No chirp is generated for a category with nothing to run
        assert!(!dir.path().join("run/inputs/chirp_20-19845_44100.wav").exists());
    }

    #[test]
    fn test_step_category_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Arc::new(CopyInvoker::new(&["Stilson", "Improved", "Hyperion"]));
        let runner = MatrixRunner::new(config(dir.path(), &[TestCategory::Step]), invoker.clone());

        let summary = runner.run().unwrap();
        // Hyperion is not allow-listed
        assert_eq!(summary.total_test_cases, 3 * 2);
        assert_eq!(invoker.calls.lock().len(), 3);

        let names: Vec<&str> = summary.results.iter().map(|r| r.filter_name.as_str()).collect();
        assert_eq!(names, vec!["Improved", "Stilson", "Improved", "Stilson", "Improved", "Stilson"]);

        for result in &summary.results {
            let CategoryMetrics::Step(m) = result.metrics() else {
                panic!("expected step metrics");
            };
            assert!((m.dc_gain - 1.0).abs() < 1e-4);
            assert_eq!(m.settling_time_ms, 0.0);
        }

        let root = dir.path().join("run");
        assert!(root.join("inputs/step_44100.wav").exists());
        assert!(root.join("wav/step/r0.50/Stilson_c1000_r0.50.wav").exists());
        assert!(root.join("metrics/step.json").exists());
        assert!(root.join("metrics/summary.json").exists());
    }

    #[test]
    fn test_parse_linear_dir() {
        assert_eq!(parse_linear_dir("c1000_r0.00_os4"), Some((1000, 4)));
        assert_eq!(parse_linear_dir("c50_r0.00_os0"), Some((50, 0)));
        assert_eq!(parse_linear_dir("level-12dbfs"), None);
    }

    #[test]
    fn test_collect_linear_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[TestCategory::LinearResponse])
            .with_cutoffs(&[200.0, 1000.0])
            .with_oversamples(&[0]);
        let runner = MatrixRunner::new(config, Arc::new(CopyInvoker::new(&["Stilson", "Improved"])));
        runner.run().unwrap();

        let groups = runner.collect_linear_comparison(&dir.path().join("run/wav")).unwrap();
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![200, 1000]);
        let curves = &groups[&1000];
        assert_eq!(curves.len(), 2);
        assert_eq!(curves[0].filter_name, "Improved");
        assert_eq!(curves[0].freqs.len(), curves[0].magnitude_db.len());
    }

    struct NamePlotter;

    impl PlotRenderer for NamePlotter {
        fn render(
            &self,
            case: &TestCaseConfig,
            filter_name: &str,
            _output: &Waveform,
            _metrics: &CategoryMetrics,
            _plots_dir: &Path,
        ) -> Result<Vec<String>> {
            Ok(vec![format!("{}_{}.png", filter_name, case.signal_type)])
        }
    }

    #[test]
    fn test_plot_references_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MatrixRunner::new(
            config(dir.path(), &[TestCategory::Imd]),
            Arc::new(CopyInvoker::new(&["Stilson"])),
        )
        .with_plot_renderer(Arc::new(NamePlotter));

        let summary = runner.run().unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].plots_generated, vec!["Stilson_twotone.png".to_string()]);
    }
}
