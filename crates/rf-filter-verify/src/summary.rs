//! Run summary assembly, persistence and console rendering

use crate::metrics::{AnalysisResult, CategoryMetrics, TestCategory};
use crate::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Everything a verification run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub run_id: String,

    /// ISO-8601 creation time
    pub timestamp: String,

    pub sample_rate: u32,
    pub filters_tested: Vec<String>,
    pub tests_run: Vec<TestCategory>,

    /// Always `results.len()`
    pub total_test_cases: usize,

    pub results: Vec<AnalysisResult>,
}

impl MetricsSummary {
    /// Build a summary over `results`, stamped with the current local time
    pub fn assemble(
        run_id: impl Into<String>,
        sample_rate: u32,
        filters_tested: Vec<String>,
        tests_run: Vec<TestCategory>,
        results: Vec<AnalysisResult>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: chrono::Local::now().to_rfc3339(),
            sample_rate,
            filters_tested,
            tests_run,
            total_test_cases: results.len(),
            results,
        }
    }

    /// Results of one category, in run order
    pub fn results_for(&self, category: TestCategory) -> impl Iterator<Item = &AnalysisResult> {
        self.results.iter().filter(move |r| r.test_case() == category)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the summary as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| VerifyError::persist(path, e))
    }

    /// Read a summary written by [`MetricsSummary::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let summary: Self = serde_json::from_str(&content)?;
        if summary.total_test_cases != summary.results.len() {
            return Err(VerifyError::Analysis(format!(
                "{}: total_test_cases {} does not match {} results",
                path.as_ref().display(),
                summary.total_test_cases,
                summary.results.len()
            )));
        }
        Ok(summary)
    }

    /// Console summary grouped by category
    pub fn render_text(&self) -> String {
        let mut output = String::new();
        let rule = "=".repeat(60);

        output.push_str(&format!("{}\n", rule));
        output.push_str("Filter Verification Summary\n");
        output.push_str(&format!("Run ID: {}\n", self.run_id));
        output.push_str(&format!("Sample Rate: {} Hz\n", self.sample_rate));
        output.push_str(&format!("Filters: {}\n", self.filters_tested.join(", ")));
        let tests: Vec<&str> = self.tests_run.iter().map(|t| t.as_str()).collect();
        output.push_str(&format!("Tests: {}\n", tests.join(", ")));
        output.push_str(&format!("Total Test Cases: {}\n", self.total_test_cases));
        output.push_str(&format!("{}\n", rule));

        let mut seen = Vec::new();
        for result in &self.results {
            if !seen.contains(&result.test_case()) {
                seen.push(result.test_case());
            }
        }

        for category in seen {
            output.push_str(&format!("\n{}:\n", category.as_str().to_uppercase()));
            let results: Vec<&AnalysisResult> = self.results_for(category).collect();

            match category {
                TestCategory::SelfOscillation => {
                    let mut oscillating = BTreeSet::new();
                    let mut stable = BTreeSet::new();
                    for r in &results {
                        if let CategoryMetrics::SelfOscillation(m) = r.metrics() {
                            if m.oscillating {
                                oscillating.insert(r.filter_name.as_str());
                            } else {
                                stable.insert(r.filter_name.as_str());
                            }
                        }
                    }
                    output.push_str(&format!("  Self-oscillating: {}\n", join_or_none(&oscillating)));
                    output.push_str(&format!("  Non-oscillating: {}\n", join_or_none(&stable)));
                }
                TestCategory::Thd => {
                    for r in &results {
                        if let CategoryMetrics::Thd(m) = r.metrics() {
                            output.push_str(&format!(
                                "  {} @ {}dBFS: THD={:.4}%\n",
                                r.filter_name, m.input_level_dbfs, m.thd_percent
                            ));
                        }
                    }
                }
                TestCategory::Step => {
                    for r in &results {
                        if let CategoryMetrics::Step(m) = r.metrics() {
                            output.push_str(&format!(
                                "  {} (Q={}): overshoot={:.1}%, settling={:.2}ms\n",
                                r.filter_name, r.resonance, m.overshoot_pct, m.settling_time_ms
                            ));
                        }
                    }
                }
                _ => {
                    output.push_str(&format!("  {} results\n", results.len()));
                }
            }
        }

        output
    }
}

fn join_or_none(names: &BTreeSet<&str>) -> String {
    if names.is_empty() {
        "None".to_string()
    } else {
        names.iter().copied().collect::<Vec<_>>().join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{SelfOscillationMetrics, StepMetrics, ThdMetrics};

    fn sample_results() -> Vec<AnalysisResult> {
        vec![
            AnalysisResult::new(
                "Stilson",
                5000.0,
                0.0,
                0,
                CategoryMetrics::Thd(ThdMetrics {
                    input_level_dbfs: -12.0,
                    thd_percent: 0.0123,
                    fundamental_dbfs: -12.1,
                    harmonics_db: vec![-90.0, -95.0],
                }),
            ),
            AnalysisResult::new(
                "Stilson",
                1000.0,
                1.0,
                0,
                CategoryMetrics::SelfOscillation(SelfOscillationMetrics {
                    oscillating: true,
                    dominant_freq_hz: 990.0,
                    rms_dbfs: -10.0,
                }),
            ),
            AnalysisResult::new(
                "Improved",
                1000.0,
                1.0,
                0,
                CategoryMetrics::SelfOscillation(SelfOscillationMetrics {
                    oscillating: false,
                    dominant_freq_hz: 0.0,
                    rms_dbfs: -240.0,
                }),
            ),
            AnalysisResult::new(
                "Improved",
                1000.0,
                0.5,
                0,
                CategoryMetrics::Step(StepMetrics {
                    overshoot_pct: 4.31,
                    settling_time_ms: 1.5,
                    dc_gain: 1.0,
                }),
            ),
        ]
    }

    fn summary() -> MetricsSummary {
        MetricsSummary::assemble(
            "2026-01-01_000000",
            44100,
            vec!["Stilson".into(), "Improved".into()],
            vec![TestCategory::Thd, TestCategory::SelfOscillation, TestCategory::Step],
            sample_results(),
        )
    }

    #[test]
    fn test_total_matches_results() {
        let s = summary();
        assert_eq!(s.total_test_cases, 4);

        let empty = MetricsSummary::assemble("x", 44100, vec![], vec![], vec![]);
        assert_eq!(empty.total_test_cases, 0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");

        let s = summary();
        s.save(&path).unwrap();
        let loaded = MetricsSummary::load(&path).unwrap();
        assert_eq!(loaded, s);
    }

    #[test]
    fn test_load_rejects_inconsistent_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");

        let mut s = summary();
        s.total_test_cases = 99;
        std::fs::write(&path, serde_json::to_string(&s).unwrap()).unwrap();
        assert!(MetricsSummary::load(&path).is_err());
    }

    #[test]
    fn test_save_to_missing_dir_is_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("summary.json");
        assert!(matches!(summary().save(&path), Err(VerifyError::Persist { .. })));
    }

    #[test]
    fn test_render_text() {
        let text = summary().render_text();
        assert!(text.contains("Run ID: 2026-01-01_000000"));
        assert!(text.contains("Tests: thd, selfoscillation, step"));
        assert!(text.contains("Total Test Cases: 4"));
        assert!(text.contains("Stilson @ -12dBFS: THD=0.0123%"));
        assert!(text.contains("Self-oscillating: Stilson"));
        assert!(text.contains("Non-oscillating: Improved"));
        assert!(text.contains("Improved (Q=0.5): overshoot=4.3%, settling=1.50ms"));
    }

    #[test]
    fn test_results_for_category() {
        let s = summary();
        assert_eq!(s.results_for(TestCategory::SelfOscillation).count(), 2);
        assert_eq!(s.results_for(TestCategory::Noise).count(), 0);
    }
}
