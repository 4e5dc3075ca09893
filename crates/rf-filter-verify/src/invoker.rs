//! External filter-under-test invocation
//!
//! The filter program is driven through a fixed command line:
//!
//! ```text
//! <exe> -f <input.wav> -c <cutoff> -r <resonance> -s <oversample> -o <output dir>
//! ```
//!
//! and writes one file per filter variant named
//! `<Variant>_c<cutoff>_r<resonance>[_os<n>x].wav`.

use crate::{Result, VerifyError};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// One parameter tuple to run through the filter under test
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub input: PathBuf,
    pub cutoff_hz: f64,
    pub resonance: f64,
    /// 0 = no oversampling
    pub oversample: u32,
    pub output_dir: PathBuf,
}

impl InvocationRequest {
    pub fn new(
        input: impl Into<PathBuf>,
        cutoff_hz: f64,
        resonance: f64,
        oversample: u32,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input: input.into(),
            cutoff_hz,
            resonance,
            oversample,
            output_dir: output_dir.into(),
        }
    }

    /// Command-line arguments for the filter executable
    pub fn args(&self) -> Vec<String> {
        vec![
            "-f".into(),
            self.input.display().to_string(),
            "-c".into(),
            (self.cutoff_hz as i64).to_string(),
            "-r".into(),
            format!("{:.2}", self.resonance),
            "-s".into(),
            self.oversample.to_string(),
            "-o".into(),
            self.output_dir.display().to_string(),
        ]
    }

    /// File name suffix shared by every variant's output for this tuple
    pub fn output_suffix(&self) -> String {
        let os = if self.oversample > 0 {
            format!("_os{}x", self.oversample)
        } else {
            String::new()
        };
        format!("_c{}_r{:.2}{}.wav", self.cutoff_hz as i64, self.resonance, os)
    }

    /// Output file name a variant writes for this tuple
    pub fn output_file_name(&self, variant: &str) -> String {
        format!("{}{}", variant, self.output_suffix())
    }
}

/// Runs the filter under test for one parameter tuple
pub trait FilterInvoker: Send + Sync {
    /// Check the collaborator is usable before a run starts
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Produce output files for `request`, sorted by file name
    fn invoke(&self, request: &InvocationRequest) -> Result<Vec<PathBuf>>;
}

/// Filter variant encoded in an output file stem (`Stilson_c1000_r0.50` -> `Stilson`)
pub fn extract_filter_name(stem: &str) -> &str {
    let bytes = stem.as_bytes();
    let mut search = 0;
    while let Some(pos) = stem[search..].find("_c") {
        let idx = search + pos;
        if bytes.get(idx + 2).is_some_and(|b| b.is_ascii_digit()) {
            return &stem[..idx];
        }
        search = idx + 2;
    }
    stem
}

/// Outputs for `request` already present in its output directory, sorted by file name
pub fn discover_outputs(request: &InvocationRequest) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(&request.output_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let suffix = request.output_suffix();
    let mut outputs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.len() > suffix.len() && name.ends_with(&suffix) {
            outputs.push(path);
        }
    }

    outputs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(outputs)
}

/// Runs an external executable per request
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    executable: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessInvoker {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            timeout: None,
        }
    }

    /// Kill the process if it runs longer than `secs`
    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(Duration::from_secs_f64(secs));
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut pipe) = pipe {
                let mut raw = Vec::new();
                if pipe.read_to_end(&mut raw).is_ok() {
                    text = String::from_utf8_lossy(&raw).into_owned();
                }
            }
            text
        })
    }
}

impl FilterInvoker for ProcessInvoker {
    fn validate(&self) -> Result<()> {
        if self.executable.is_file() {
            Ok(())
        } else {
            Err(VerifyError::ExecutableNotFound(self.executable.clone()))
        }
    }

    fn invoke(&self, request: &InvocationRequest) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&request.output_dir)?;

        let args = request.args();
        log::debug!("Running {} {}", self.executable.display(), args.join(" "));

        let mut child = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    VerifyError::ExecutableNotFound(self.executable.clone())
                }
                _ => VerifyError::Io(e),
            })?;

        let stdout = Self::drain(child.stdout.take());
        let stderr = Self::drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(VerifyError::ProcessTimeout(limit.as_secs_f64()));
                }
            }
            thread::sleep(Duration::from_millis(5));
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            return Err(VerifyError::ProcessFailed {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stdout.is_empty() {
            log::trace!("{}", stdout.trim_end());
        }

        discover_outputs(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, oversample: u32) -> InvocationRequest {
        InvocationRequest::new("in/impulse_44100.wav", 1000.0, 0.5, oversample, dir)
    }

    #[test]
    fn test_args_follow_cli_contract() {
        let req = InvocationRequest::new("in.wav", 2500.7, 0.9, 4, "out");
        assert_eq!(
            req.args(),
            vec!["-f", "in.wav", "-c", "2500", "-r", "0.90", "-s", "4", "-o", "out"]
        );
    }

    #[test]
    fn test_output_names() {
        let dir = Path::new("out");
        assert_eq!(request(dir, 0).output_file_name("Stilson"), "Stilson_c1000_r0.50.wav");
        assert_eq!(
            request(dir, 4).output_file_name("Huovilainen"),
            "Huovilainen_c1000_r0.50_os4x.wav"
        );
    }

    #[test]
    fn test_extract_filter_name() {
        assert_eq!(extract_filter_name("Stilson_c1000_r0.50"), "Stilson");
        assert_eq!(extract_filter_name("RKSimulation_c50_r0.00_os4x"), "RKSimulation");
        assert_eq!(extract_filter_name("My_compact_c200_r0.90"), "My_compact");
        assert_eq!(extract_filter_name("Plain"), "Plain");
    }

    #[test]
    fn test_discover_outputs_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "Stilson_c1000_r0.50.wav",
            "Improved_c1000_r0.50.wav",
            "Improved_c1000_r0.50_os4x.wav",
            "Improved_c2000_r0.50.wav",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let found = discover_outputs(&request(dir.path(), 0)).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Improved_c1000_r0.50.wav", "Stilson_c1000_r0.50.wav"]);

        let oversampled = discover_outputs(&request(dir.path(), 4)).unwrap();
        assert_eq!(oversampled.len(), 1);
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = discover_outputs(&request(&dir.path().join("absent"), 0)).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_validate_missing_executable() {
        let invoker = ProcessInvoker::new("/definitely/not/here/RunFilters");
        assert!(matches!(invoker.validate(), Err(VerifyError::ExecutableNotFound(_))));
    }
}
