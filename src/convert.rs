use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::FilterError;
use crate::tool::{self, ToolRunError};

pub trait ExternalConverter: Send + Sync {
    /// An unavailable converter never means "no spectra".
    fn is_available(&self) -> bool;

    fn convert_to_mzml(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, FilterError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub docker: Option<String>,
    pub image: String,
}

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct DockerMsconvert {
    docker: Option<PathBuf>,
    image: String,
    timeout: Duration,
    available: OnceLock<bool>,
}

impl DockerMsconvert {
    pub fn new(image: impl Into<String>, timeout: Duration) -> Self {
        Self {
            docker: tool::find_in_path("docker"),
            image: image.into(),
            timeout,
            available: OnceLock::new(),
        }
    }

    pub fn with_docker(docker: PathBuf, image: impl Into<String>, timeout: Duration) -> Self {
        Self {
            docker: Some(docker),
            ..Self::new(image, timeout)
        }
    }

    pub fn tool_info(&self) -> ToolInfo {
        ToolInfo {
            docker: self
                .docker
                .as_ref()
                .and_then(|path| tool::tool_version(path, &["--version"])),
            image: self.image.clone(),
        }
    }

    fn check_docker(&self) -> bool {
        let Some(docker) = self.docker.as_ref() else {
            warn!("docker not found in PATH; msconvert unavailable");
            return false;
        };
        let checks: [&[&str]; 2] = [&["--version"], &["ps", "-q"]];
        for args in checks {
            let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
            match tool::run_with_timeout(docker, &args, Duration::from_secs(15)) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    warn!(stderr = %output.stderr.trim(), "docker check failed; msconvert unavailable");
                    return false;
                }
                Err(err) => {
                    warn!(error = %err, "docker check failed; msconvert unavailable");
                    return false;
                }
            }
        }
        info!("docker available for msconvert");
        true
    }

    fn docker_args(
        &self,
        input: &Path,
        output_dir: &Path,
        container: &str,
    ) -> Result<(Vec<String>, String), FilterError> {
        let file_name = input
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| FilterError::Conversion(format!("invalid input path {}", input.display())))?;
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(file_name);
        let output_name = format!("{stem}.mzML");
        let mount = format!("{}:/data", output_dir.display());
        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container.to_string(),
            "-v".to_string(),
            mount,
            self.image.clone(),
            "wine".to_string(),
            "msconvert.exe".to_string(),
            format!("/data/{file_name}"),
            "--mzML".to_string(),
            "--outfile".to_string(),
            format!("/data/{output_name}"),
            "-o".to_string(),
            "/data".to_string(),
            "--filter".to_string(),
            "msLevel 2-".to_string(),
        ];
        Ok((args, output_name))
    }

    // Killing the docker client leaves the container running.
    fn remove_container(&self, docker: &Path, container: &str) {
        let args = vec!["rm".to_string(), "-f".to_string(), container.to_string()];
        match tool::run_with_timeout(docker, &args, Duration::from_secs(60)) {
            Ok(output) if output.success() => info!(container, "removed timed out container"),
            Ok(output) => {
                warn!(container, stderr = %output.stderr.trim(), "failed to remove container")
            }
            Err(err) => warn!(container, error = %err, "failed to remove container"),
        }
    }
}

fn container_name() -> String {
    let seq = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("ms2-filter-{}-{seq}", std::process::id())
}

impl ExternalConverter for DockerMsconvert {
    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| self.check_docker())
    }

    fn convert_to_mzml(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, FilterError> {
        let docker = self
            .docker
            .as_ref()
            .ok_or_else(|| FilterError::MissingTool("docker".to_string()))?;
        let container = container_name();
        let (args, output_name) = self.docker_args(input, output_dir, &container)?;
        let output = tool::run_with_timeout(docker, &args, self.timeout).map_err(|err| match err {
            ToolRunError::TimedOut(_) => {
                self.remove_container(docker, &container);
                FilterError::Conversion(format!("msconvert {err}"))
            }
            ToolRunError::Spawn(_) => FilterError::Conversion(err.to_string()),
        })?;
        if !output.success() {
            return Err(FilterError::Conversion(
                output.stderr_or(format!("msconvert exited with {}", output.status)),
            ));
        }
        let converted = output_dir.join(output_name);
        if !converted.exists() {
            return Err(FilterError::Conversion(format!(
                "converted file {} not found",
                converted.display()
            )));
        }
        Ok(converted)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledConverter;

impl ExternalConverter for DisabledConverter {
    fn is_available(&self) -> bool {
        false
    }

    fn convert_to_mzml(&self, _input: &Path, _output_dir: &Path) -> Result<PathBuf, FilterError> {
        Err(FilterError::Conversion("conversion disabled".to_string()))
    }
}

impl<T: ExternalConverter + ?Sized> ExternalConverter for Arc<T> {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn convert_to_mzml(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, FilterError> {
        (**self).convert_to_mzml(input, output_dir)
    }
}

#[derive(Debug, Clone)]
pub struct ConversionGate {
    inner: Arc<GateState>,
}

#[derive(Debug)]
struct GateState {
    in_use: Mutex<usize>,
    released: Condvar,
    limit: usize,
}

pub struct GatePermit {
    inner: Arc<GateState>,
}

impl ConversionGate {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(GateState {
                in_use: Mutex::new(0),
                released: Condvar::new(),
                limit: limit.max(1),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn acquire(&self) -> GatePermit {
        let mut in_use = self
            .inner
            .in_use
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *in_use >= self.inner.limit {
            in_use = self
                .inner
                .released
                .wait(in_use)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *in_use += 1;
        GatePermit {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let mut in_use = self
            .inner
            .in_use
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *in_use = in_use.saturating_sub(1);
        self.inner.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn gate_caps_concurrent_holders() {
        let gate = ConversionGate::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        thread::scope(|scope| {
            for _ in 0..8 {
                let gate = gate.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                scope.spawn(move || {
                    let _permit = gate.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn docker_args_follow_msconvert_layout() {
        let converter = DockerMsconvert::new("pwiz:latest", Duration::from_secs(1));
        let (args, output) = converter
            .docker_args(
                Path::new("/tmp/work/sample2.raw"),
                Path::new("/tmp/work"),
                "ms2-filter-7-0",
            )
            .unwrap();
        assert_eq!(output, "sample2.mzML");
        assert_eq!(args[2..4], ["--name", "ms2-filter-7-0"]);
        assert_eq!(args[5], "/tmp/work:/data");
        assert_eq!(args[6], "pwiz:latest");
        assert!(args.contains(&"/data/sample2.raw".to_string()));
        assert_eq!(args.last().unwrap(), "msLevel 2-");
    }

    #[test]
    fn container_names_are_unique() {
        assert_ne!(container_name(), container_name());
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_conversion_removes_its_container() {
        let temp = tempfile::tempdir().unwrap();
        let log = temp.path().join("docker.log");
        let docker = crate::tool::testing::script(
            temp.path(),
            "docker",
            &format!(
                "echo \"$@\" >> '{}'\ncase \"$1\" in run) sleep 5 ;; esac",
                log.display()
            ),
        );
        let input = temp.path().join("sample2.raw");
        std::fs::write(&input, b"vendor").unwrap();
        let converter =
            DockerMsconvert::with_docker(docker, "pwiz:latest", Duration::from_millis(300));

        let err = converter.convert_to_mzml(&input, temp.path()).unwrap_err();
        assert!(matches!(err, FilterError::Conversion(message) if message.contains("timed out")));

        let log = std::fs::read_to_string(&log).unwrap();
        let lines = log.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let container = lines[0].split_whitespace().nth(3).unwrap();
        assert!(container.starts_with("ms2-filter-"));
        assert_eq!(lines[1], format!("rm -f {container}"));
    }

    #[test]
    fn disabled_converter_is_never_available() {
        assert!(!DisabledConverter.is_available());
    }
}
