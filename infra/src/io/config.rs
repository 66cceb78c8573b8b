//! Tool configuration stored under `.infra/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::io::process::RunLimits;

/// Tool configuration (TOML).
///
/// Every field has a default, so a missing file or a partial file is fine.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InfraConfig {
    /// Root of the state cache; each cluster gets a subdirectory.
    pub cache_dir: PathBuf,

    /// Root of the backend layouts: `<layouts_dir>/<provider>/layouts/<layout>/<slot>`.
    pub layouts_dir: PathBuf,

    /// Scratch space for per-run backend files (variables, state copies).
    pub work_dir: PathBuf,

    /// Upper bound on how long shutdown callbacks may take together.
    pub shutdown_deadline_secs: u64,

    pub backend: BackendConfig,

    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend executable (looked up on `PATH` when relative).
    pub binary: PathBuf,

    /// Per-invocation deadline in seconds.
    pub timeout_secs: u64,

    /// Seconds between interrupt and kill when stopping the backend.
    pub stop_grace_secs: u64,

    /// Truncate captured backend stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub kubectl: PathBuf,
    pub marker_namespace: String,
    pub marker_name: String,
    /// Seconds between node polls when watching through kubectl.
    pub poll_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
            timeout_secs: 60 * 60,
            stop_grace_secs: 30,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            kubectl: PathBuf::from("kubectl"),
            marker_namespace: "kube-system".to_string(),
            marker_name: "d8-cluster-is-bootstraped".to_string(),
            poll_interval_secs: 10,
        }
    }
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".infra/state"),
            layouts_dir: PathBuf::from("layouts"),
            work_dir: PathBuf::from(".infra/work"),
            shutdown_deadline_secs: 60,
            backend: BackendConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl InfraConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend.timeout_secs == 0 {
            return Err(anyhow!("backend.timeout_secs must be > 0"));
        }
        if self.backend.output_limit_bytes == 0 {
            return Err(anyhow!("backend.output_limit_bytes must be > 0"));
        }
        if self.backend.binary.as_os_str().is_empty() {
            return Err(anyhow!("backend.binary must not be empty"));
        }
        if self.shutdown_deadline_secs == 0 {
            return Err(anyhow!("shutdown_deadline_secs must be > 0"));
        }
        if self.reconcile.poll_interval_secs == 0 {
            return Err(anyhow!("reconcile.poll_interval_secs must be > 0"));
        }
        if self.reconcile.marker_name.trim().is_empty() {
            return Err(anyhow!("reconcile.marker_name must not be empty"));
        }
        Ok(())
    }

    pub fn run_limits(&self) -> RunLimits {
        RunLimits {
            timeout: Duration::from_secs(self.backend.timeout_secs),
            stop_grace: Duration::from_secs(self.backend.stop_grace_secs),
            output_limit_bytes: self.backend.output_limit_bytes,
        }
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `InfraConfig::default()`.
pub fn load_config(path: &Path) -> Result<InfraConfig> {
    if !path.exists() {
        let cfg = InfraConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: InfraConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, InfraConfig::default());
    }

    #[test]
    fn full_file_overrides_every_section() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "cache_dir = \"/var/lib/infra/state\"\nshutdown_deadline_secs = 5\n\n\
             [backend]\nbinary = \"/opt/terraform\"\nstop_grace_secs = 3\n\n\
             [reconcile]\npoll_interval_secs = 2\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/lib/infra/state"));
        assert_eq!(cfg.shutdown_deadline(), Duration::from_secs(5));
        assert_eq!(cfg.backend.binary, PathBuf::from("/opt/terraform"));
        assert_eq!(cfg.run_limits().stop_grace, Duration::from_secs(3));
        assert_eq!(cfg.reconcile.poll_interval_secs, 2);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[backend]\ntimeout_secs = 90\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.backend.timeout_secs, 90);
        assert_eq!(cfg.backend.binary, PathBuf::from("terraform"));
        assert_eq!(cfg.reconcile.marker_name, "d8-cluster-is-bootstraped");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[backend]\ntimeout_secs = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }
}
