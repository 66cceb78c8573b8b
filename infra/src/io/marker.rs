//! Durable "cluster is bootstrapped" marker.
//!
//! Creation is idempotent everywhere: finding the marker already present is
//! success, never an error.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::error::InfraError;
use crate::io::process::{RunLimits, StopHandle, run_command_cancellable};

/// Storage for the completion marker of one cluster.
pub trait MarkerStore: Send {
    /// Human-readable marker identity, for logs and errors.
    fn describe(&self) -> String;

    fn exists(&self) -> Result<bool, InfraError>;

    /// Create the marker. Returns `true` if this call created it, `false`
    /// if it was already there.
    fn create(&self) -> Result<bool, InfraError>;
}

/// Marker kept as a file on local disk.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn conflict(&self, reason: String) -> InfraError {
        InfraError::MarkerConflict {
            marker: self.describe(),
            reason,
        }
    }
}

impl MarkerStore for FileMarkerStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn exists(&self) -> Result<bool, InfraError> {
        match fs::metadata(&self.path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.conflict(format!("stat: {err}"))),
        }
    }

    fn create(&self) -> Result<bool, InfraError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| self.conflict(format!("create {}: {err}", parent.display())))?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                writeln!(file, "bootstrapped").map_err(|err| self.conflict(err.to_string()))?;
                info!(marker = %self.path.display(), "completion marker created");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(marker = %self.path.display(), "completion marker already exists");
                Ok(false)
            }
            Err(err) => Err(self.conflict(err.to_string())),
        }
    }
}

/// Marker kept as a ConfigMap, managed through `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlMarkerStore {
    kubectl: PathBuf,
    namespace: String,
    name: String,
    limits: RunLimits,
}

impl KubectlMarkerStore {
    pub fn new(kubectl: impl Into<PathBuf>, namespace: &str, name: &str) -> Self {
        Self {
            kubectl: kubectl.into(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            limits: RunLimits {
                timeout: Duration::from_secs(30),
                stop_grace: Duration::from_secs(2),
                output_limit_bytes: 64 * 1024,
            },
        }
    }

    fn kubectl(&self, args: &[&str]) -> Result<(bool, String, String), InfraError> {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("-n").arg(&self.namespace).args(args);
        let output = run_command_cancellable(cmd, self.limits, &StopHandle::new())
            .map_err(|err| InfraError::MarkerConflict {
                marker: self.describe(),
                reason: format!("{err:#}"),
            })?;
        Ok((
            output.success(),
            output.stdout_lossy(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

impl MarkerStore for KubectlMarkerStore {
    fn describe(&self) -> String {
        format!("configmap {}/{}", self.namespace, self.name)
    }

    #[instrument(skip_all, fields(marker = %self.describe()))]
    fn exists(&self) -> Result<bool, InfraError> {
        let (ok, stdout, stderr) = self.kubectl(&[
            "get",
            "configmap",
            &self.name,
            "-o",
            "name",
            "--ignore-not-found",
        ])?;
        if !ok {
            return Err(InfraError::MarkerConflict {
                marker: self.describe(),
                reason: format!("query failed: {}", stderr.trim()),
            });
        }
        Ok(!stdout.trim().is_empty())
    }

    #[instrument(skip_all, fields(marker = %self.describe()))]
    fn create(&self) -> Result<bool, InfraError> {
        let (ok, _stdout, stderr) = self.kubectl(&["create", "configmap", &self.name])?;
        if ok {
            info!("completion marker created");
            return Ok(true);
        }
        if is_already_exists(&stderr) {
            debug!("completion marker already exists");
            return Ok(false);
        }
        Err(InfraError::MarkerConflict {
            marker: self.describe(),
            reason: stderr.trim().to_string(),
        })
    }
}

fn is_already_exists(stderr: &str) -> bool {
    stderr.contains("AlreadyExists") || stderr.contains("already exists")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_marker_creation_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileMarkerStore::new(temp.path().join("markers/bootstrapped"));
        assert!(!store.exists().expect("exists"));
        assert!(store.create().expect("first create"));
        assert!(store.exists().expect("exists"));
        assert!(!store.create().expect("second create"));
        assert!(store.exists().expect("exists"));
    }

    #[test]
    fn recognizes_already_exists_errors() {
        assert!(is_already_exists(
            "Error from server (AlreadyExists): configmaps \"d8-cluster-is-bootstraped\" already exists"
        ));
        assert!(!is_already_exists("Error from server (Forbidden): nope"));
    }

    #[cfg(unix)]
    #[test]
    fn kubectl_marker_treats_already_exists_as_success() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("kubectl");
        fs::write(
            &script,
            "#!/bin/sh\ncase \"$3\" in\n  get) echo configmap/d8-cluster-is-bootstraped;;\n  create) echo 'Error from server (AlreadyExists): already exists' >&2; exit 1;;\nesac\n",
        )
        .expect("write script");
        let mut perms = fs::metadata(&script).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).expect("chmod");

        let store = KubectlMarkerStore::new(&script, "kube-system", "d8-cluster-is-bootstraped");
        assert!(store.exists().expect("exists"));
        assert!(!store.create().expect("create"));
    }
}
