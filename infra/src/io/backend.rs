//! Backend abstraction for infrastructure-as-code invocations.
//!
//! The [`Backend`] trait decouples runners from the actual tool (currently
//! `terraform`). Tests use scripted backends that return predetermined
//! outputs without spawning processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::BackendMode;
use crate::error::{InfraError, PreconditionError};
use crate::io::process::{
    CommandOutput, RunLimits, StopHandle, Termination, run_command_cancellable,
};

/// Parameters for one backend invocation.
#[derive(Debug, Clone)]
pub struct BackendRequest<'a> {
    pub slot: &'a str,
    pub mode: BackendMode,
    /// Directory holding the backend module for this slot.
    pub step_dir: &'a Path,
    /// State to start from; `None` means empty state.
    pub prior_state: Option<&'a [u8]>,
    pub variables: &'a BTreeMap<String, Value>,
    /// Mutating modes require this to be set; approval happens upstream.
    pub auto_approve: bool,
    pub timeout: Duration,
}

/// Result of a successful backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    /// New state after a mutating run; `None` for plans.
    pub state: Option<Vec<u8>>,
    /// Whether a plan found anything to do. Always `true` for mutating runs.
    pub has_changes: bool,
    /// Human-readable backend output.
    pub output: String,
}

/// Abstraction over infrastructure-as-code backends.
pub trait Backend: Send + Sync {
    /// Run the backend once. Must observe `stop` promptly.
    fn invoke(
        &self,
        request: &BackendRequest<'_>,
        stop: &StopHandle,
    ) -> Result<BackendOutput, InfraError>;
}

/// Backend that drives the `terraform` CLI.
///
/// Each slot gets a private run directory under `work_dir` holding the
/// variables file, the state file and terraform's data dir, so the module
/// directory itself is never written to.
#[derive(Debug, Clone)]
pub struct TerraformBackend {
    binary: PathBuf,
    work_dir: PathBuf,
    limits: RunLimits,
}

struct RunFiles {
    data_dir: PathBuf,
    vars_path: PathBuf,
    state_path: PathBuf,
}

impl TerraformBackend {
    pub fn new(
        binary: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        limits: RunLimits,
    ) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            limits,
        }
    }

    fn prepare(&self, request: &BackendRequest<'_>) -> Result<RunFiles, InfraError> {
        let run_dir = self.work_dir.join(request.slot);
        let fail = |what: &str, path: &Path, err: std::io::Error| {
            InfraError::backend(
                request.slot,
                request.mode.phase(),
                None,
                format!("{what} {}: {err}", path.display()),
            )
        };
        fs::create_dir_all(&run_dir).map_err(|err| fail("create run dir", &run_dir, err))?;

        let vars_path = run_dir.join("variables.tfvars.json");
        let vars = serde_json::to_vec_pretty(request.variables).map_err(|err| {
            InfraError::backend(
                request.slot,
                request.mode.phase(),
                None,
                format!("serialize variables: {err}"),
            )
        })?;
        fs::write(&vars_path, vars).map_err(|err| fail("write variables", &vars_path, err))?;

        let state_path = run_dir.join("terraform.tfstate");
        match request.prior_state {
            Some(state) => {
                fs::write(&state_path, state)
                    .map_err(|err| fail("write prior state", &state_path, err))?;
            }
            None => {
                if state_path.exists() {
                    fs::remove_file(&state_path)
                        .map_err(|err| fail("remove stale state", &state_path, err))?;
                }
            }
        }

        Ok(RunFiles {
            data_dir: run_dir.join(".terraform"),
            vars_path,
            state_path,
        })
    }

    fn command(&self, request: &BackendRequest<'_>, files: &RunFiles) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("-chdir={}", request.step_dir.display()))
            .env("TF_DATA_DIR", &files.data_dir)
            .env("TF_IN_AUTOMATION", "1");
        cmd
    }

    fn run(
        &self,
        request: &BackendRequest<'_>,
        cmd: Command,
        deadline: Instant,
        stop: &StopHandle,
    ) -> Result<CommandOutput, InfraError> {
        let phase = request.mode.phase();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(InfraError::BackendTimeout {
                slot: request.slot.to_string(),
                phase,
                timeout: request.timeout,
            });
        }
        let limits = RunLimits {
            timeout: remaining,
            ..self.limits
        };
        let output = run_command_cancellable(cmd, limits, stop).map_err(|err| {
            InfraError::backend(request.slot, phase, None, format!("{err:#}"))
        })?;
        match output.termination {
            Termination::TimedOut => Err(InfraError::BackendTimeout {
                slot: request.slot.to_string(),
                phase,
                timeout: request.timeout,
            }),
            Termination::Stopped => Err(InfraError::Canceled {
                slot: request.slot.to_string(),
                phase,
            }),
            Termination::Exited => Ok(output),
        }
    }
}

impl Backend for TerraformBackend {
    #[instrument(skip_all, fields(slot = request.slot, mode = ?request.mode))]
    fn invoke(
        &self,
        request: &BackendRequest<'_>,
        stop: &StopHandle,
    ) -> Result<BackendOutput, InfraError> {
        let phase = request.mode.phase();
        if request.mode.is_mutating() && !request.auto_approve {
            return Err(PreconditionError::ConfirmationUnavailable {
                operation: format!("{phase} {}", request.slot),
            }
            .into());
        }
        if !request.step_dir.is_dir() {
            return Err(InfraError::backend(
                request.slot,
                phase,
                None,
                format!("module directory {} does not exist", request.step_dir.display()),
            ));
        }

        // One deadline covers init and the main command together.
        let deadline = Instant::now() + request.timeout;
        let files = self.prepare(request)?;

        let mut init = self.command(request, &files);
        init.args(["init", "-input=false", "-no-color"]);
        debug!("running terraform init");
        let output = self.run(request, init, deadline, stop)?;
        if !output.success() {
            return Err(InfraError::backend(
                request.slot,
                phase,
                output.status.code(),
                format!("terraform init: {}", output.diagnostics()),
            ));
        }

        let mut cmd = self.command(request, &files);
        match request.mode {
            BackendMode::Plan | BackendMode::PlanDestroy => {
                cmd.args([
                    "plan",
                    "-input=false",
                    "-no-color",
                    "-detailed-exitcode",
                    "-lock=false",
                ]);
                if request.mode == BackendMode::PlanDestroy {
                    cmd.arg("-destroy");
                }
            }
            BackendMode::Apply => {
                cmd.args(["apply", "-input=false", "-no-color", "-auto-approve"]);
            }
            BackendMode::Destroy => {
                cmd.args(["destroy", "-input=false", "-no-color", "-auto-approve"]);
            }
        }
        cmd.arg(format!("-state={}", files.state_path.display()))
            .arg(format!("-var-file={}", files.vars_path.display()));

        info!("running terraform");
        let output = self.run(request, cmd, deadline, stop)?;
        let code = output.status.code();

        if !request.mode.is_mutating() {
            // -detailed-exitcode: 0 = no changes, 2 = changes present.
            return match code {
                Some(0) | Some(2) => Ok(BackendOutput {
                    state: None,
                    has_changes: code == Some(2),
                    output: output.stdout_lossy(),
                }),
                _ => Err(InfraError::backend(request.slot, phase, code, output.diagnostics())),
            };
        }

        if !output.success() {
            warn!(exit_code = ?code, "terraform failed");
            return Err(InfraError::backend(request.slot, phase, code, output.diagnostics()));
        }

        let state = fs::read(&files.state_path).map_err(|err| {
            InfraError::backend(
                request.slot,
                phase,
                code,
                format!("read resulting state {}: {err}", files.state_path.display()),
            )
        })?;
        Ok(BackendOutput {
            state: Some(state),
            has_changes: true,
            output: output.stdout_lossy(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// Write a fake `terraform` script that records its arguments.
    fn fake_terraform(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("terraform");
        let script = format!("#!/bin/sh\necho \"$@\" >> \"{}/calls.log\"\n{body}\n", dir.display());
        fs::write(&path, script).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn limits() -> RunLimits {
        RunLimits {
            timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(1),
            output_limit_bytes: 100_000,
        }
    }

    fn request<'a>(
        mode: BackendMode,
        step_dir: &'a Path,
        vars: &'a BTreeMap<String, Value>,
        prior: Option<&'a [u8]>,
    ) -> BackendRequest<'a> {
        BackendRequest {
            slot: "base-infrastructure",
            mode,
            step_dir,
            prior_state: prior,
            variables: vars,
            auto_approve: true,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn apply_writes_inputs_and_reads_back_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step_dir = temp.path().join("module");
        fs::create_dir_all(&step_dir).expect("mkdir");
        let binary = fake_terraform(
            temp.path(),
            r#"for arg in "$@"; do case "$arg" in -state=*) state="${arg#-state=}";; esac; done
if [ -n "$state" ]; then cat "$state" > "$state.prev" 2>/dev/null; echo '{"resources":[]}' > "$state"; fi
echo "Apply complete! Resources: 1 added, 0 changed, 0 destroyed.""#,
        );
        let backend = TerraformBackend::new(binary, temp.path().join("work"), limits());
        let mut vars = BTreeMap::new();
        vars.insert("clusterName".to_string(), Value::String("c1".into()));

        let out = backend
            .invoke(
                &request(BackendMode::Apply, &step_dir, &vars, Some(b"PRIOR")),
                &StopHandle::new(),
            )
            .expect("apply");

        assert_eq!(out.state.as_deref(), Some(&b"{\"resources\":[]}\n"[..]));
        assert!(out.output.contains("Apply complete!"));
        let run_dir = temp.path().join("work").join("base-infrastructure");
        assert_eq!(
            fs::read(run_dir.join("terraform.tfstate.prev")).expect("prev"),
            b"PRIOR"
        );
        let vars_file = fs::read_to_string(run_dir.join("variables.tfvars.json")).expect("vars");
        assert!(vars_file.contains("\"clusterName\": \"c1\""));
        let calls = fs::read_to_string(temp.path().join("calls.log")).expect("calls");
        assert!(calls.lines().next().expect("init").contains("init"));
        assert!(calls.contains("apply -input=false -no-color -auto-approve"));
    }

    #[test]
    fn plan_exit_code_two_means_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step_dir = temp.path().join("module");
        fs::create_dir_all(&step_dir).expect("mkdir");
        let binary = fake_terraform(
            temp.path(),
            r#"case "$2" in plan) echo "Plan: 1 to add, 0 to change, 0 to destroy."; exit 2;; esac"#,
        );
        let backend = TerraformBackend::new(binary, temp.path().join("work"), limits());
        let vars = BTreeMap::new();

        let out = backend
            .invoke(
                &request(BackendMode::Plan, &step_dir, &vars, None),
                &StopHandle::new(),
            )
            .expect("plan");
        assert!(out.has_changes);
        assert_eq!(out.state, None);
    }

    #[test]
    fn non_zero_exit_is_backend_error_with_diagnostics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step_dir = temp.path().join("module");
        fs::create_dir_all(&step_dir).expect("mkdir");
        let binary = fake_terraform(
            temp.path(),
            r#"case "$2" in destroy) echo "Error: quota exceeded" >&2; exit 1;; esac"#,
        );
        let backend = TerraformBackend::new(binary, temp.path().join("work"), limits());
        let vars = BTreeMap::new();

        let err = backend
            .invoke(
                &request(BackendMode::Destroy, &step_dir, &vars, None),
                &StopHandle::new(),
            )
            .unwrap_err();
        match err {
            InfraError::BackendExecution {
                code, diagnostics, ..
            } => {
                assert_eq!(code, Some(1));
                assert!(diagnostics.contains("quota exceeded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mutating_run_without_approval_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = TerraformBackend::new("terraform", temp.path(), limits());
        let vars = BTreeMap::new();
        let mut req = request(BackendMode::Destroy, temp.path(), &vars, None);
        req.auto_approve = false;
        let err = backend.invoke(&req, &StopHandle::new()).unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn deadline_maps_to_timeout_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step_dir = temp.path().join("module");
        fs::create_dir_all(&step_dir).expect("mkdir");
        let binary = fake_terraform(temp.path(), r#"case "$2" in apply) exec sleep 30;; esac"#);
        let backend = TerraformBackend::new(binary, temp.path().join("work"), limits());
        let vars = BTreeMap::new();
        let mut req = request(BackendMode::Apply, &step_dir, &vars, None);
        req.timeout = Duration::from_millis(300);

        let err = backend.invoke(&req, &StopHandle::new()).unwrap_err();
        assert!(matches!(err, InfraError::BackendTimeout { .. }), "{err}");
    }

    #[test]
    fn init_and_main_command_share_one_deadline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let step_dir = temp.path().join("module");
        fs::create_dir_all(&step_dir).expect("mkdir");
        let binary = fake_terraform(temp.path(), "exec sleep 0.7");
        let backend = TerraformBackend::new(binary, temp.path().join("work"), limits());
        let vars = BTreeMap::new();
        let mut req = request(BackendMode::Apply, &step_dir, &vars, None);
        req.timeout = Duration::from_secs(1);

        let started = Instant::now();
        let err = backend.invoke(&req, &StopHandle::new()).unwrap_err();
        assert!(matches!(err, InfraError::BackendTimeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_millis(1400));
    }
}
