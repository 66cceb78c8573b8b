//! One configured backend invocation bound to a cluster, a state slot and a
//! state cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::plan::{completion_line, parse_change_counts, plan_summary};
use crate::core::slot::validate_slot;
use crate::core::types::{BackendMode, PlanResult};
use crate::error::{InfraError, PreconditionError};
use crate::io::approval::Approver;
use crate::io::backend::{Backend, BackendOutput, BackendRequest};
use crate::io::process::StopHandle;
use crate::io::state_cache::StateCache;
use crate::shutdown::{ShutdownGuard, ShutdownRegistry};

/// Upper bound on how long [`InfraRunner::stop`] waits for the backend to go.
const STOP_WAIT: Duration = Duration::from_secs(120);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Immutable, validated description of one runner.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    cluster: String,
    slot: String,
    step_dir: PathBuf,
    variables: BTreeMap<String, Value>,
    allow_cached_state: bool,
    auto_approve: bool,
    timeout: Duration,
}

impl RunnerConfig {
    pub fn builder(cluster: &str, slot: &str) -> RunnerConfigBuilder {
        RunnerConfigBuilder {
            cluster: cluster.to_string(),
            slot: slot.to_string(),
            step_dir: None,
            variables: BTreeMap::new(),
            allow_cached_state: false,
            auto_approve: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn step_dir(&self) -> &Path {
        &self.step_dir
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn allow_cached_state(&self) -> bool {
        self.allow_cached_state
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Name the runner's stop callback is registered under.
    pub fn shutdown_name(&self) -> String {
        format!("{}/{}", self.cluster, self.slot)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfigBuilder {
    cluster: String,
    slot: String,
    step_dir: Option<PathBuf>,
    variables: BTreeMap<String, Value>,
    allow_cached_state: bool,
    auto_approve: bool,
    timeout: Duration,
}

impl RunnerConfigBuilder {
    pub fn step_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.step_dir = Some(dir.into());
        self
    }

    pub fn variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn variable(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    /// Start from the cached snapshot when the slot has one.
    pub fn allow_cached_state(mut self, allow: bool) -> Self {
        self.allow_cached_state = allow;
        self
    }

    /// Skip plan review and confirmation for mutating operations.
    pub fn auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn build(self) -> Result<RunnerConfig, PreconditionError> {
        validate_slot(&self.slot)?;
        validate_slot(&self.cluster).map_err(|err| {
            PreconditionError::InvalidConfig(format!("cluster name: {err}"))
        })?;
        let step_dir = self
            .step_dir
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or_else(|| PreconditionError::InvalidConfig("step_dir must be set".to_string()))?;
        if self.timeout.is_zero() {
            return Err(PreconditionError::InvalidConfig(
                "timeout must be > 0".to_string(),
            ));
        }
        Ok(RunnerConfig {
            cluster: self.cluster,
            slot: self.slot,
            step_dir,
            variables: self.variables,
            allow_cached_state: self.allow_cached_state,
            auto_approve: self.auto_approve,
            timeout: self.timeout,
        })
    }
}

/// Result of a mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// State after the run. `None` only when nothing ran and no prior state
    /// existed.
    pub state: Option<Vec<u8>>,
    /// The backend's own completion line, or a short description.
    pub description: String,
    /// False when the preview showed nothing to do and the run was skipped.
    pub changed: bool,
}

/// Runs the backend for one slot.
///
/// Registers its stop handle with the shutdown registry on construction and
/// deregisters when dropped.
pub struct InfraRunner<'a> {
    config: RunnerConfig,
    backend: &'a dyn Backend,
    cache: &'a dyn StateCache,
    approver: &'a dyn Approver,
    stop: StopHandle,
    _registration: ShutdownGuard,
}

impl<'a> InfraRunner<'a> {
    pub fn new(
        config: RunnerConfig,
        backend: &'a dyn Backend,
        cache: &'a dyn StateCache,
        approver: &'a dyn Approver,
        registry: &Arc<ShutdownRegistry>,
    ) -> Self {
        let stop = StopHandle::new();
        let weak = stop.downgrade();
        // Flag only. The owning thread interrupts the backend and waits for it.
        let registration = registry.register_on_shutdown(&config.shutdown_name(), move || {
            if let Some(handle) = weak.upgrade() {
                handle.raise();
            }
        });
        Self {
            config,
            backend,
            cache,
            approver,
            stop,
            _registration: registration,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Interrupt the in-flight backend run, if any, and wait for it to end.
    ///
    /// The cache is only written after a successful run, so a stopped run
    /// leaves it as it was.
    pub fn stop(&self) -> bool {
        info!(slot = %self.config.slot, "stopping runner");
        self.stop.request_stop(STOP_WAIT)
    }

    /// Non-mutating diff of what `apply` would do.
    #[instrument(skip_all, fields(cluster = %self.config.cluster, slot = %self.config.slot))]
    pub fn plan(&self) -> Result<PlanResult, InfraError> {
        let prior = self.prior_state()?;
        self.preview(BackendMode::Plan, prior.as_deref())
    }

    /// Non-mutating diff of what `destroy` would remove.
    #[instrument(skip_all, fields(cluster = %self.config.cluster, slot = %self.config.slot))]
    pub fn plan_destroy(&self) -> Result<PlanResult, InfraError> {
        let prior = self.prior_state()?;
        self.preview(BackendMode::PlanDestroy, prior.as_deref())
    }

    #[instrument(skip_all, fields(cluster = %self.config.cluster, slot = %self.config.slot))]
    pub fn apply(&self) -> Result<RunOutcome, InfraError> {
        self.mutate(BackendMode::Apply)
    }

    #[instrument(skip_all, fields(cluster = %self.config.cluster, slot = %self.config.slot))]
    pub fn destroy(&self) -> Result<RunOutcome, InfraError> {
        self.mutate(BackendMode::Destroy)
    }

    fn prior_state(&self) -> Result<Option<Vec<u8>>, InfraError> {
        if !self.config.allow_cached_state {
            return Ok(None);
        }
        let state = self.cache.load(&self.config.slot)?;
        if state.is_some() {
            debug!("starting from cached state");
        }
        Ok(state)
    }

    fn preview(&self, mode: BackendMode, prior: Option<&[u8]>) -> Result<PlanResult, InfraError> {
        let output = self.invoke(mode, prior)?;
        Ok(plan_result(&self.config.slot, &output))
    }

    fn mutate(&self, mode: BackendMode) -> Result<RunOutcome, InfraError> {
        let operation = format!("{} {}", mode.phase(), self.config.slot);
        let prior = self.prior_state()?;

        if !self.config.auto_approve {
            if !self.approver.is_available() {
                return Err(PreconditionError::ConfirmationUnavailable { operation }.into());
            }
            let plan = self.preview(mode.preview(), prior.as_deref())?;
            if !plan.has_changes {
                info!("no changes planned, skipping {}", mode.phase());
                return Ok(RunOutcome {
                    state: prior,
                    description: "No changes.".to_string(),
                    changed: false,
                });
            }
            if !self.approver.approve(&operation, &plan)? {
                warn!("{operation} declined");
                return Err(PreconditionError::ConfirmationDeclined { operation }.into());
            }
        }

        let output = self.invoke(mode, prior.as_deref())?;
        let state = output.state.ok_or_else(|| {
            InfraError::backend(
                &self.config.slot,
                mode.phase(),
                None,
                "backend reported success without a resulting state",
            )
        })?;
        self.cache.save(&self.config.slot, &state)?;
        let description = completion_line(&output.output)
            .unwrap_or_else(|| format!("{} complete", mode.phase()));
        info!(%description, "backend run finished");
        Ok(RunOutcome {
            state: Some(state),
            description,
            changed: true,
        })
    }

    fn invoke(&self, mode: BackendMode, prior: Option<&[u8]>) -> Result<BackendOutput, InfraError> {
        if self.stop.is_requested() {
            return Err(InfraError::Canceled {
                slot: self.config.slot.clone(),
                phase: mode.phase(),
            });
        }
        let request = BackendRequest {
            slot: &self.config.slot,
            mode,
            step_dir: &self.config.step_dir,
            prior_state: prior,
            variables: &self.config.variables,
            // Mutating runs only get here after gating above.
            auto_approve: mode.is_mutating(),
            timeout: self.config.timeout,
        };
        self.backend.invoke(&request, &self.stop)
    }
}

fn plan_result(slot: &str, output: &BackendOutput) -> PlanResult {
    PlanResult {
        slot: slot.to_string(),
        has_changes: output.has_changes,
        counts: parse_change_counts(&output.output).unwrap_or_default(),
        summary: plan_summary(&output.output),
    }
}
