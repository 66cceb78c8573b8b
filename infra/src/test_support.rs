//! Test-only fakes and fixtures: scripted backend, approver and marker store,
//! node helpers and a temporary workspace with a state cache.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::core::types::{BackendMode, NodeFact, ObservationBatch, PlanResult};
use crate::error::{InfraError, PreconditionError};
use crate::io::approval::Approver;
use crate::io::backend::{Backend, BackendOutput, BackendRequest};
use crate::io::marker::MarkerStore;
use crate::io::process::StopHandle;
use crate::io::state_cache::FsStateCache;
use crate::runner::{RunnerConfig, RunnerConfigBuilder};

pub const TEST_CLUSTER: &str = "test-cluster";

/// Canned plan output, with or without pending changes.
pub fn plan_output(has_changes: bool) -> BackendOutput {
    let output = if has_changes {
        "Terraform will perform the following actions:\n\n  \
         # openstack_compute_instance_v2.master[0] will be created\n\n\
         Plan: 3 to add, 0 to change, 0 to destroy.\n"
    } else {
        "No changes. Your infrastructure matches the configuration.\n"
    };
    BackendOutput {
        state: None,
        has_changes,
        output: output.to_string(),
    }
}

pub fn apply_output(state: &[u8]) -> BackendOutput {
    BackendOutput {
        state: Some(state.to_vec()),
        has_changes: true,
        output: "Apply complete! Resources: 3 added, 0 changed, 0 destroyed.\n".to_string(),
    }
}

pub fn destroy_output(state: &[u8]) -> BackendOutput {
    BackendOutput {
        state: Some(state.to_vec()),
        has_changes: true,
        output: "Destroy complete! Resources: 3 destroyed.\n".to_string(),
    }
}

/// What a [`ScriptedBackend`] does for one invocation.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Output(BackendOutput),
    Fail {
        code: Option<i32>,
        diagnostics: String,
    },
    Timeout,
    /// Block until the runner's stop handle is triggered, then report
    /// cancellation.
    BlockUntilStopped,
}

/// One recorded backend invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub slot: String,
    pub mode: BackendMode,
    pub step_dir: PathBuf,
    pub prior_state: Option<Vec<u8>>,
    pub variables: BTreeMap<String, Value>,
    pub auto_approve: bool,
}

/// Backend that replays queued responses in order.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Poll until at least `count` invocations have started.
    pub fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.calls.lock().expect("calls lock").len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Backend for ScriptedBackend {
    fn invoke(
        &self,
        request: &BackendRequest<'_>,
        stop: &StopHandle,
    ) -> Result<BackendOutput, InfraError> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            slot: request.slot.to_string(),
            mode: request.mode,
            step_dir: request.step_dir.to_path_buf(),
            prior_state: request.prior_state.map(<[u8]>::to_vec),
            variables: request.variables.clone(),
            auto_approve: request.auto_approve,
        });
        let next = self.responses.lock().expect("responses lock").pop_front();
        let phase = request.mode.phase();
        match next {
            Some(ScriptedResponse::Output(output)) => Ok(output),
            Some(ScriptedResponse::Fail { code, diagnostics }) => {
                Err(InfraError::backend(request.slot, phase, code, diagnostics))
            }
            Some(ScriptedResponse::Timeout) => Err(InfraError::BackendTimeout {
                slot: request.slot.to_string(),
                phase,
                timeout: request.timeout,
            }),
            Some(ScriptedResponse::BlockUntilStopped) => {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !stop.is_requested() {
                    if Instant::now() >= deadline {
                        return Err(InfraError::BackendTimeout {
                            slot: request.slot.to_string(),
                            phase,
                            timeout: Duration::from_secs(10),
                        });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(InfraError::Canceled {
                    slot: request.slot.to_string(),
                    phase,
                })
            }
            None => Err(InfraError::backend(
                request.slot,
                phase,
                None,
                "scripted backend has no response left",
            )),
        }
    }
}

/// Approver with a fixed availability and answer that records every prompt.
#[derive(Debug, Default)]
pub struct ScriptedApprover {
    available: bool,
    answer: bool,
    asked: Mutex<Vec<String>>,
}

impl ScriptedApprover {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn answering(answer: bool) -> Self {
        Self {
            available: true,
            answer,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().expect("asked lock").clone()
    }
}

impl Approver for ScriptedApprover {
    fn is_available(&self) -> bool {
        self.available
    }

    fn approve(&self, operation: &str, _plan: &PlanResult) -> Result<bool, InfraError> {
        if !self.available {
            return Err(PreconditionError::ConfirmationUnavailable {
                operation: operation.to_string(),
            }
            .into());
        }
        self.asked
            .lock()
            .expect("asked lock")
            .push(operation.to_string());
        Ok(self.answer)
    }
}

#[derive(Debug, Default)]
struct MarkerState {
    exists: bool,
    exists_calls: usize,
    create_calls: usize,
    fail_exists: usize,
    fail_create: usize,
}

/// In-memory marker store. Clones share state so tests can inspect it after
/// handing a clone to the reconciler.
#[derive(Debug, Clone, Default)]
pub struct MemoryMarkerStore {
    state: Arc<Mutex<MarkerState>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn existing() -> Self {
        let store = Self::default();
        store.state.lock().expect("marker lock").exists = true;
        store
    }

    /// Make the next `n` `exists` queries fail.
    pub fn fail_next_exists(&self, n: usize) {
        self.state.lock().expect("marker lock").fail_exists = n;
    }

    /// Make the next `n` `create` calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().expect("marker lock").fail_create = n;
    }

    pub fn exists_now(&self) -> bool {
        self.state.lock().expect("marker lock").exists
    }

    pub fn exists_calls(&self) -> usize {
        self.state.lock().expect("marker lock").exists_calls
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().expect("marker lock").create_calls
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn exists(&self) -> Result<bool, InfraError> {
        let mut state = self.state.lock().expect("marker lock");
        state.exists_calls += 1;
        if state.fail_exists > 0 {
            state.fail_exists -= 1;
            return Err(InfraError::MarkerConflict {
                marker: "memory".to_string(),
                reason: "injected query failure".to_string(),
            });
        }
        Ok(state.exists)
    }

    fn create(&self) -> Result<bool, InfraError> {
        let mut state = self.state.lock().expect("marker lock");
        state.create_calls += 1;
        if state.fail_create > 0 {
            state.fail_create -= 1;
            return Err(InfraError::MarkerConflict {
                marker: "memory".to_string(),
                reason: "injected create failure".to_string(),
            });
        }
        let created = !state.exists;
        state.exists = true;
        Ok(created)
    }
}

pub fn master(name: &str, ready: bool) -> NodeFact {
    NodeFact {
        name: name.to_string(),
        is_control_plane: true,
        ready,
    }
}

pub fn worker(name: &str, ready: bool) -> NodeFact {
    NodeFact {
        name: name.to_string(),
        is_control_plane: false,
        ready,
    }
}

pub fn batch(nodes: Vec<NodeFact>) -> ObservationBatch {
    ObservationBatch::new(nodes)
}

/// Temporary directory with a state cache for [`TEST_CLUSTER`].
pub struct TestWorkspace {
    temp: tempfile::TempDir,
    pub cache: FsStateCache,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let cache = FsStateCache::new(temp.path().join("state"), TEST_CLUSTER);
        Ok(Self { temp, cache })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Builder for `slot` with a step dir inside the workspace.
    pub fn runner_config(&self, slot: &str) -> RunnerConfigBuilder {
        RunnerConfig::builder(TEST_CLUSTER, slot)
            .step_dir(self.temp.path().join("layouts").join(slot))
            .variable("clusterName", TEST_CLUSTER)
    }
}
