//! Lifecycle pipelines: bootstrap and destroy of a cluster's base
//! infrastructure.
//!
//! A [`Pipeline`] runs once. It checks its preconditions, builds an
//! [`InfraRunner`], runs the mutating operation and verifies the result.
//! Retrying means constructing a new pipeline; progress carries over through
//! the state cache.

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument};

use crate::core::lifecycle::PipelineState;
use crate::core::tfstate::managed_resource_count;
use crate::error::{InfraError, PreconditionError};
use crate::io::approval::Approver;
use crate::io::backend::Backend;
use crate::io::state_cache::StateCache;
use crate::runner::{InfraRunner, RunOutcome, RunnerConfig, RunnerConfigBuilder};
use crate::shutdown::ShutdownRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Bootstrap,
    Destroy,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Bootstrap => f.write_str("bootstrap"),
            PipelineKind::Destroy => f.write_str("destroy"),
        }
    }
}

/// Where caller-supplied state comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateSource {
    None,
    File(PathBuf),
    Stdin,
}

impl StateSource {
    /// Resolve the mutually exclusive `--state-file` / `--state-stdin` flags.
    pub fn from_flags(
        state_file: Option<PathBuf>,
        state_stdin: bool,
    ) -> Result<Self, PreconditionError> {
        match (state_file, state_stdin) {
            (Some(_), true) => Err(PreconditionError::ConflictingInputs {
                first: "--state-file",
                second: "--state-stdin",
            }),
            (Some(path), false) => Ok(StateSource::File(path)),
            (None, true) => Ok(StateSource::Stdin),
            (None, false) => Ok(StateSource::None),
        }
    }

    /// Read the state. `stdin` is only consumed for [`StateSource::Stdin`].
    pub fn read(&self, mut stdin: impl Read) -> Result<Option<Vec<u8>>> {
        match self {
            StateSource::None => Ok(None),
            StateSource::File(path) => fs::read(path)
                .map(Some)
                .with_context(|| format!("read state file {}", path.display())),
            StateSource::Stdin => {
                let mut buf = Vec::new();
                stdin.read_to_end(&mut buf).context("read state from stdin")?;
                Ok(Some(buf))
            }
        }
    }
}

/// Collaborators a pipeline runs against.
pub struct PipelineContext<'a> {
    pub backend: &'a dyn Backend,
    pub cache: &'a dyn StateCache,
    pub approver: &'a dyn Approver,
    pub registry: &'a Arc<ShutdownRegistry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// e.g. `Kubernetes cluster: Destroy complete! Resources: 3 destroyed.`
    pub description: String,
    pub state: Option<Vec<u8>>,
}

pub struct Pipeline {
    kind: PipelineKind,
    label: String,
    runner: RunnerConfigBuilder,
    sanity_check: bool,
    caller_state: Option<Vec<u8>>,
    clean_cache_on_success: bool,
    state: PipelineState,
}

impl Pipeline {
    pub fn bootstrap(label: &str, runner: RunnerConfigBuilder) -> Self {
        Self::new(PipelineKind::Bootstrap, label, runner)
    }

    /// Destroy pipeline. Deletes the slot from the cache after a verified
    /// teardown unless [`clean_cache_on_success`](Self::clean_cache_on_success)
    /// turns that off.
    pub fn destroy(label: &str, runner: RunnerConfigBuilder) -> Self {
        Self::new(PipelineKind::Destroy, label, runner)
    }

    fn new(kind: PipelineKind, label: &str, runner: RunnerConfigBuilder) -> Self {
        Self {
            kind,
            label: label.to_string(),
            runner,
            sanity_check: false,
            caller_state: None,
            clean_cache_on_success: kind == PipelineKind::Destroy,
            state: PipelineState::Pending,
        }
    }

    /// Require interactive confirmation before the mutating step.
    pub fn sanity_check(mut self, enabled: bool) -> Self {
        self.sanity_check = enabled;
        self
    }

    /// State supplied by the caller. Seeds the cache only if the slot is
    /// empty; an existing cached snapshot always wins.
    pub fn caller_state(mut self, state: Option<Vec<u8>>) -> Self {
        self.caller_state = state;
        self
    }

    pub fn clean_cache_on_success(mut self, enabled: bool) -> Self {
        self.clean_cache_on_success = enabled;
        self
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn name(&self) -> String {
        format!("{} {}", self.kind, self.label)
    }

    fn transition(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal pipeline transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "pipeline transition");
        self.state = next;
    }

    #[instrument(skip_all, fields(pipeline = %self.name()))]
    pub fn run(&mut self, ctx: &PipelineContext<'_>) -> Result<PipelineOutcome, InfraError> {
        if self.state != PipelineState::Pending {
            return Err(PreconditionError::PipelineFinished { name: self.name() }.into());
        }

        self.transition(PipelineState::PreconditionCheck);
        let config = match self.check_preconditions(ctx) {
            Ok(config) => config,
            Err(err) => {
                error!(err = %err, "precondition failed");
                self.transition(PipelineState::Failed);
                return Err(err);
            }
        };

        self.transition(PipelineState::Executing);
        info!("executing");
        match self.execute(config, ctx) {
            Ok(outcome) => {
                self.transition(PipelineState::Succeeded);
                info!(description = %outcome.description, "pipeline succeeded");
                Ok(outcome)
            }
            Err(err) => {
                self.transition(PipelineState::Failed);
                error!(err = %err, "pipeline failed");
                Err(err)
            }
        }
    }

    fn check_preconditions(&self, ctx: &PipelineContext<'_>) -> Result<RunnerConfig, InfraError> {
        let config = self
            .runner
            .clone()
            .allow_cached_state(true)
            .auto_approve(!self.sanity_check)
            .build()?;

        if self.sanity_check && !ctx.approver.is_available() {
            return Err(PreconditionError::ConfirmationUnavailable {
                operation: self.name(),
            }
            .into());
        }

        if let Some(state) = &self.caller_state {
            if !ctx.cache.save_if_absent(config.slot(), state)? {
                debug!(
                    slot = config.slot(),
                    "slot already cached, caller-supplied state ignored"
                );
            }
        }
        Ok(config)
    }

    fn execute(
        &self,
        config: RunnerConfig,
        ctx: &PipelineContext<'_>,
    ) -> Result<PipelineOutcome, InfraError> {
        let slot = config.slot().to_string();
        let runner = InfraRunner::new(config, ctx.backend, ctx.cache, ctx.approver, ctx.registry);
        let outcome = match self.kind {
            PipelineKind::Bootstrap => runner.apply()?,
            PipelineKind::Destroy => runner.destroy()?,
        };
        drop(runner);

        match self.kind {
            PipelineKind::Bootstrap => self.verify_bootstrap(&slot, &outcome, ctx)?,
            PipelineKind::Destroy => self.verify_destroy(&slot, &outcome, ctx)?,
        }

        Ok(PipelineOutcome {
            description: format!("{}: {}", self.label, outcome.description),
            state: outcome.state,
        })
    }

    fn verify_bootstrap(
        &self,
        slot: &str,
        outcome: &RunOutcome,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), InfraError> {
        if outcome.changed && !ctx.cache.exists(slot) {
            return Err(InfraError::Verification {
                slot: slot.to_string(),
                reason: "resulting state was not cached".to_string(),
            });
        }
        Ok(())
    }

    fn verify_destroy(
        &self,
        slot: &str,
        outcome: &RunOutcome,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), InfraError> {
        if let Some(state) = outcome.state.as_deref().filter(|s| !s.is_empty()) {
            match managed_resource_count(state) {
                Some(0) => {}
                Some(remaining) => {
                    return Err(InfraError::Verification {
                        slot: slot.to_string(),
                        reason: format!("{remaining} managed resources remain after destroy"),
                    });
                }
                None => {
                    return Err(InfraError::Verification {
                        slot: slot.to_string(),
                        reason: "resulting state is not a readable state document".to_string(),
                    });
                }
            }
        }
        if self.clean_cache_on_success {
            ctx.cache.delete(slot)?;
            info!(slot, "cached state removed after teardown");
        }
        Ok(())
    }
}
