//! Error kinds surfaced by the orchestration core.
//!
//! Callers branch on the variant: precondition failures need operator
//! correction, backend failures may be retried after inspection, timeouts may
//! be retried with a longer deadline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Stage of an operation an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Precondition,
    Plan,
    Apply,
    Destroy,
    LoadState,
    SaveState,
    Verify,
    Reconcile,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Precondition => "precondition",
            Phase::Plan => "plan",
            Phase::Apply => "apply",
            Phase::Destroy => "destroy",
            Phase::LoadState => "load-state",
            Phase::SaveState => "save-state",
            Phase::Verify => "verify",
            Phase::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

/// Conditions that must hold before anything is executed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("You have specified both {first} and {second}. Leave only one of them.")]
    ConflictingInputs {
        first: &'static str,
        second: &'static str,
    },
    #[error("confirmation required for '{operation}' but no confirmation mechanism is available")]
    ConfirmationUnavailable { operation: String },
    #[error("'{operation}' was not confirmed")]
    ConfirmationDeclined { operation: String },
    #[error("invalid slot name '{slot}': {reason}")]
    InvalidSlot { slot: String, reason: String },
    #[error("invalid runner configuration: {0}")]
    InvalidConfig(String),
    #[error("pipeline '{name}' already finished; construct a new pipeline to retry")]
    PipelineFinished { name: String },
}

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("state cache {op} failed for slot '{slot}' at {}: {source}", path.display())]
    Io {
        slot: String,
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend {phase} failed for slot '{slot}' (exit code {code:?}): {diagnostics}")]
    BackendExecution {
        slot: String,
        phase: Phase,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("backend {phase} for slot '{slot}' timed out after {timeout:?}")]
    BackendTimeout {
        slot: String,
        phase: Phase,
        timeout: Duration,
    },

    #[error("backend {phase} for slot '{slot}' was canceled")]
    Canceled { slot: String, phase: Phase },

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("marker '{marker}' could not be created: {reason}")]
    MarkerConflict { marker: String, reason: String },

    #[error("verification of slot '{slot}' failed: {reason}")]
    Verification { slot: String, reason: String },
}

impl InfraError {
    pub fn backend(
        slot: impl Into<String>,
        phase: Phase,
        code: Option<i32>,
        diagnostics: impl Into<String>,
    ) -> Self {
        InfraError::BackendExecution {
            slot: slot.into(),
            phase,
            code,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, InfraError::Precondition(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_inputs_names_both_flags() {
        let err = InfraError::from(PreconditionError::ConflictingInputs {
            first: "--state-file",
            second: "--state-stdin",
        });
        let msg = err.to_string();
        assert!(msg.contains("--state-file"));
        assert!(msg.contains("--state-stdin"));
        assert!(err.is_precondition());
    }

    #[test]
    fn backend_error_carries_slot_and_phase() {
        let err = InfraError::backend("base-infrastructure", Phase::Destroy, Some(1), "boom");
        let msg = err.to_string();
        assert!(msg.contains("base-infrastructure"));
        assert!(msg.contains("destroy"));
        assert!(msg.contains("boom"));
        assert!(!err.is_precondition());
    }
}
