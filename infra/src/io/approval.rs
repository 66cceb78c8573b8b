//! Confirmation gate in front of mutating backend runs.

use std::io::{BufRead, IsTerminal, Write};

use tracing::{debug, warn};

use crate::core::types::PlanResult;
use crate::error::{InfraError, PreconditionError};

/// Something that can confirm (or refuse) a planned change.
pub trait Approver: Send + Sync {
    /// Whether confirmation can be asked for at all (e.g. a terminal is attached).
    fn is_available(&self) -> bool;

    /// Ask whether `operation` may proceed given `plan`.
    fn approve(&self, operation: &str, plan: &PlanResult) -> Result<bool, InfraError>;
}

/// Asks on the controlling terminal. Unavailable when stdin is not a TTY.
pub struct TerminalApprover;

impl Approver for TerminalApprover {
    fn is_available(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn approve(&self, operation: &str, plan: &PlanResult) -> Result<bool, InfraError> {
        if !self.is_available() {
            return Err(PreconditionError::ConfirmationUnavailable {
                operation: operation.to_string(),
            }
            .into());
        }
        let unavailable = |err: std::io::Error| {
            warn!(err = %err, "cannot read confirmation");
            InfraError::from(PreconditionError::ConfirmationUnavailable {
                operation: operation.to_string(),
            })
        };
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{}\n", plan.summary).map_err(unavailable)?;
        write!(stderr, "Do you want to {operation}? [y/N]: ").map_err(unavailable)?;
        stderr.flush().map_err(unavailable)?;

        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(unavailable)?;
        let approved = is_affirmative(&answer);
        debug!(operation, approved, "confirmation answered");
        Ok(approved)
    }
}

/// Never available. Used for fully non-interactive runs.
pub struct NoApprover;

impl Approver for NoApprover {
    fn is_available(&self) -> bool {
        false
    }

    fn approve(&self, operation: &str, _plan: &PlanResult) -> Result<bool, InfraError> {
        Err(PreconditionError::ConfirmationUnavailable {
            operation: operation.to_string(),
        }
        .into())
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChangeCounts;

    #[test]
    fn only_yes_answers_approve() {
        assert!(is_affirmative("y\n"));
        assert!(is_affirmative("  YES "));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative("yess"));
    }

    #[test]
    fn no_approver_is_never_available() {
        let plan = PlanResult {
            slot: "base-infrastructure".to_string(),
            has_changes: true,
            counts: ChangeCounts::default(),
            summary: String::new(),
        };
        assert!(!NoApprover.is_available());
        let err = NoApprover.approve("destroy", &plan).unwrap_err();
        assert!(err.is_precondition());
    }
}
