//! Stable exit codes for `infractl` commands.

use crate::error::{InfraError, PreconditionError};

/// Command succeeded.
pub const OK: i32 = 0;
/// Backend failure, I/O failure, failed verification or any other error.
pub const FAILED: i32 = 1;
/// A precondition did not hold; nothing was executed.
pub const PRECONDITION: i32 = 2;
/// The backend exceeded its deadline.
pub const TIMEOUT: i32 = 3;
/// The run was canceled by a termination signal.
pub const CANCELED: i32 = 4;

/// Exit code for an error surfaced by a command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(infra) = cause.downcast_ref::<InfraError>() {
            return match infra {
                InfraError::Precondition(_) => PRECONDITION,
                InfraError::BackendTimeout { .. } => TIMEOUT,
                InfraError::Canceled { .. } => CANCELED,
                _ => FAILED,
            };
        }
        if cause.downcast_ref::<PreconditionError>().is_some() {
            return PRECONDITION;
        }
    }
    FAILED
}
