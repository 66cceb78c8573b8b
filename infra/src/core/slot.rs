//! Slot name rules.

use crate::error::PreconditionError;

/// Slot used for the cluster's base infrastructure.
pub const BASE_INFRASTRUCTURE: &str = "base-infrastructure";

/// Slot names map directly to file names, so only `[A-Za-z0-9._-]` is allowed.
pub fn validate_slot(slot: &str) -> Result<(), PreconditionError> {
    let invalid = |reason: &str| PreconditionError::InvalidSlot {
        slot: slot.to_string(),
        reason: reason.to_string(),
    };
    if slot.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if slot.contains('/') {
        return Err(invalid("must not contain '/'"));
    }
    if slot == "." || slot == ".." {
        return Err(invalid("must not be a relative path component"));
    }
    if slot
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(invalid("must be [A-Za-z0-9._-] only"));
    }
    Ok(())
}
