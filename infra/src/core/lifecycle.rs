//! Pipeline state machine.

use std::fmt;

/// States a pipeline moves through. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    PreconditionCheck,
    Executing,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Forward-only: `Pending -> PreconditionCheck -> Executing -> Succeeded`,
    /// with `Failed` reachable from either active state.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::{Executing, Failed, Pending, PreconditionCheck, Succeeded};
        matches!(
            (self, next),
            (Pending, PreconditionCheck)
                | (PreconditionCheck, Executing)
                | (PreconditionCheck, Failed)
                | (Executing, Succeeded)
                | (Executing, Failed)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Pending => "pending",
            PipelineState::PreconditionCheck => "precondition-check",
            PipelineState::Executing => "executing",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}
