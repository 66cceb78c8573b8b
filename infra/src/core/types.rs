//! Shared value types passed between the core, the backend and the
//! orchestration layers.

use serde::{Deserialize, Serialize};

use crate::error::Phase;

/// Mode a backend invocation runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Non-mutating diff against the prior state.
    Plan,
    /// Non-mutating diff of what a destroy would remove.
    PlanDestroy,
    Apply,
    Destroy,
}

impl BackendMode {
    pub fn is_mutating(self) -> bool {
        matches!(self, BackendMode::Apply | BackendMode::Destroy)
    }

    pub fn phase(self) -> Phase {
        match self {
            BackendMode::Plan | BackendMode::PlanDestroy => Phase::Plan,
            BackendMode::Apply => Phase::Apply,
            BackendMode::Destroy => Phase::Destroy,
        }
    }

    /// The non-mutating mode used to preview this one before approval.
    pub fn preview(self) -> BackendMode {
        match self {
            BackendMode::Destroy | BackendMode::PlanDestroy => BackendMode::PlanDestroy,
            BackendMode::Apply | BackendMode::Plan => BackendMode::Plan,
        }
    }
}

/// Resource change counts reported by a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub add: u32,
    pub change: u32,
    pub destroy: u32,
}

impl ChangeCounts {
    pub fn is_empty(&self) -> bool {
        self.add == 0 && self.change == 0 && self.destroy == 0
    }
}

/// Outcome of a non-mutating backend run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResult {
    pub slot: String,
    pub has_changes: bool,
    pub counts: ChangeCounts,
    /// Human-readable diff description as printed by the backend.
    pub summary: String,
}

/// Readiness facts about one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFact {
    pub name: String,
    pub is_control_plane: bool,
    pub ready: bool,
}

/// The set of node facts observed at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationBatch {
    pub nodes: Vec<NodeFact>,
}

impl ObservationBatch {
    pub fn new(nodes: Vec<NodeFact>) -> Self {
        Self { nodes }
    }
}
