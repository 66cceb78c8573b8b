//! Bootstrap-completion predicate.
//!
//! A cluster counts as bootstrapped once any node outside the control plane
//! reports Ready, or once the completion marker exists. The marker is the
//! durable source of truth: after it is written the live predicate no longer
//! matters.

use crate::core::types::ObservationBatch;

/// True if at least one non-control-plane node in the batch is Ready.
///
/// Control-plane nodes never count, whatever else they are tainted with. An
/// empty batch is simply `false`.
pub fn has_ready_non_control_node(batch: &ObservationBatch) -> bool {
    batch
        .nodes
        .iter()
        .any(|node| !node.is_control_plane && node.ready)
}

/// What the reconciler must do for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapDecision {
    /// The marker has to be written during this batch.
    pub create_marker: bool,
    /// Value to emit downstream.
    pub completed: bool,
}

/// Combine marker existence with the live predicate.
pub fn decide(marker_exists: bool, batch: &ObservationBatch) -> BootstrapDecision {
    if marker_exists {
        return BootstrapDecision {
            create_marker: false,
            completed: true,
        };
    }
    let ready = has_ready_non_control_node(batch);
    BootstrapDecision {
        create_marker: ready,
        completed: ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NodeFact;

    fn node(name: &str, is_control_plane: bool, ready: bool) -> NodeFact {
        NodeFact {
            name: name.to_string(),
            is_control_plane,
            ready,
        }
    }

    #[test]
    fn control_plane_only_is_not_bootstrapped() {
        let batch = ObservationBatch::new(vec![node("master-0", true, true)]);
        assert!(!has_ready_non_control_node(&batch));
        assert_eq!(
            decide(false, &batch),
            BootstrapDecision {
                create_marker: false,
                completed: false
            }
        );
    }

    #[test]
    fn ready_worker_requests_marker() {
        let batch = ObservationBatch::new(vec![
            node("master-0", true, true),
            node("worker-1", false, true),
        ]);
        assert_eq!(
            decide(false, &batch),
            BootstrapDecision {
                create_marker: true,
                completed: true
            }
        );
    }

    #[test]
    fn existing_marker_wins_over_empty_batch() {
        let batch = ObservationBatch::default();
        assert!(!has_ready_non_control_node(&batch));
        assert_eq!(
            decide(true, &batch),
            BootstrapDecision {
                create_marker: false,
                completed: true
            }
        );
    }

    #[test]
    fn not_ready_worker_does_not_count() {
        let batch = ObservationBatch::new(vec![
            node("master-0", true, true),
            node("worker-1", false, false),
        ]);
        assert!(!decide(false, &batch).completed);
    }
}
