//! Bootstrap-completion reconciler.
//!
//! Consumes observation batches from a channel and writes the completion
//! marker the first time the cluster looks bootstrapped. The emitted signal
//! is monotonic: once true it stays true for the life of the reconciler.

use std::sync::mpsc::Receiver;

use tracing::{debug, info, instrument, warn};

use crate::core::bootstrap::decide;
use crate::core::types::ObservationBatch;
use crate::error::InfraError;
use crate::io::marker::MarkerStore;

/// Totals for one [`BootstrapReconciler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub batches: usize,
    pub failures: usize,
    pub completed: bool,
}

pub struct BootstrapReconciler<M: MarkerStore> {
    marker: M,
    completed: bool,
}

impl<M: MarkerStore> BootstrapReconciler<M> {
    pub fn new(marker: M) -> Self {
        Self {
            marker,
            completed: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn marker(&self) -> &M {
        &self.marker
    }

    /// Process one batch and return the bootstrap signal.
    ///
    /// On error nothing is latched; the next batch tries again.
    pub fn observe(&mut self, batch: &ObservationBatch) -> Result<bool, InfraError> {
        if self.completed {
            return Ok(true);
        }
        let marker_exists = self.marker.exists()?;
        let decision = decide(marker_exists, batch);
        if decision.create_marker {
            let created = self.marker.create()?;
            info!(
                marker = %self.marker.describe(),
                created,
                "cluster bootstrap detected"
            );
        }
        if decision.completed {
            self.completed = true;
        }
        debug!(
            nodes = batch.nodes.len(),
            marker_exists,
            completed = decision.completed,
            "batch observed"
        );
        Ok(decision.completed)
    }

    /// Drain `batches` until the sender side closes, calling `on_emit` with
    /// the signal after every successfully processed batch. Failed batches
    /// are logged and skipped.
    #[instrument(skip_all, fields(marker = %self.marker.describe()))]
    pub fn run<F: FnMut(bool)>(
        &mut self,
        batches: Receiver<ObservationBatch>,
        mut on_emit: F,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for batch in batches {
            summary.batches += 1;
            match self.observe(&batch) {
                Ok(signal) => on_emit(signal),
                Err(err) => {
                    summary.failures += 1;
                    warn!(batch = summary.batches, err = %err, "batch failed, skipping");
                }
            }
        }
        summary.completed = self.completed;
        info!(
            batches = summary.batches,
            failures = summary.failures,
            completed = summary.completed,
            "observation feed closed"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::test_support::{MemoryMarkerStore, batch, master, worker};

    #[test]
    fn existing_marker_completes_immediately_without_create() {
        let store = MemoryMarkerStore::existing();
        let mut reconciler = BootstrapReconciler::new(store.clone());
        assert!(reconciler.observe(&batch(vec![])).expect("observe"));
        assert_eq!(store.create_calls(), 0);
    }

    #[test]
    fn marker_failure_is_isolated_per_batch() {
        let store = MemoryMarkerStore::new();
        store.fail_next_creates(1);
        let mut reconciler = BootstrapReconciler::new(store.clone());
        let (tx, rx) = mpsc::channel();
        tx.send(batch(vec![worker("w1", true)])).expect("send");
        tx.send(batch(vec![worker("w1", true)])).expect("send");
        drop(tx);

        let mut emitted = Vec::new();
        let summary = reconciler.run(rx, |signal| emitted.push(signal));
        assert_eq!(
            summary,
            ReconcileSummary {
                batches: 2,
                failures: 1,
                completed: true,
            }
        );
        assert_eq!(emitted, vec![true]);
        assert!(store.exists_now());
    }

    #[test]
    fn latched_signal_skips_marker_queries() {
        let store = MemoryMarkerStore::new();
        let mut reconciler = BootstrapReconciler::new(store.clone());
        assert!(!reconciler.observe(&batch(vec![master("m0", true)])).expect("observe"));
        assert!(reconciler.observe(&batch(vec![worker("w1", true)])).expect("observe"));
        let queries = store.exists_calls();
        store.fail_next_exists(5);
        assert!(reconciler.observe(&batch(vec![])).expect("observe"));
        assert_eq!(store.exists_calls(), queries);
    }
}
