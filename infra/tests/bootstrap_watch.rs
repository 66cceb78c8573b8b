//! Bootstrap-completion reconciler driven through a channel, the way
//! `infractl watch-bootstrap` runs it.

use std::io::Cursor;
use std::sync::mpsc;

use infra::io::marker::{FileMarkerStore, MarkerStore};
use infra::io::nodes::read_batches;
use infra::reconcile::{BootstrapReconciler, ReconcileSummary};
use infra::test_support::{MemoryMarkerStore, batch, master, worker};

/// master only -> false; + NotReady worker -> false; worker Ready -> marker
/// created, true; worker NotReady again -> still true.
#[test]
fn signal_turns_true_once_and_stays_true() {
    let store = MemoryMarkerStore::new();
    let mut reconciler = BootstrapReconciler::new(store.clone());
    let (tx, rx) = mpsc::channel();
    for nodes in [
        vec![master("master-0", true)],
        vec![master("master-0", true), worker("worker-0", false)],
        vec![master("master-0", true), worker("worker-0", true)],
        vec![master("master-0", true), worker("worker-0", false)],
        vec![master("master-0", true), worker("worker-0", true)],
    ] {
        tx.send(batch(nodes)).expect("send");
    }
    drop(tx);

    let mut emitted = Vec::new();
    let summary = reconciler.run(rx, |signal| emitted.push(signal));

    assert_eq!(emitted, vec![false, false, true, true, true]);
    assert_eq!(
        summary,
        ReconcileSummary {
            batches: 5,
            failures: 0,
            completed: true,
        }
    );
    assert_eq!(store.create_calls(), 1);
    assert!(store.exists_now());
}

#[test]
fn ready_control_plane_nodes_never_count() {
    let store = MemoryMarkerStore::new();
    let mut reconciler = BootstrapReconciler::new(store.clone());
    let signal = reconciler
        .observe(&batch(vec![master("master-0", true), master("master-1", true)]))
        .expect("observe");
    assert!(!signal);
    assert!(!reconciler.observe(&batch(Vec::new())).expect("observe"));
    assert_eq!(store.create_calls(), 0);
}

/// A restarted watcher sees the marker from the previous run and reports
/// completion even with no ready workers in sight.
#[test]
fn file_marker_survives_restart() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("cluster-is-bootstrapped");

    let mut first = BootstrapReconciler::new(FileMarkerStore::new(&path));
    assert!(
        first
            .observe(&batch(vec![worker("worker-0", true)]))
            .expect("observe")
    );
    assert!(path.exists());

    let mut second = BootstrapReconciler::new(FileMarkerStore::new(&path));
    assert!(second.observe(&batch(Vec::new())).expect("observe"));
    assert!(!second.marker().create().expect("create"));
}

#[test]
fn ndjson_feed_drives_reconciler() {
    let input = concat!(
        r#"{"kind":"NodeList","items":[{"metadata":{"name":"master-0"},"spec":{"taints":[{"key":"node-role.kubernetes.io/master","effect":"NoSchedule"}]},"status":{"conditions":[{"type":"Ready","status":"True"}]}}]}"#,
        "\n",
        "{broken\n",
        r#"[{"metadata":{"name":"worker-0"},"status":{"conditions":[{"type":"Ready","status":"True"}]}}]"#,
        "\n",
    );
    let (tx, rx) = mpsc::channel();
    let sent = read_batches(Cursor::new(input), &tx).expect("read");
    drop(tx);
    assert_eq!(sent, 2);

    let store = MemoryMarkerStore::new();
    let mut reconciler = BootstrapReconciler::new(store.clone());
    let mut emitted = Vec::new();
    let summary = reconciler.run(rx, |signal| emitted.push(signal));

    assert_eq!(emitted, vec![false, true]);
    assert!(summary.completed);
    assert!(store.exists_now());
}
