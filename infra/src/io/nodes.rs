//! Cluster node observations: parsing Kubernetes Node objects into
//! [`NodeFact`]s and feeding [`ObservationBatch`]es into a channel.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::types::{NodeFact, ObservationBatch};
use crate::io::process::{RunLimits, StopHandle, run_command_cancellable};

const CONTROL_PLANE_KEYS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KubeNode {
    metadata: Metadata,
    spec: NodeSpec,
    status: NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Metadata {
    name: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeSpec {
    taints: Vec<Taint>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Taint {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeStatus {
    conditions: Vec<Condition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeDocument {
    Array(Vec<KubeNode>),
    List { items: Vec<KubeNode> },
}

impl From<KubeNode> for NodeFact {
    fn from(node: KubeNode) -> Self {
        let is_control_plane = node
            .spec
            .taints
            .iter()
            .any(|taint| CONTROL_PLANE_KEYS.contains(&taint.key.as_str()))
            || CONTROL_PLANE_KEYS
                .iter()
                .any(|key| node.metadata.labels.contains_key(*key));
        let ready = node
            .status
            .conditions
            .iter()
            .any(|cond| cond.kind == "Ready" && cond.status == "True");
        NodeFact {
            name: node.metadata.name,
            is_control_plane,
            ready,
        }
    }
}

/// Parse one batch: a `NodeList` object or a JSON array of Node objects.
pub fn parse_batch(raw: &str) -> Result<ObservationBatch> {
    let doc: NodeDocument = serde_json::from_str(raw).context("parse node batch")?;
    let nodes = match doc {
        NodeDocument::Array(nodes) | NodeDocument::List { items: nodes } => nodes,
    };
    Ok(ObservationBatch::new(
        nodes.into_iter().map(NodeFact::from).collect(),
    ))
}

/// Read newline-delimited batches from `reader` and send them to `tx`.
///
/// Unparseable lines are logged and skipped. Stops at end of input or when
/// the receiver is gone. Returns the number of batches sent.
pub fn read_batches<R: BufRead>(reader: R, tx: &Sender<ObservationBatch>) -> Result<usize> {
    let mut sent = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read batch line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let batch = match parse_batch(&line) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(line = index + 1, err = %format!("{err:#}"), "skipping malformed batch");
                continue;
            }
        };
        if tx.send(batch).is_err() {
            debug!("batch receiver closed");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

/// Polls `kubectl get nodes -o json`.
#[derive(Debug, Clone)]
pub struct KubectlNodeSource {
    kubectl: PathBuf,
    limits: RunLimits,
}

impl KubectlNodeSource {
    pub fn new(kubectl: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
            limits: RunLimits {
                timeout: Duration::from_secs(60),
                stop_grace: Duration::from_secs(2),
                output_limit_bytes: 16 * 1024 * 1024,
            },
        }
    }

    pub fn fetch(&self, stop: &StopHandle) -> Result<ObservationBatch> {
        let mut cmd = Command::new(&self.kubectl);
        cmd.args(["get", "nodes", "-o", "json"]);
        let output = run_command_cancellable(cmd, self.limits, stop)
            .context("run kubectl get nodes")?;
        if !output.success() {
            return Err(anyhow!("kubectl get nodes failed: {}", output.diagnostics()));
        }
        parse_batch(&output.stdout_lossy())
    }

    /// Emit a batch every `interval` until `stop` is requested or the
    /// receiver is dropped. Failed polls are logged and retried next tick.
    pub fn spawn_poller(
        self,
        interval: Duration,
        tx: Sender<ObservationBatch>,
        stop: StopHandle,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!(interval_secs = interval.as_secs(), "node poller started");
            while !stop.is_requested() {
                match self.fetch(&stop) {
                    Ok(batch) => {
                        if tx.send(batch).is_err() {
                            break;
                        }
                    }
                    Err(err) if stop.is_requested() => {
                        debug!(err = %format!("{err:#}"), "poll interrupted by stop");
                        break;
                    }
                    Err(err) => warn!(err = %format!("{err:#}"), "node poll failed"),
                }
                sleep_unless_stopped(interval, &stop);
            }
            info!("node poller stopped");
        })
    }
}

fn sleep_unless_stopped(interval: Duration, stop: &StopHandle) {
    let deadline = Instant::now() + interval;
    while !stop.is_requested() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(Duration::from_millis(100)));
    }
}
