use crate::cluster::SnapshotFragment;
use crate::core::{Membership, NodeId, SnapshotId};
use crate::sensor::Reading;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use NodeEvent::*;

/// Configures a [`SensorNode`](crate::cluster::SensorNode). Supplied at startup, immutable
/// afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
  /// How often this node sends a heartbeat to every peer.
  ///
  /// default: `500 milliseconds`
  pub heartbeat_interval: Duration,
  /// A peer silent for longer than this is declared failed.
  ///
  /// default: `2 seconds`
  pub failure_timeout: Duration,
  /// How often the failure detector sweeps its heartbeat table.
  ///
  /// default: `500 milliseconds`
  pub sweep_interval: Duration,
  /// How long an election initiator waits for an `ANSWER` from a higher node before declaring
  /// itself coordinator.
  ///
  /// default: `300 milliseconds`
  pub answer_timeout: Duration,
  /// How long a node that received an `ANSWER` waits for the `COORDINATOR` announcement before
  /// retrying.
  ///
  /// default: `1 second`
  pub coordinator_timeout: Duration,
  /// Retries after a missing announcement before the round is abandoned. Each retry doubles both
  /// election timeouts.
  ///
  /// default: `3`
  pub max_election_retries: u32,
  /// How often a caller waiting for the token checks whether it has arrived.
  ///
  /// default: `100 milliseconds`
  pub token_poll_interval: Duration,
  /// How long an idle holder keeps the token before passing it on. `None` keeps it until it is
  /// used.
  ///
  /// default: `Some(200 milliseconds)`
  pub token_hold: Option<Duration>,
  /// The node that starts with the token. `None` means the lowest id in the ring.
  ///
  /// default: `None`
  pub initial_token_holder: Option<NodeId>,
  /// A snapshot still missing markers after this long is aborted. `None` waits forever.
  ///
  /// default: `Some(5 seconds)`
  pub snapshot_timeout: Option<Duration>,
  /// How often the coordinator initiates a global snapshot. `None` disables it.
  ///
  /// default: `None`
  pub snapshot_interval: Option<Duration>,
  /// How often a checkpoint is written besides the event-driven ones. `None` disables it.
  ///
  /// default: `None`
  pub checkpoint_interval: Option<Duration>,
  /// Whether the node holds an election as soon as it starts.
  ///
  /// default: `true`
  pub elect_on_start: bool,
}
impl Default for NodeConfig {
  #[inline]
  fn default() -> Self {
    NodeConfig {
      heartbeat_interval: Duration::from_millis(500),
      failure_timeout: Duration::from_secs(2),
      sweep_interval: Duration::from_millis(500),
      answer_timeout: Duration::from_millis(300),
      coordinator_timeout: Duration::from_secs(1),
      max_election_retries: 3,
      token_poll_interval: Duration::from_millis(100),
      token_hold: Some(Duration::from_millis(200)),
      initial_token_holder: None,
      snapshot_timeout: Some(Duration::from_secs(5)),
      snapshot_interval: None,
      checkpoint_interval: None,
      elect_on_start: true,
    }
  }
}

/// A whole cluster description as stored on disk: the ring plus the settings every node shares.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterFile {
  pub membership: Membership,
  #[serde(default)]
  pub node: NodeConfig,
}
impl ClusterFile {
  pub fn from_json(s: &str) -> serde_json::Result<ClusterFile> {
    serde_json::from_str(s)
  }

  pub fn load(path: &Path) -> std::io::Result<ClusterFile> {
    let text = std::fs::read_to_string(path)?;
    Self::from_json(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
  }
}

/// Things a node reports to the audit sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeEvent {
  NodeRecovered { node: NodeId },
  NodeFailed { node: NodeId },
  TriggerElection { failed: Option<NodeId> },
  ElectionStarted { initiator: NodeId, attempt: u32 },
  CoordinatorElected { coordinator: NodeId },
  ElectionAbandoned { attempts: u32 },
  TokenReceived { from: NodeId },
  TokenPassed { to: NodeId },
  DataSent { reading: Reading },
  DataReceived { reading: Reading },
  SnapshotStarted { round: SnapshotId },
  SnapshotCompleted { fragment: SnapshotFragment },
  SnapshotAborted { missing: Vec<NodeId> },
  CheckpointSaved { clock: u64 },
  CheckpointRestored { clock: u64, coordinator: Option<NodeId> },
}
impl NodeEvent {
  pub fn kind(&self) -> &'static str {
    match self {
      NodeRecovered { .. } => "node_recovered",
      NodeFailed { .. } => "failure",
      TriggerElection { .. } => "trigger_election",
      ElectionStarted { .. } => "election_started",
      CoordinatorElected { .. } => "election_completed",
      ElectionAbandoned { .. } => "election_abandoned",
      TokenReceived { .. } => "token_received",
      TokenPassed { .. } => "token_passed",
      DataSent { .. } => "data_sent",
      DataReceived { .. } => "data_received",
      SnapshotStarted { .. } => "snapshot_started",
      SnapshotCompleted { .. } => "snapshot_completed",
      SnapshotAborted { .. } => "snapshot_aborted",
      CheckpointSaved { .. } => "checkpoint",
      CheckpointRestored { .. } => "checkpoint_restored",
    }
  }
}

#[test]
fn test_cluster_file_defaults() {
  let text = r#"{
    "membership": { "members": [
      { "id": 2, "address": { "host": { "DNS": "sensor2" }, "udp": 5002 }, "ring_position": 1 },
      { "id": 1, "address": { "host": { "DNS": "sensor1" }, "udp": 5001 }, "ring_position": 0 }
    ] },
    "node": { "failure_timeout": { "secs": 5, "nanos": 0 }, "elect_on_start": false }
  }"#;
  let file = ClusterFile::from_json(text).unwrap();
  assert_eq!(file.node.failure_timeout, Duration::from_secs(5));
  assert!(!file.node.elect_on_start);
  assert_eq!(file.node.heartbeat_interval, NodeConfig::default().heartbeat_interval);
  assert!(file.membership.contains(1) && file.membership.contains(2));
}
