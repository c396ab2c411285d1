use crate::cluster::{NodeConfig, NodeDeps, NodeError, NodeHandle, SensorNode};
use crate::core::{Membership, NodeId};
use crate::sensor::SensorSimulator;
use crate::storage::{EventLog, MemoryCheckpointStore};
use crate::testkit::MemoryNetwork;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A whole cluster in one process, on one [`MemoryNetwork`], sharing one audit log and one
/// checkpoint store. Sensors are seeded with their node id.
pub struct LocalCluster {
  pub net: MemoryNetwork,
  pub membership: Membership,
  pub log: Arc<EventLog>,
  pub checkpoints: Arc<MemoryCheckpointStore>,
  config: NodeConfig,
  nodes: BTreeMap<NodeId, NodeHandle>,
}
impl LocalCluster {
  pub fn start<I: IntoIterator<Item = NodeId>>(ids: I, config: NodeConfig) -> LocalCluster {
    Self::start_on(MemoryNetwork::new(), ids, config)
  }

  pub fn start_on<I>(net: MemoryNetwork, ids: I, config: NodeConfig) -> LocalCluster
  where
    I: IntoIterator<Item = NodeId>,
  {
    let membership = Membership::local(ids);
    let mut cluster = LocalCluster {
      net: net,
      membership: membership,
      log: Arc::new(EventLog::new()),
      checkpoints: Arc::new(MemoryCheckpointStore::new()),
      config: config,
      nodes: BTreeMap::new(),
    };
    // Every inbox exists before any node sends its first message.
    let endpoints = cluster
      .membership
      .ids()
      .into_iter()
      .map(|id| (id, cluster.net.register(id)))
      .collect::<Vec<_>>();
    for (id, (endpoint, inbox)) in endpoints {
      let deps = NodeDeps {
        transport: Arc::new(endpoint),
        inbox: inbox,
        sink: cluster.log.clone(),
        checkpoints: cluster.checkpoints.clone(),
      };
      cluster.spawn(id, deps);
    }
    cluster
  }

  fn spawn(&mut self, id: NodeId, deps: NodeDeps) {
    let sensor = SensorSimulator::with_seed(id, id);
    let handle =
      SensorNode::spawn_with_sensor(id, &self.membership, self.config.clone(), deps, sensor);
    self.nodes.insert(id, handle);
  }

  pub fn node(&self, id: NodeId) -> Option<&NodeHandle> {
    self.nodes.get(&id)
  }

  pub fn ids(&self) -> Vec<NodeId> {
    self.nodes.keys().copied().collect()
  }

  pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
    self.nodes.values()
  }

  /// Cuts `id` off the network and stops it. Nothing it says on the way down reaches anyone.
  pub async fn crash(&mut self, id: NodeId) {
    self.net.kill(id);
    if let Some(handle) = self.nodes.remove(&id) {
      handle.stop().await;
    }
    info!(node = id, "crashed");
  }

  /// Starts a fresh incarnation of `id`, which restores from its last checkpoint.
  pub fn restart(&mut self, id: NodeId) {
    let (endpoint, inbox) = self.net.register(id);
    let deps = NodeDeps {
      transport: Arc::new(endpoint),
      inbox: inbox,
      sink: self.log.clone(),
      checkpoints: self.checkpoints.clone(),
    };
    self.spawn(id, deps);
    info!(node = id, "restarted");
  }

  /// Waits until every running node names `coordinator`.
  pub async fn await_coordinator(
    &self,
    coordinator: NodeId,
    timeout: Duration,
  ) -> Result<(), NodeError> {
    for handle in self.nodes.values() {
      handle
        .wait_until(timeout, |s| s.coordinator == Some(coordinator))
        .await?;
    }
    Ok(())
  }

  pub async fn stop_all(&mut self) {
    for (_, handle) in std::mem::take(&mut self.nodes) {
      handle.stop().await;
    }
  }
}
