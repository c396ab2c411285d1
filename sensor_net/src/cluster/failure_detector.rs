use crate::cluster::NodeEvent;
use crate::core::{NodeId, Outbox};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Timeout-based liveness tracking over the heartbeat table.
///
/// A tracked peer silent for longer than `timeout` is evicted and reported failed. A transient
/// delay longer than the timeout produces a false positive; the peer is re-tracked on its next
/// heartbeat, there is no retraction.
pub struct FailureDetector {
  me: NodeId,
  timeout: Duration,
  last_seen: BTreeMap<NodeId, Instant>,
}
impl FailureDetector {
  pub fn new(me: NodeId, timeout: Duration) -> FailureDetector {
    FailureDetector {
      me: me,
      timeout: timeout,
      last_seen: BTreeMap::new(),
    }
  }

  /// Starts tracking peers as if each had just sent a heartbeat, so that a peer which never comes
  /// up is still detected.
  pub fn track<I: IntoIterator<Item = NodeId>>(&mut self, peers: I, now: Instant) {
    for peer in peers.into_iter().filter(|p| *p != self.me) {
      self.last_seen.entry(peer).or_insert(now);
    }
  }

  /// Records `now` as the last time `from` was heard. Returns whether `from` had been evicted
  /// (or never tracked) before this heartbeat.
  pub fn on_heartbeat(&mut self, from: NodeId, now: Instant, fx: &mut Outbox) -> bool {
    if from == self.me {
      return false;
    }
    let recovered = self.last_seen.insert(from, now).is_none();
    if recovered {
      debug!(node = self.me, peer = from, "peer is alive again");
      fx.event(NodeEvent::NodeRecovered { node: from });
    } else {
      trace!(node = self.me, peer = from, "heartbeat");
    }
    recovered
  }

  /// Evicts every peer silent for longer than the timeout. Returns whether an election should be
  /// held: the coordinator was among the evicted, or no coordinator is known and no round is
  /// already `electing`.
  pub fn sweep(
    &mut self,
    now: Instant,
    coordinator: Option<NodeId>,
    electing: bool,
    fx: &mut Outbox,
  ) -> bool {
    let timeout = self.timeout;
    let failed = self
      .last_seen
      .iter()
      .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
      .map(|(id, _)| *id)
      .collect::<Vec<_>>();
    for id in failed.iter() {
      self.last_seen.remove(id);
      warn!(node = self.me, peer = *id, "no heartbeat for over {:?}, peer failed", timeout);
      fx.event(NodeEvent::NodeFailed { node: *id });
    }
    let lost = coordinator.filter(|c| failed.contains(c));
    if lost.is_some() || (coordinator.is_none() && !electing) {
      fx.event(NodeEvent::TriggerElection { failed: lost });
      true
    } else {
      false
    }
  }

  pub fn is_tracked(&self, id: NodeId) -> bool {
    self.last_seen.contains_key(&id)
  }

  /// Peers currently believed alive, in id order.
  pub fn live(&self) -> Vec<NodeId> {
    self.last_seen.keys().copied().collect()
  }
}
