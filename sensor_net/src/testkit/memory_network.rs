use crate::core::{Envelope, NodeId, Transport, TransportError};
use crate::testkit::{FailureConfig, FailureConfigMap};
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant};
use tracing::trace;

type Link = (NodeId, NodeId);

struct State {
  inboxes: HashMap<NodeId, UnboundedSender<Envelope>>,
  // One queue per directed channel, drained by its own task so that delays never reorder.
  links: HashMap<Link, UnboundedSender<(Instant, Envelope)>>,
  down: HashSet<NodeId>,
  cut: HashSet<Link>,
  failures: FailureConfigMap,
  rng: SmallRng,
  dropped: u64,
}
impl State {
  fn blocked(&self, from: NodeId, to: NodeId) -> bool {
    self.down.contains(&from) || self.down.contains(&to) || self.cut.contains(&(from, to))
  }
}

struct Inner {
  state: Mutex<State>,
}
impl Inner {
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn deliver(&self, to: NodeId, envelope: Envelope) {
    let mut state = self.lock();
    if state.blocked(envelope.from, to) {
      state.dropped += 1;
      return;
    }
    if let Some(inbox) = state.inboxes.get(&to) {
      // A stopped node has dropped its receiver; that is a crash, not an error.
      let _ = inbox.send(envelope);
    }
  }
}

/// An in-process network of FIFO channels that can lose, delay and cut messages, and crash whole
/// nodes. Clones share the same network.
#[derive(Clone)]
pub struct MemoryNetwork {
  inner: Arc<Inner>,
}
impl MemoryNetwork {
  pub fn new() -> MemoryNetwork {
    MemoryNetwork::with_failures(FailureConfigMap::default())
  }

  pub fn with_failures(failures: FailureConfigMap) -> MemoryNetwork {
    let state = State {
      inboxes: HashMap::new(),
      links: HashMap::new(),
      down: HashSet::new(),
      cut: HashSet::new(),
      failures: failures,
      rng: SmallRng::seed_from_u64(0x5e5),
      dropped: 0,
    };
    MemoryNetwork {
      inner: Arc::new(Inner {
        state: Mutex::new(state),
      }),
    }
  }

  /// Attaches `id` to the network, replacing any earlier inbox it had. Also brings it back up if
  /// it was killed.
  pub fn register(&self, id: NodeId) -> (MemoryEndpoint, UnboundedReceiver<Envelope>) {
    let (tx, rx) = unbounded_channel();
    let mut state = self.inner.lock();
    state.inboxes.insert(id, tx);
    state.down.remove(&id);
    let endpoint = MemoryEndpoint {
      me: id,
      net: self.clone(),
    };
    (endpoint, rx)
  }

  pub fn set_failures(&self, failures: FailureConfigMap) {
    self.inner.lock().failures = failures;
  }

  pub fn set_node_failures(&self, node: NodeId, cfg: FailureConfig) {
    self.inner.lock().failures.node_wide.insert(node, cfg);
  }

  /// Everything sent to or by `id` is lost from now on, including messages already in flight.
  pub fn kill(&self, id: NodeId) {
    self.inner.lock().down.insert(id);
  }

  pub fn revive(&self, id: NodeId) {
    self.inner.lock().down.remove(&id);
  }

  pub fn is_down(&self, id: NodeId) -> bool {
    self.inner.lock().down.contains(&id)
  }

  /// Cuts both directions between `a` and `b`.
  pub fn partition(&self, a: NodeId, b: NodeId) {
    let mut state = self.inner.lock();
    state.cut.insert((a, b));
    state.cut.insert((b, a));
  }

  pub fn heal(&self, a: NodeId, b: NodeId) {
    let mut state = self.inner.lock();
    state.cut.remove(&(a, b));
    state.cut.remove(&(b, a));
  }

  /// Messages lost so far, to drops, crashes and cuts alike.
  pub fn dropped(&self) -> u64 {
    self.inner.lock().dropped
  }

  fn route(&self, from: NodeId, to: NodeId, envelope: Envelope) -> Result<(), TransportError> {
    let mut state = self.inner.lock();
    if !state.inboxes.contains_key(&to) {
      return Err(TransportError::UnknownPeer(to));
    }
    let cfg = *state.failures.get(to);
    if state.blocked(from, to) || cfg.should_drop(&mut state.rng) {
      trace!(from, to, kind = envelope.msg.kind(), "message lost");
      state.dropped += 1;
      return Ok(());
    }
    let at = Instant::now() + cfg.sample_delay(&mut state.rng);
    let weak = Arc::downgrade(&self.inner);
    let link = state
      .links
      .entry((from, to))
      .or_insert_with(|| spawn_link(to, weak));
    link
      .send((at, envelope))
      .map_err(|_| TransportError::Closed(to))
  }
}
impl Default for MemoryNetwork {
  fn default() -> Self {
    MemoryNetwork::new()
  }
}

fn spawn_link(to: NodeId, net: Weak<Inner>) -> UnboundedSender<(Instant, Envelope)> {
  let (tx, mut rx) = unbounded_channel::<(Instant, Envelope)>();
  tokio::spawn(async move {
    while let Some((at, envelope)) = rx.recv().await {
      sleep_until(at).await;
      match net.upgrade() {
        Some(inner) => inner.deliver(to, envelope),
        None => break,
      }
    }
  });
  tx
}

/// One node's attachment to a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryEndpoint {
  me: NodeId,
  net: MemoryNetwork,
}
impl MemoryEndpoint {
  pub fn id(&self) -> NodeId {
    self.me
  }

  pub fn network(&self) -> &MemoryNetwork {
    &self.net
  }
}
#[async_trait]
impl Transport for MemoryEndpoint {
  async fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), TransportError> {
    self.net.route(self.me, to, envelope)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::Message;
  use std::time::Duration;

  fn env(from: NodeId, clock: u64) -> Envelope {
    Envelope {
      from: from,
      clock: clock,
      msg: Message::Heartbeat,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn delays_keep_channel_order() {
    let ms = Duration::from_millis;
    let net = MemoryNetwork::with_failures(FailureConfigMap::new(FailureConfig::delayed(
      ms(1),
      ms(50),
    )));
    let (one, _) = net.register(1);
    let (_, mut inbox) = net.register(2);
    for clock in 0..50 {
      one.send(2, env(1, clock)).await.unwrap();
    }
    for clock in 0..50 {
      assert_eq!(inbox.recv().await.unwrap().clock, clock);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn killed_and_cut_nodes_hear_nothing() {
    let net = MemoryNetwork::new();
    let (one, mut inbox1) = net.register(1);
    let (two, mut inbox2) = net.register(2);
    assert!(matches!(
      one.send(9, env(1, 0)).await,
      Err(TransportError::UnknownPeer(9))
    ));

    net.partition(1, 2);
    one.send(2, env(1, 1)).await.unwrap();
    two.send(1, env(2, 1)).await.unwrap();
    net.heal(1, 2);
    net.kill(2);
    one.send(2, env(1, 2)).await.unwrap();
    net.revive(2);
    one.send(2, env(1, 3)).await.unwrap();

    assert_eq!(inbox2.recv().await.unwrap().clock, 3);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(inbox1.try_recv().is_err());
    assert_eq!(net.dropped(), 3);
  }
}
