use crate::cluster::NodeEvent;
use crate::core::{Envelope, Message, NodeId, Outbox, SnapshotId};
use crate::sensor::Reading;
use serde::{Deserialize, Serialize};
use std::cmp::max;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a node records about itself when its part of the cut is taken.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
  pub node: NodeId,
  pub clock: u64,
  pub coordinator: Option<NodeId>,
  pub has_token: bool,
  pub readings_taken: u64,
  /// `CHANNEL_DATA` messages sent, per destination.
  pub sent: BTreeMap<NodeId, u64>,
  /// `CHANNEL_DATA` messages received, per source.
  pub received: BTreeMap<NodeId, u64>,
  pub last_reading: Option<Reading>,
}

/// One node's contribution to a global snapshot: its local state and, for every incoming
/// channel, the messages caught in flight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFragment {
  pub node: NodeId,
  pub local: LocalState,
  pub channels: BTreeMap<NodeId, Vec<Envelope>>,
}

struct Recording {
  round: SnapshotId,
  // Every round merged into this recording by concurrent initiators.
  rounds: BTreeSet<SnapshotId>,
  local: LocalState,
  channels: BTreeMap<NodeId, Vec<Envelope>>,
  markers: BTreeSet<NodeId>,
  started: Instant,
}

/// The Chandy-Lamport recorder of one node.
///
/// Correct only over FIFO channels: a message sent before the marker on the same channel must be
/// delivered before it. Concurrent initiators merge into the same recording. A node joins each
/// round at most once: markers of a round it already completed or aborted are ignored.
pub struct SnapshotRecorder {
  me: NodeId,
  peers: Vec<NodeId>,
  timeout: Option<Duration>,
  recording: Option<Recording>,
  last: Option<SnapshotFragment>,
  completed: u64,
  last_seq: u64,
  // Highest finished `seq` per initiator.
  finished: BTreeMap<NodeId, u64>,
}
impl SnapshotRecorder {
  pub fn new(me: NodeId, peers: Vec<NodeId>, timeout: Option<Duration>) -> SnapshotRecorder {
    let mut peers = peers;
    peers.retain(|p| *p != me);
    peers.sort_unstable();
    peers.dedup();
    SnapshotRecorder {
      me: me,
      peers: peers,
      timeout: timeout,
      recording: None,
      last: None,
      completed: 0,
      last_seq: 0,
      finished: BTreeMap::new(),
    }
  }

  pub fn is_recording(&self) -> bool {
    self.recording.is_some()
  }

  /// The round being recorded, if any.
  pub fn round(&self) -> Option<SnapshotId> {
    self.recording.as_ref().map(|rec| rec.round)
  }

  pub fn last_completed(&self) -> Option<&SnapshotFragment> {
    self.last.as_ref()
  }

  pub fn completed(&self) -> u64 {
    self.completed
  }

  pub fn deadline(&self) -> Option<Instant> {
    let rec = self.recording.as_ref()?;
    self.timeout.map(|t| rec.started + t)
  }

  /// Whether `round` was already completed or aborted here.
  pub fn is_finished(&self, round: SnapshotId) -> bool {
    self
      .finished
      .get(&round.initiator)
      .map_or(false, |seq| round.seq <= *seq)
  }

  /// Takes the local part of the cut and sends a marker on every outgoing channel. Returns false
  /// if this node is already recording.
  pub fn start_snapshot(&mut self, local: LocalState, now: Instant, fx: &mut Outbox) -> bool {
    if self.recording.is_some() {
      debug!(node = self.me, "snapshot already in progress");
      return false;
    }
    let seq = max(local.clock, self.last_seq + 1);
    self.last_seq = seq;
    let round = SnapshotId {
      initiator: self.me,
      seq: seq,
    };
    self.begin(round, local, now, fx);
    self.try_complete(fx);
    true
  }

  /// Handles a marker of `round` from `from`. On the first marker of a round, `local` is called
  /// to take the local state before anything else arriving on that channel is processed.
  pub fn on_marker<F>(
    &mut self,
    from: NodeId,
    round: SnapshotId,
    local: F,
    now: Instant,
    fx: &mut Outbox,
  ) where
    F: FnOnce() -> LocalState,
  {
    if !self.peers.contains(&from) {
      warn!(node = self.me, from, "marker from a node outside the ring");
      return;
    }
    if self.is_finished(round) {
      debug!(node = self.me, from, ?round, "marker of a finished round");
      return;
    }
    if self.recording.is_none() {
      self.begin(round, local(), now, fx);
    }
    if let Some(rec) = self.recording.as_mut() {
      if rec.rounds.insert(round) {
        debug!(node = self.me, ?round, into = ?rec.round, "merging concurrent round");
      }
      if !rec.markers.insert(from) {
        warn!(node = self.me, from, "duplicate marker");
      }
    }
    self.try_complete(fx);
  }

  /// Offers an inbound envelope to the recorder, before the message is processed. Returns whether
  /// it was recorded as channel state.
  pub fn on_channel_message(&mut self, envelope: &Envelope) -> bool {
    if !envelope.msg.is_channel_state() {
      return false;
    }
    let rec = match self.recording.as_mut() {
      Some(rec) if !rec.markers.contains(&envelope.from) => rec,
      _ => return false,
    };
    match rec.channels.get_mut(&envelope.from) {
      Some(channel) => {
        channel.push(envelope.clone());
        true
      }
      None => false,
    }
  }

  /// Aborts a recording whose markers did not all arrive in time.
  pub fn poll(&mut self, now: Instant, fx: &mut Outbox) {
    let expired = match self.deadline() {
      Some(deadline) => now >= deadline,
      None => false,
    };
    if !expired {
      return;
    }
    if let Some(rec) = self.recording.take() {
      self.finish(&rec);
      let missing = self
        .peers
        .iter()
        .copied()
        .filter(|p| !rec.markers.contains(p))
        .collect::<Vec<_>>();
      warn!(node = self.me, round = ?rec.round, ?missing, "snapshot timed out waiting for markers");
      fx.event(NodeEvent::SnapshotAborted { missing: missing });
    }
  }

  fn begin(&mut self, round: SnapshotId, local: LocalState, now: Instant, fx: &mut Outbox) {
    info!(node = self.me, ?round, clock = local.clock, "recording local state");
    let channels = self.peers.iter().map(|p| (*p, Vec::new())).collect();
    let mut rounds = BTreeSet::new();
    rounds.insert(round);
    self.recording = Some(Recording {
      round: round,
      rounds: rounds,
      local: local,
      channels: channels,
      markers: BTreeSet::new(),
      started: now,
    });
    fx.broadcast(self.peers.iter().copied(), Message::Marker(round));
    fx.event(NodeEvent::SnapshotStarted { round: round });
  }

  fn finish(&mut self, rec: &Recording) {
    for round in rec.rounds.iter() {
      let seq = self.finished.entry(round.initiator).or_insert(0);
      *seq = max(*seq, round.seq);
    }
  }

  fn try_complete(&mut self, fx: &mut Outbox) {
    let done = match &self.recording {
      Some(rec) => self.peers.iter().all(|p| rec.markers.contains(p)),
      None => false,
    };
    if !done {
      return;
    }
    if let Some(rec) = self.recording.take() {
      self.finish(&rec);
      let fragment = SnapshotFragment {
        node: self.me,
        local: rec.local,
        channels: rec.channels,
      };
      self.completed += 1;
      info!(node = self.me, round = ?rec.round, "snapshot complete");
      self.last = Some(fragment.clone());
      fx.event(NodeEvent::SnapshotCompleted { fragment: fragment });
    }
  }
}

/// A violation found while checking an assembled cut.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Inconsistency {
  #[error("no fragment from node {0}")]
  MissingFragment(NodeId),
  #[error(
    "channel {from} -> {to}: {sent} sent but {received} received and {in_flight} in flight"
  )]
  ChannelMismatch {
    from: NodeId,
    to: NodeId,
    sent: u64,
    received: u64,
    in_flight: u64,
  },
  #[error("cut contains {0} tokens")]
  TokenCount(usize),
}

/// The fragments of every node, put back together.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSnapshot {
  fragments: BTreeMap<NodeId, SnapshotFragment>,
}
impl GlobalSnapshot {
  /// A later fragment from the same node replaces an earlier one.
  pub fn assemble<I: IntoIterator<Item = SnapshotFragment>>(fragments: I) -> GlobalSnapshot {
    GlobalSnapshot {
      fragments: fragments.into_iter().map(|f| (f.node, f)).collect(),
    }
  }

  pub fn nodes(&self) -> Vec<NodeId> {
    self.fragments.keys().copied().collect()
  }

  pub fn fragment(&self, node: NodeId) -> Option<&SnapshotFragment> {
    self.fragments.get(&node)
  }

  /// Every message caught on a channel, as `(from, to, envelope)`.
  pub fn in_flight(&self) -> Vec<(NodeId, NodeId, &Envelope)> {
    self
      .fragments
      .values()
      .flat_map(|f| {
        f.channels
          .iter()
          .flat_map(move |(from, msgs)| msgs.iter().map(move |e| (*from, f.node, e)))
      })
      .collect()
  }

  /// Checks that every data message sent before the cut was either received before it or is in
  /// flight across it, and that exactly one token exists.
  pub fn check_consistency(&self) -> Result<(), Inconsistency> {
    for (from, frag) in self.fragments.iter() {
      for to in frag.local.sent.keys() {
        if !self.fragments.contains_key(to) {
          return Err(Inconsistency::MissingFragment(*to));
        }
      }
      for (to, dest) in self.fragments.iter().filter(|(to, _)| *to != from) {
        let sent = frag.local.sent.get(to).copied().unwrap_or(0);
        let received = dest.local.received.get(from).copied().unwrap_or(0);
        let in_flight = dest
          .channels
          .get(from)
          .map(|msgs| msgs.iter().filter(|e| matches!(e.msg, Message::Data(_))).count() as u64)
          .unwrap_or(0);
        if sent != received + in_flight {
          return Err(Inconsistency::ChannelMismatch {
            from: *from,
            to: *to,
            sent: sent,
            received: received,
            in_flight: in_flight,
          });
        }
      }
    }
    let held = self.fragments.values().filter(|f| f.local.has_token).count();
    let moving = self
      .in_flight()
      .iter()
      .filter(|(_, _, e)| e.msg == Message::Token)
      .count();
    if held + moving != 1 {
      return Err(Inconsistency::TokenCount(held + moving));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::VecDeque;

  struct SimNode {
    recorder: SnapshotRecorder,
    local: LocalState,
  }

  // Three nodes joined by FIFO channels, stepped by hand.
  struct Sim {
    now: Instant,
    nodes: BTreeMap<NodeId, SimNode>,
    wires: BTreeMap<(NodeId, NodeId), VecDeque<Envelope>>,
    fragments: Vec<SnapshotFragment>,
  }
  impl Sim {
    fn new(ids: &[NodeId], holder: NodeId) -> Sim {
      let nodes = ids
        .iter()
        .map(|id| {
          let local = LocalState {
            node: *id,
            has_token: *id == holder,
            ..LocalState::default()
          };
          let recorder = SnapshotRecorder::new(*id, ids.to_vec(), Some(Duration::from_secs(1)));
          (*id, SimNode { recorder: recorder, local: local })
        })
        .collect();
      Sim {
        now: Instant::now(),
        nodes: nodes,
        wires: BTreeMap::new(),
        fragments: vec![],
      }
    }

    fn send(&mut self, from: NodeId, to: NodeId, msg: Message) {
      let node = self.nodes.get_mut(&from).unwrap();
      match &msg {
        Message::Data(_) => *node.local.sent.entry(to).or_insert(0) += 1,
        Message::Token => node.local.has_token = false,
        _ => {}
      }
      let env = Envelope {
        from: from,
        clock: 0,
        msg: msg,
      };
      self.wires.entry((from, to)).or_default().push_back(env);
    }

    fn flush(&mut self, from: NodeId, fx: Outbox) {
      for event in fx.events() {
        if let NodeEvent::SnapshotCompleted { fragment } = event {
          self.fragments.push(fragment.clone());
        }
      }
      for (to, msg) in fx.messages() {
        self.send(from, *to, msg.clone());
      }
    }

    fn start(&mut self, id: NodeId) {
      let mut fx = Outbox::new();
      let node = self.nodes.get_mut(&id).unwrap();
      assert!(node.recorder.start_snapshot(node.local.clone(), self.now, &mut fx));
      self.flush(id, fx);
    }

    fn deliver(&mut self, from: NodeId, to: NodeId) {
      let env = self.wires.get_mut(&(from, to)).unwrap().pop_front().unwrap();
      let mut fx = Outbox::new();
      let now = self.now;
      let node = self.nodes.get_mut(&to).unwrap();
      node.recorder.on_channel_message(&env);
      match env.msg {
        Message::Marker(round) => {
          node.recorder.on_marker(from, round, || node.local.clone(), now, &mut fx)
        }
        Message::Data(_) => *node.local.received.entry(from).or_insert(0) += 1,
        Message::Token => node.local.has_token = true,
        _ => {}
      }
      self.flush(to, fx);
    }

    fn drain(&mut self) {
      loop {
        let next = self.wires.iter().find(|(_, q)| !q.is_empty()).map(|(k, _)| *k);
        match next {
          Some((from, to)) => self.deliver(from, to),
          None => break,
        }
      }
    }
  }

  fn reading(source: NodeId, seq: u64) -> Message {
    Message::Data(Reading {
      source: source,
      seq: seq,
      temperature: 20.0,
      humidity: 50.0,
      pressure: 1000.0,
    })
  }

  #[test]
  fn scripted_cut_is_consistent() {
    let mut sim = Sim::new(&[1, 2, 3], 3);
    sim.send(1, 2, reading(1, 1));
    sim.send(3, 1, Message::Token);
    sim.start(1);
    sim.send(1, 2, reading(1, 2));
    // TOKEN reaches 1 while it records, before 3's marker: in flight.
    sim.deliver(3, 1);
    // 2 sees the first reading, then the marker, then the second reading.
    sim.deliver(1, 2);
    sim.deliver(1, 2);
    assert!(sim.nodes[&2].recorder.is_recording());
    sim.deliver(1, 2);
    sim.send(3, 2, reading(3, 1));
    sim.deliver(1, 3);
    sim.drain();

    assert_eq!(sim.fragments.len(), 3);
    assert!(sim.nodes.values().all(|n| !n.recorder.is_recording()));
    let cut = GlobalSnapshot::assemble(sim.fragments.clone());
    assert_eq!(cut.check_consistency(), Ok(()));

    let two = cut.fragment(2).unwrap();
    assert_eq!(two.local.received.get(&1), Some(&1));
    assert!(two.channels[&1].is_empty());
    assert_eq!(two.channels[&3].len(), 1);
    let moving = cut
      .in_flight()
      .into_iter()
      .map(|(from, to, e)| (from, to, e.msg.kind()))
      .collect::<Vec<_>>();
    assert_eq!(moving, vec![(3, 1, "TOKEN"), (3, 2, "CHANNEL_DATA")]);
  }

  #[test]
  fn tampered_cut_is_rejected() {
    let mut sim = Sim::new(&[1, 2, 3], 1);
    sim.send(1, 2, reading(1, 1));
    sim.start(2);
    sim.drain();
    let mut fragments = sim.fragments.clone();
    let fine = GlobalSnapshot::assemble(fragments.clone());
    assert_eq!(fine.check_consistency(), Ok(()));

    for f in fragments.iter_mut().filter(|f| f.node == 2) {
      f.local.received.insert(1, 5);
    }
    let bad = GlobalSnapshot::assemble(fragments.clone());
    assert!(matches!(
      bad.check_consistency(),
      Err(Inconsistency::ChannelMismatch { from: 1, to: 2, .. })
    ));

    let no_three = fragments.into_iter().filter(|f| f.node != 3);
    let mut partial = GlobalSnapshot::assemble(no_three).fragments;
    if let Some(f) = partial.get_mut(&1) {
      f.local.sent.insert(3, 1);
    }
    let partial = GlobalSnapshot { fragments: partial };
    assert_eq!(partial.check_consistency(), Err(Inconsistency::MissingFragment(3)));
  }

  #[test]
  fn lost_token_shows_in_cut() {
    let mut sim = Sim::new(&[1, 2], 1);
    sim.nodes.get_mut(&1).unwrap().local.has_token = false;
    sim.start(1);
    sim.drain();
    let cut = GlobalSnapshot::assemble(sim.fragments.clone());
    assert_eq!(cut.check_consistency(), Err(Inconsistency::TokenCount(0)));
  }

  #[test]
  fn lone_node_completes_at_once() {
    let mut rec = SnapshotRecorder::new(4, vec![4], None);
    let mut fx = Outbox::new();
    assert!(rec.start_snapshot(LocalState::default(), Instant::now(), &mut fx));
    assert!(!rec.is_recording());
    assert_eq!(rec.completed(), 1);
    assert!(fx.messages().is_empty());
  }

  fn marker_to(fx: &Outbox, to: NodeId) -> SnapshotId {
    match fx.sent_to(to).as_slice() {
      [Message::Marker(round)] => *round,
      other => panic!("expected one marker, got {:?}", other),
    }
  }

  #[test]
  fn missing_marker_times_out() {
    let t0 = Instant::now();
    let mut rec = SnapshotRecorder::new(1, vec![1, 2, 3], Some(Duration::from_millis(500)));
    let mut fx = Outbox::new();
    rec.start_snapshot(LocalState::default(), t0, &mut fx);
    let round = marker_to(&fx, 2);
    assert_eq!(round.initiator, 1);
    assert_eq!(rec.round(), Some(round));
    rec.on_marker(2, round, LocalState::default, t0, &mut fx);
    assert!(!rec.start_snapshot(LocalState::default(), t0, &mut fx));
    rec.poll(t0 + Duration::from_millis(499), &mut fx);
    assert!(rec.is_recording());
    rec.poll(t0 + Duration::from_millis(500), &mut fx);
    assert!(!rec.is_recording());
    assert_eq!(
      fx.events().last(),
      Some(&NodeEvent::SnapshotAborted { missing: vec![3] })
    );
  }

  #[test]
  fn late_marker_of_aborted_round_is_ignored() {
    let t0 = Instant::now();
    let timeout = Duration::from_millis(500);
    let mut two = SnapshotRecorder::new(2, vec![1, 2, 3], Some(timeout));
    let mut fx = Outbox::new();
    let round = SnapshotId {
      initiator: 1,
      seq: 7,
    };
    two.on_marker(1, round, LocalState::default, t0, &mut fx);
    assert_eq!(marker_to(&fx, 3), round);
    two.poll(t0 + timeout, &mut fx);
    assert!(two.is_finished(round));

    // 3's marker of the same round turns up after the abort.
    let mut late = Outbox::new();
    two.on_marker(3, round, LocalState::default, t0 + timeout * 2, &mut late);
    assert!(!two.is_recording());
    assert!(late.is_empty());
    let older = SnapshotId {
      initiator: 1,
      seq: 3,
    };
    two.on_marker(3, older, LocalState::default, t0 + timeout * 2, &mut late);
    assert!(late.is_empty());

    // A later round from the same initiator is still joined.
    let next = SnapshotId {
      initiator: 1,
      seq: 8,
    };
    two.on_marker(1, next, LocalState::default, t0 + timeout * 3, &mut late);
    assert_eq!(two.round(), Some(next));
  }

  #[test]
  fn own_rounds_are_numbered_upwards() {
    let t0 = Instant::now();
    let mut rec = SnapshotRecorder::new(1, vec![1, 2], None);
    let mut fx = Outbox::new();
    let local = LocalState {
      clock: 40,
      ..LocalState::default()
    };
    rec.start_snapshot(local.clone(), t0, &mut fx);
    let first = marker_to(&fx, 2);
    rec.on_marker(2, first, LocalState::default, t0, &mut fx);
    assert_eq!(rec.completed(), 1);

    // Same clock again, yet a fresh round id that peers will not mistake for the old one.
    let mut fx = Outbox::new();
    rec.start_snapshot(local, t0, &mut fx);
    let second = marker_to(&fx, 2);
    assert_eq!(first.seq, 40);
    assert!(second.seq > first.seq);
    rec.on_marker(2, first, LocalState::default, t0, &mut fx);
    assert!(rec.is_recording());
  }

  #[test]
  fn concurrent_rounds_merge_and_both_finish() {
    let t0 = Instant::now();
    let mut rec = SnapshotRecorder::new(2, vec![1, 2, 3], None);
    let mut fx = Outbox::new();
    let a = SnapshotId {
      initiator: 1,
      seq: 5,
    };
    let b = SnapshotId {
      initiator: 3,
      seq: 9,
    };
    rec.on_marker(1, a, LocalState::default, t0, &mut fx);
    rec.on_marker(3, b, LocalState::default, t0, &mut fx);
    assert_eq!(rec.completed(), 1);
    assert!(rec.is_finished(a) && rec.is_finished(b));
    // Only the first round's markers were sent on.
    assert_eq!(fx.sent_to(1).len(), 1);
    assert_eq!(fx.sent_to(3).len(), 1);
  }
}
