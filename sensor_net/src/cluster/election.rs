use crate::cluster::NodeEvent;
use crate::core::{Message, NodeId, Outbox};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The externally visible phase of an election round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
  Idle,
  ElectionInProgress,
  AwaitingCoordinatorAnnouncement,
}

enum Phase {
  Idle,
  // ELECTION sent to every higher node; waiting for any ANSWER.
  InProgress { deadline: Instant },
  // A higher node answered; waiting for its COORDINATOR.
  Awaiting { deadline: Instant },
}

#[derive(Clone, Copy, Debug)]
pub struct ElectionConfig {
  pub answer_timeout: Duration,
  pub coordinator_timeout: Duration,
  pub max_retries: u32,
}

/// The Bully algorithm for one node. The highest live id always ends up coordinator.
///
/// Messages go out through an [`Outbox`]; timers are deadlines the owner checks with
/// [`poll`](BullyElection::poll). A higher node that cannot be reached simply never answers, which
/// is the same as a missing `ANSWER`.
pub struct BullyElection {
  me: NodeId,
  members: Vec<NodeId>,
  coordinator: Option<NodeId>,
  phase: Phase,
  attempt: u32,
  config: ElectionConfig,
}
impl BullyElection {
  /// `members` is the whole static ring, this node included.
  pub fn new(me: NodeId, members: Vec<NodeId>, config: ElectionConfig) -> BullyElection {
    let mut members = members;
    members.sort_unstable();
    members.dedup();
    BullyElection {
      me: me,
      members: members,
      coordinator: None,
      phase: Phase::Idle,
      attempt: 0,
      config: config,
    }
  }

  pub fn coordinator(&self) -> Option<NodeId> {
    self.coordinator
  }

  pub fn is_coordinator(&self) -> bool {
    self.coordinator == Some(self.me)
  }

  /// Seeds the coordinator from a checkpoint. Only a hint: it does not stop an election.
  pub fn restore_coordinator(&mut self, coordinator: Option<NodeId>) {
    self.coordinator = coordinator;
  }

  pub fn state(&self) -> ElectionState {
    match self.phase {
      Phase::Idle => ElectionState::Idle,
      Phase::InProgress { .. } => ElectionState::ElectionInProgress,
      Phase::Awaiting { .. } => ElectionState::AwaitingCoordinatorAnnouncement,
    }
  }

  /// When [`poll`](BullyElection::poll) next has work to do.
  pub fn deadline(&self) -> Option<Instant> {
    match self.phase {
      Phase::Idle => None,
      Phase::InProgress { deadline } | Phase::Awaiting { deadline } => Some(deadline),
    }
  }

  fn higher(&self) -> Vec<NodeId> {
    self.members.iter().copied().filter(|id| *id > self.me).collect()
  }

  fn others(&self) -> Vec<NodeId> {
    self.members.iter().copied().filter(|id| *id != self.me).collect()
  }

  fn backoff(&self, base: Duration) -> Duration {
    base * 2u32.saturating_pow(self.attempt.min(16))
  }

  /// Begins a round. Only allowed from `Idle`; returns whether a round was started.
  pub fn start_election(&mut self, now: Instant, fx: &mut Outbox) -> bool {
    if !matches!(self.phase, Phase::Idle) {
      debug!(node = self.me, "election already in progress");
      return false;
    }
    fx.event(NodeEvent::ElectionStarted {
      initiator: self.me,
      attempt: self.attempt,
    });
    let higher = self.higher();
    if higher.is_empty() {
      self.become_coordinator(fx);
    } else {
      info!(node = self.me, ?higher, attempt = self.attempt, "starting election");
      fx.broadcast(higher, Message::Election);
      self.phase = Phase::InProgress {
        deadline: now + self.backoff(self.config.answer_timeout),
      };
    }
    true
  }

  fn become_coordinator(&mut self, fx: &mut Outbox) {
    info!(node = self.me, "no higher node answered, becoming coordinator");
    self.coordinator = Some(self.me);
    self.phase = Phase::Idle;
    self.attempt = 0;
    fx.broadcast(self.others(), Message::Coordinator(self.me));
    fx.event(NodeEvent::CoordinatorElected {
      coordinator: self.me,
    });
  }

  /// `ELECTION` from `from`. A lower sender is answered and bullied with a round of our own; a
  /// higher one gets no reply.
  pub fn on_election_message(&mut self, from: NodeId, now: Instant, fx: &mut Outbox) {
    if self.me > from {
      fx.send(from, Message::Answer);
      if matches!(self.phase, Phase::Idle) {
        self.start_election(now, fx);
      }
    }
  }

  /// `ANSWER` from a higher node: someone above us will take over.
  pub fn on_answer(&mut self, from: NodeId, now: Instant) {
    if from <= self.me {
      return;
    }
    if let Phase::InProgress { .. } = self.phase {
      debug!(node = self.me, by = from, "answered, awaiting coordinator");
      self.phase = Phase::Awaiting {
        deadline: now + self.backoff(self.config.coordinator_timeout),
      };
    }
  }

  /// `COORDINATOR(coordinator)`: adopt it and go idle. A coordinator below us is then challenged.
  pub fn on_coordinator_message(&mut self, coordinator: NodeId, now: Instant, fx: &mut Outbox) {
    let changed = self.coordinator != Some(coordinator);
    self.coordinator = Some(coordinator);
    self.phase = Phase::Idle;
    self.attempt = 0;
    if changed {
      info!(node = self.me, coordinator, "new coordinator announced");
      fx.event(NodeEvent::CoordinatorElected {
        coordinator: coordinator,
      });
    }
    if coordinator < self.me {
      debug!(node = self.me, coordinator, "announced coordinator is lower, challenging");
      self.start_election(now, fx);
    }
  }

  /// The failure detector gave up on `node`.
  pub fn on_node_failed(&mut self, node: NodeId) {
    if self.coordinator == Some(node) {
      self.coordinator = None;
    }
  }

  /// Fires whichever timeout has passed.
  pub fn poll(&mut self, now: Instant, fx: &mut Outbox) {
    match self.phase {
      Phase::InProgress { deadline } if now >= deadline => self.become_coordinator(fx),
      Phase::Awaiting { deadline } if now >= deadline => {
        self.phase = Phase::Idle;
        if self.attempt >= self.config.max_retries {
          warn!(node = self.me, attempts = self.attempt + 1, "no coordinator announced, giving up");
          fx.event(NodeEvent::ElectionAbandoned {
            attempts: self.attempt + 1,
          });
          self.attempt = 0;
          self.coordinator = None;
        } else {
          self.attempt += 1;
          warn!(node = self.me, attempt = self.attempt, "no coordinator announced, retrying");
          self.start_election(now, fx);
        }
      }
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> ElectionConfig {
    ElectionConfig {
      answer_timeout: Duration::from_millis(100),
      coordinator_timeout: Duration::from_millis(500),
      max_retries: 2,
    }
  }

  fn ms(x: u64) -> Duration {
    Duration::from_millis(x)
  }

  #[test]
  fn highest_node_wins_immediately() {
    let t0 = Instant::now();
    let mut e = BullyElection::new(3, vec![1, 2, 3], config());
    let mut fx = Outbox::new();
    assert!(e.start_election(t0, &mut fx));
    assert!(e.is_coordinator());
    assert_eq!(e.state(), ElectionState::Idle);
    assert_eq!(fx.sent_to(1), vec![&Message::Coordinator(3)]);
    assert_eq!(fx.sent_to(2), vec![&Message::Coordinator(3)]);
  }

  #[test]
  fn silence_from_higher_nodes_means_victory() {
    let t0 = Instant::now();
    let mut e = BullyElection::new(2, vec![1, 2, 3], config());
    let mut fx = Outbox::new();
    e.start_election(t0, &mut fx);
    assert_eq!(e.state(), ElectionState::ElectionInProgress);
    assert_eq!(fx.sent_to(3), vec![&Message::Election]);
    assert!(fx.sent_to(1).is_empty());
    e.poll(t0 + ms(50), &mut fx);
    assert_eq!(e.coordinator(), None);
    e.poll(t0 + ms(100), &mut fx);
    assert_eq!(e.coordinator(), Some(2));
    assert_eq!(fx.sent_to(1), vec![&Message::Coordinator(2)]);
  }

  #[test]
  fn only_one_round_at_a_time() {
    let t0 = Instant::now();
    let mut e = BullyElection::new(1, vec![1, 2], config());
    let mut fx = Outbox::new();
    assert!(e.start_election(t0, &mut fx));
    assert!(!e.start_election(t0, &mut fx));
    assert_eq!(fx.sent_to(2).len(), 1);
  }

  #[test]
  fn answer_then_announcement() {
    let t0 = Instant::now();
    let mut e = BullyElection::new(1, vec![1, 2, 3], config());
    let mut fx = Outbox::new();
    e.start_election(t0, &mut fx);
    e.on_answer(3, t0 + ms(10));
    assert_eq!(e.state(), ElectionState::AwaitingCoordinatorAnnouncement);
    // The answer timeout no longer applies.
    e.poll(t0 + ms(200), &mut fx);
    assert_eq!(e.coordinator(), None);
    e.on_coordinator_message(3, t0 + ms(300), &mut fx);
    assert_eq!(e.coordinator(), Some(3));
    assert!(!e.is_coordinator());
    assert_eq!(e.state(), ElectionState::Idle);
  }

  #[test]
  fn election_from_lower_is_answered_and_bullied() {
    let t0 = Instant::now();
    let mut e = BullyElection::new(2, vec![1, 2, 3], config());
    let mut fx = Outbox::new();
    e.on_election_message(1, t0, &mut fx);
    assert_eq!(fx.sent_to(1), vec![&Message::Answer]);
    assert_eq!(fx.sent_to(3), vec![&Message::Election]);
    assert_eq!(e.state(), ElectionState::ElectionInProgress);
  }

  #[test]
  fn election_from_higher_is_ignored() {
    let t0 = Instant::now();
    let mut e = BullyElection::new(2, vec![1, 2, 3], config());
    let mut fx = Outbox::new();
    e.on_election_message(3, t0, &mut fx);
    assert!(fx.messages().is_empty());
    assert_eq!(e.state(), ElectionState::Idle);
  }

  #[test]
  fn retries_back_off_then_give_up() {
    let t0 = Instant::now();
    let mut e = BullyElection::new(1, vec![1, 2], config());
    let mut fx = Outbox::new();
    e.start_election(t0, &mut fx);
    e.on_answer(2, t0);
    // attempt 0 waits 500ms for the announcement
    assert_eq!(e.deadline(), Some(t0 + ms(500)));
    e.poll(t0 + ms(500), &mut fx);
    assert_eq!(e.state(), ElectionState::ElectionInProgress);
    // attempt 1 doubles the answer wait
    assert_eq!(e.deadline(), Some(t0 + ms(700)));
    let t1 = t0 + ms(600);
    e.on_answer(2, t1);
    assert_eq!(e.deadline(), Some(t1 + ms(1000)));
    e.poll(t1 + ms(1000), &mut fx);
    let t2 = t1 + ms(1100);
    e.on_answer(2, t2);
    e.poll(t2 + ms(2000), &mut fx);
    assert_eq!(e.state(), ElectionState::Idle);
    assert_eq!(e.coordinator(), None);
    assert_eq!(
      fx.events().last(),
      Some(&NodeEvent::ElectionAbandoned { attempts: 3 })
    );
    assert_eq!(fx.sent_to(2).len(), 3);
  }

  #[test]
  fn lower_announcement_is_challenged() {
    let t0 = Instant::now();
    let mut e = BullyElection::new(3, vec![1, 2, 3], config());
    let mut fx = Outbox::new();
    e.on_coordinator_message(2, t0, &mut fx);
    assert_eq!(e.coordinator(), Some(3));
    assert_eq!(fx.sent_to(2), vec![&Message::Coordinator(3)]);
  }

  #[test]
  fn converges_to_highest_live_id() {
    // Three live nodes out of five; 5 and 4 are dead. Whoever starts, 3 wins.
    for initiator in 1..=3u64 {
      let t0 = Instant::now();
      let live = [1u64, 2, 3];
      let mut nodes = live
        .iter()
        .map(|id| BullyElection::new(*id, vec![1, 2, 3, 4, 5], config()))
        .collect::<Vec<_>>();
      let mut queue = Vec::<(NodeId, NodeId, Message)>::new();
      let mut fx = Outbox::new();
      nodes[(initiator - 1) as usize].start_election(t0, &mut fx);
      queue.extend(fx.drain().0.into_iter().map(|(to, m)| (initiator, to, m)));
      let mut now = t0;
      for _ in 0..50 {
        while let Some((from, to, msg)) = queue.pop() {
          if !live.contains(&to) {
            continue;
          }
          let node = &mut nodes[(to - 1) as usize];
          let mut fx = Outbox::new();
          match msg {
            Message::Election => node.on_election_message(from, now, &mut fx),
            Message::Answer => node.on_answer(from, now),
            Message::Coordinator(c) => node.on_coordinator_message(c, now, &mut fx),
            _ => unreachable!(),
          }
          queue.extend(fx.drain().0.into_iter().map(|(t, m)| (to, t, m)));
        }
        now += ms(100);
        for (idx, node) in nodes.iter_mut().enumerate() {
          let mut fx = Outbox::new();
          node.poll(now, &mut fx);
          queue.extend(fx.drain().0.into_iter().map(|(t, m)| (idx as u64 + 1, t, m)));
        }
      }
      for node in nodes.iter() {
        assert_eq!(node.coordinator(), Some(3), "initiator {}", initiator);
        assert_eq!(node.state(), ElectionState::Idle);
      }
    }
  }
}
