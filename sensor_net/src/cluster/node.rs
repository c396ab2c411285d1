use crate::cluster::{
  BullyElection, ElectionConfig, ElectionState, FailureDetector, LocalState, NodeConfig,
  NodeEvent, RingError, SnapshotFragment, SnapshotRecorder, TokenRing,
};
use crate::core::{
  Envelope, LamportClock, Membership, Message, NodeId, Outbox, SharedClock, Transport,
};
use crate::sensor::{Reading, SensorSimulator};
use crate::storage::{
  unix_millis, AuditRecord, Checkpoint, CheckpointError, CheckpointStore, EventSink,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};
use Message::*;

#[derive(Debug, Error)]
pub enum NodeError {
  #[error("node has stopped")]
  Stopped,
  #[error("token did not arrive within {0:?}")]
  TokenTimeout(Duration),
  #[error("condition not reached within {0:?}")]
  WaitTimeout(Duration),
  #[error(transparent)]
  Ring(#[from] RingError),
  #[error(transparent)]
  Checkpoint(#[from] CheckpointError),
}

/// What the outside world may observe of a running node. Republished after every step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
  pub id: NodeId,
  pub running: bool,
  pub clock: u64,
  pub coordinator: Option<NodeId>,
  pub election: ElectionState,
  pub has_token: bool,
  pub recording: bool,
  pub live_peers: Vec<NodeId>,
  pub readings_sent: u64,
  pub readings_received: u64,
  pub snapshots_completed: u64,
  pub last_snapshot: Option<SnapshotFragment>,
}

enum NodeCmd {
  UseToken(oneshot::Sender<Result<Reading, RingError>>),
  StartSnapshot(oneshot::Sender<bool>),
  StartElection(oneshot::Sender<bool>),
  SaveCheckpoint(oneshot::Sender<Result<Checkpoint, CheckpointError>>),
  Stop(oneshot::Sender<()>),
}

type Reply = Box<dyn FnOnce() + Send>;

/// The collaborators a node talks to.
pub struct NodeDeps {
  pub transport: Arc<dyn Transport>,
  pub inbox: UnboundedReceiver<Envelope>,
  pub sink: Arc<dyn EventSink>,
  pub checkpoints: Arc<dyn CheckpointStore>,
}

/// One sensor process: the single task owning the clock, failure detector, election, token and
/// snapshot state of a node.
///
/// Inbound envelopes, commands from [`NodeHandle`]s and timers are handled one at a time, so no
/// two of them ever interleave. Each step collects its effects in an [`Outbox`], after which the
/// node records the step's events, sends its messages in order (ticking the clock once per
/// envelope) and republishes its [`NodeStatus`].
pub struct SensorNode {
  me: NodeId,
  peers: Vec<NodeId>,
  config: NodeConfig,
  clock: SharedClock,
  detector: FailureDetector,
  election: BullyElection,
  ring: TokenRing,
  snapshot: SnapshotRecorder,
  sensor: SensorSimulator,
  sent: BTreeMap<NodeId, u64>,
  received: BTreeMap<NodeId, u64>,
  last_reading: Option<Reading>,
  transport: Arc<dyn Transport>,
  sink: Arc<dyn EventSink>,
  checkpoints: Arc<dyn CheckpointStore>,
  status: watch::Sender<NodeStatus>,
  next_heartbeat: Instant,
  next_sweep: Instant,
  token_since: Option<Instant>,
  next_snapshot: Option<Instant>,
  next_checkpoint: Option<Instant>,
  saved_coordinator: Option<NodeId>,
}
impl SensorNode {
  pub fn spawn(
    me: NodeId,
    membership: &Membership,
    config: NodeConfig,
    deps: NodeDeps,
  ) -> NodeHandle {
    Self::spawn_with_sensor(me, membership, config, deps, SensorSimulator::new(me))
  }

  pub fn spawn_with_sensor(
    me: NodeId,
    membership: &Membership,
    config: NodeConfig,
    deps: NodeDeps,
    sensor: SensorSimulator,
  ) -> NodeHandle {
    let now = Instant::now();
    let ids = membership.ids();
    let peers = membership.peers_of(me);
    let holder = config.initial_token_holder.or_else(|| membership.lowest());
    let restored = deps.checkpoints.load_latest_checkpoint(me);
    // An earlier incarnation may have passed the token on, so only a cold start creates it.
    let cold = matches!(restored, Ok(None));
    let clock = SharedClock::new(LamportClock::new());
    let election = BullyElection::new(
      me,
      ids.clone(),
      ElectionConfig {
        answer_timeout: config.answer_timeout,
        coordinator_timeout: config.coordinator_timeout,
        max_retries: config.max_election_retries,
      },
    );
    let ring = TokenRing::new(me, ids.clone(), cold && holder == Some(me));
    let status = NodeStatus {
      id: me,
      running: true,
      clock: 0,
      coordinator: None,
      election: ElectionState::Idle,
      has_token: ring.has_token(),
      recording: false,
      live_peers: peers.clone(),
      readings_sent: 0,
      readings_received: 0,
      snapshots_completed: 0,
      last_snapshot: None,
    };
    let (status_tx, status_rx) = watch::channel(status);
    let (cmd_tx, cmd_rx) = unbounded_channel();
    let node = SensorNode {
      me: me,
      peers: peers.clone(),
      detector: FailureDetector::new(me, config.failure_timeout),
      election: election,
      token_since: if ring.has_token() { Some(now) } else { None },
      ring: ring,
      snapshot: SnapshotRecorder::new(me, peers, config.snapshot_timeout),
      sensor: sensor,
      sent: BTreeMap::new(),
      received: BTreeMap::new(),
      last_reading: None,
      transport: deps.transport,
      sink: deps.sink,
      checkpoints: deps.checkpoints,
      status: status_tx,
      next_heartbeat: now,
      next_sweep: now + config.sweep_interval,
      next_snapshot: config.snapshot_interval.map(|i| now + i),
      next_checkpoint: config.checkpoint_interval.map(|i| now + i),
      saved_coordinator: None,
      clock: clock.clone(),
      config: config,
    };
    let handle = NodeHandle {
      id: me,
      poll_interval: node.config.token_poll_interval,
      clock: clock,
      cmds: cmd_tx,
      status: status_rx,
    };
    tokio::spawn(node.run(restored, deps.inbox, cmd_rx));
    handle
  }

  async fn run(
    mut self,
    restored: Result<Option<Checkpoint>, CheckpointError>,
    mut inbox: UnboundedReceiver<Envelope>,
    mut cmds: UnboundedReceiver<NodeCmd>,
  ) {
    let mut fx = Outbox::new();
    let now = Instant::now();
    self.restore(restored, &mut fx);
    self.detector.track(self.peers.iter().copied(), now);
    if self.config.elect_on_start {
      self.election.start_election(now, &mut fx);
    }
    info!(node = self.me, peers = ?self.peers, token = self.ring.has_token(), "node started");
    self.after_step(fx, None).await;

    let mut stopped = None;
    loop {
      let mut fx = Outbox::new();
      let mut reply = None;
      let wake = self.next_wake();
      tokio::select! {
        env = inbox.recv() => match env {
          Some(env) => self.on_envelope(env, Instant::now(), &mut fx),
          None => break,
        },
        cmd = cmds.recv() => match cmd {
          Some(NodeCmd::Stop(ack)) => {
            stopped = Some(ack);
            break;
          }
          Some(cmd) => reply = Some(self.on_command(cmd, Instant::now(), &mut fx)),
          // Every handle is gone; nobody can observe or stop this node any more.
          None => break,
        },
        _ = sleep_until(wake) => self.on_timers(Instant::now(), &mut fx),
      }
      self.after_step(fx, reply).await;
    }

    let mut fx = Outbox::new();
    if let Err(e) = self.save_checkpoint(&mut fx) {
      warn!(node = self.me, "could not checkpoint at shutdown: {}", e);
    }
    self.after_step(fx, None).await;
    self.status.send_modify(|s| s.running = false);
    info!(node = self.me, clock = self.clock.time(), "node stopped");
    if let Some(ack) = stopped {
      let _ = ack.send(());
    }
  }

  fn restore(
    &mut self,
    restored: Result<Option<Checkpoint>, CheckpointError>,
    fx: &mut Outbox,
  ) {
    match restored {
      Ok(Some(cp)) => {
        self.clock.update(cp.lamport_clock);
        self.election.restore_coordinator(cp.coordinator);
        self.saved_coordinator = cp.coordinator;
        info!(node = self.me, clock = cp.lamport_clock, "restored checkpoint");
        fx.event(NodeEvent::CheckpointRestored {
          clock: cp.lamport_clock,
          coordinator: cp.coordinator,
        });
      }
      Ok(None) => debug!(node = self.me, "no checkpoint to restore"),
      Err(e) => warn!(node = self.me, "ignoring unreadable checkpoint: {}", e),
    }
  }

  fn next_wake(&self) -> Instant {
    let token = match (self.token_since, self.config.token_hold) {
      (Some(since), Some(hold)) if self.ring.has_token() => Some(since + hold),
      _ => None,
    };
    [
      Some(self.next_heartbeat),
      Some(self.next_sweep),
      self.election.deadline(),
      self.snapshot.deadline(),
      token,
      self.next_snapshot,
      self.next_checkpoint,
    ]
    .iter()
    .flatten()
    .copied()
    .min()
    .unwrap_or(self.next_heartbeat)
  }

  fn local_state(&self) -> LocalState {
    LocalState {
      node: self.me,
      clock: self.clock.time(),
      coordinator: self.election.coordinator(),
      has_token: self.ring.has_token(),
      readings_taken: self.sensor.taken(),
      sent: self.sent.clone(),
      received: self.received.clone(),
      last_reading: self.last_reading,
    }
  }

  fn on_envelope(&mut self, env: Envelope, now: Instant, fx: &mut Outbox) {
    let from = env.from;
    if from == self.me || !self.peers.contains(&from) {
      warn!(node = self.me, from, kind = env.msg.kind(), "envelope from outside the ring");
      return;
    }
    self.clock.update(env.clock);
    trace!(node = self.me, from, kind = env.msg.kind(), clock = env.clock, "received");
    // Channel state is recorded as it stood before this message is applied.
    self.snapshot.on_channel_message(&env);
    match env.msg {
      Heartbeat => {
        let recovered = self.detector.on_heartbeat(from, now, fx);
        // A returning node that outranks the coordinator must end up in charge.
        if recovered && self.election.coordinator().map_or(true, |c| from > c) {
          self.election.start_election(now, fx);
        }
      }
      Election => self.election.on_election_message(from, now, fx),
      Answer => self.election.on_answer(from, now),
      Coordinator(coordinator) => self.election.on_coordinator_message(coordinator, now, fx),
      Token => {
        self.ring.on_token_received(from, fx);
        self.token_since = Some(now);
      }
      Marker(round) => {
        let local = self.local_state();
        self.snapshot.on_marker(from, round, || local, now, fx);
      }
      Data(reading) => {
        *self.received.entry(from).or_insert(0) += 1;
        fx.event(NodeEvent::DataReceived { reading: reading });
      }
    }
  }

  fn on_command(&mut self, cmd: NodeCmd, now: Instant, fx: &mut Outbox) -> Reply {
    match cmd {
      NodeCmd::UseToken(tx) => {
        let res = self.critical_send(fx);
        Box::new(move || {
          let _ = tx.send(res);
        })
      }
      NodeCmd::StartSnapshot(tx) => {
        let local = self.local_state();
        let started = self.snapshot.start_snapshot(local, now, fx);
        Box::new(move || {
          let _ = tx.send(started);
        })
      }
      NodeCmd::StartElection(tx) => {
        let started = self.election.start_election(now, fx);
        Box::new(move || {
          let _ = tx.send(started);
        })
      }
      NodeCmd::SaveCheckpoint(tx) => {
        let res = self.save_checkpoint(fx);
        Box::new(move || {
          let _ = tx.send(res);
        })
      }
      NodeCmd::Stop(tx) => Box::new(move || {
        let _ = tx.send(());
      }),
    }
  }

  /// Takes one reading and multicasts it to every peer, under the token.
  fn critical_send(&mut self, fx: &mut Outbox) -> Result<Reading, RingError> {
    let peers = &self.peers;
    let sensor = &mut self.sensor;
    let sent = &mut self.sent;
    let clock = &self.clock;
    let res = self.ring.use_token_then_pass(
      |fx| {
        clock.tick();
        let reading = sensor.sample();
        for peer in peers.iter() {
          fx.send(*peer, Data(reading));
          *sent.entry(*peer).or_insert(0) += 1;
        }
        fx.event(NodeEvent::DataSent { reading: reading });
        reading
      },
      fx,
    );
    if let Ok(reading) = &res {
      debug!(node = self.me, seq = reading.seq, "reading sent under the token");
      self.last_reading = Some(*reading);
      if !self.ring.has_token() {
        self.token_since = None;
      }
    }
    res
  }

  fn on_timers(&mut self, now: Instant, fx: &mut Outbox) {
    if now >= self.next_heartbeat {
      fx.broadcast(self.peers.iter().copied(), Heartbeat);
      self.next_heartbeat = now + self.config.heartbeat_interval;
    }
    if now >= self.next_sweep {
      let electing = self.election.state() != ElectionState::Idle;
      let trigger = self.detector.sweep(now, self.election.coordinator(), electing, fx);
      let failed = fx
        .events()
        .iter()
        .filter_map(|e| match e {
          NodeEvent::NodeFailed { node } => Some(*node),
          _ => None,
        })
        .collect::<Vec<_>>();
      for node in failed {
        self.election.on_node_failed(node);
      }
      if trigger {
        self.election.start_election(now, fx);
      }
      self.next_sweep = now + self.config.sweep_interval;
    }
    self.election.poll(now, fx);
    self.snapshot.poll(now, fx);
    if let (Some(since), Some(hold)) = (self.token_since, self.config.token_hold) {
      if self.ring.has_token() && now >= since + hold {
        trace!(node = self.me, "passing idle token");
        let _ = self.ring.pass(fx);
        self.token_since = if self.ring.has_token() { Some(now) } else { None };
      }
    }
    if let (Some(at), Some(every)) = (self.next_snapshot, self.config.snapshot_interval) {
      if now >= at {
        if self.election.is_coordinator() && !self.snapshot.is_recording() {
          let local = self.local_state();
          self.snapshot.start_snapshot(local, now, fx);
        }
        self.next_snapshot = Some(now + every);
      }
    }
    if let (Some(at), Some(every)) = (self.next_checkpoint, self.config.checkpoint_interval) {
      if now >= at {
        if let Err(e) = self.save_checkpoint(fx) {
          warn!(node = self.me, "periodic checkpoint failed: {}", e);
        }
        self.next_checkpoint = Some(now + every);
      }
    }
  }

  fn save_checkpoint(&mut self, fx: &mut Outbox) -> Result<Checkpoint, CheckpointError> {
    let cp = Checkpoint {
      node: self.me,
      lamport_clock: self.clock.tick(),
      coordinator: self.election.coordinator(),
      saved_at_ms: unix_millis(),
    };
    self.checkpoints.save_checkpoint(&cp)?;
    self.saved_coordinator = cp.coordinator;
    debug!(node = self.me, clock = cp.lamport_clock, "checkpoint saved");
    fx.event(NodeEvent::CheckpointSaved {
      clock: cp.lamport_clock,
    });
    Ok(cp)
  }

  async fn after_step(&mut self, mut fx: Outbox, reply: Option<Reply>) {
    let snapshot_started = fx
      .events()
      .iter()
      .any(|e| matches!(e, NodeEvent::SnapshotStarted { .. }));
    if snapshot_started || self.election.coordinator() != self.saved_coordinator {
      if let Err(e) = self.save_checkpoint(&mut fx) {
        warn!(node = self.me, "checkpoint failed: {}", e);
      }
    }
    let (messages, events) = fx.drain();
    for event in events {
      let record = AuditRecord::new(self.me, self.clock.time(), event);
      self.sink.record_event(record);
    }
    for (to, msg) in messages {
      let envelope = Envelope {
        from: self.me,
        clock: self.clock.tick(),
        msg: msg,
      };
      let kind = envelope.msg.kind();
      if let Err(e) = self.transport.send(to, envelope).await {
        warn!(node = self.me, to, kind, "send failed: {}", e);
      }
    }
    let status = NodeStatus {
      id: self.me,
      running: true,
      clock: self.clock.time(),
      coordinator: self.election.coordinator(),
      election: self.election.state(),
      has_token: self.ring.has_token(),
      recording: self.snapshot.is_recording(),
      live_peers: self.detector.live(),
      readings_sent: self.sensor.taken(),
      readings_received: self.received.values().sum(),
      snapshots_completed: self.snapshot.completed(),
      last_snapshot: self.snapshot.last_completed().cloned(),
    };
    self.status.send_if_modified(|current| {
      if *current == status {
        false
      } else {
        *current = status;
        true
      }
    });
    if let Some(reply) = reply {
      reply();
    }
  }
}

/// A cheap, cloneable way to observe and command a [`SensorNode`].
#[derive(Clone)]
pub struct NodeHandle {
  id: NodeId,
  poll_interval: Duration,
  clock: SharedClock,
  cmds: UnboundedSender<NodeCmd>,
  status: watch::Receiver<NodeStatus>,
}
impl NodeHandle {
  pub fn id(&self) -> NodeId {
    self.id
  }

  pub fn status(&self) -> NodeStatus {
    self.status.borrow().clone()
  }

  pub fn watch(&self) -> watch::Receiver<NodeStatus> {
    self.status.clone()
  }

  /// The live clock, which may be ahead of the last published status.
  pub fn clock(&self) -> u64 {
    self.clock.time()
  }

  pub fn coordinator(&self) -> Option<NodeId> {
    self.status.borrow().coordinator
  }

  pub fn has_token(&self) -> bool {
    self.status.borrow().has_token
  }

  pub fn is_running(&self) -> bool {
    self.status.borrow().running && !self.cmds.is_closed()
  }

  async fn request<T, F>(&self, make: F) -> Result<T, NodeError>
  where
    F: FnOnce(oneshot::Sender<T>) -> NodeCmd,
  {
    let (tx, rx) = oneshot::channel();
    self.cmds.send(make(tx)).map_err(|_| NodeError::Stopped)?;
    rx.await.map_err(|_| NodeError::Stopped)
  }

  /// Sends one reading to every peer if this node holds the token right now.
  pub async fn send_data(&self) -> Result<Reading, NodeError> {
    Ok(self.request(NodeCmd::UseToken).await??)
  }

  /// Waits for the token, checking every `token_poll_interval`, then sends one reading to every
  /// peer and passes the token on.
  pub async fn use_token_then_pass(&self, timeout: Duration) -> Result<Reading, NodeError> {
    let deadline = Instant::now() + timeout;
    loop {
      if self.has_token() {
        match self.request(NodeCmd::UseToken).await? {
          Ok(reading) => return Ok(reading),
          // Passed on between the check and the request.
          Err(RingError::NotHolder(_)) => {}
        }
      }
      if Instant::now() >= deadline {
        return Err(NodeError::TokenTimeout(timeout));
      }
      sleep(self.poll_interval).await;
    }
  }

  /// Returns false if a snapshot was already being recorded.
  pub async fn start_snapshot(&self) -> Result<bool, NodeError> {
    self.request(NodeCmd::StartSnapshot).await
  }

  /// Returns false if an election round was already running.
  pub async fn start_election(&self) -> Result<bool, NodeError> {
    self.request(NodeCmd::StartElection).await
  }

  pub async fn save_checkpoint(&self) -> Result<Checkpoint, NodeError> {
    Ok(self.request(NodeCmd::SaveCheckpoint).await??)
  }

  /// Stops the node after a final checkpoint. Stopping a stopped node does nothing.
  pub async fn stop(&self) {
    let _ = self.request(NodeCmd::Stop).await;
  }

  /// Waits until the published status satisfies `pred`.
  pub async fn wait_until<F>(
    &self,
    timeout: Duration,
    mut pred: F,
  ) -> Result<NodeStatus, NodeError>
  where
    F: FnMut(&NodeStatus) -> bool,
  {
    let mut rx = self.status.clone();
    let wait = async {
      loop {
        {
          let status = rx.borrow_and_update();
          if pred(&status) {
            return Ok(status.clone());
          }
        }
        if rx.changed().await.is_err() {
          return Err(NodeError::Stopped);
        }
      }
    };
    tokio::time::timeout(timeout, wait)
      .await
      .unwrap_or(Err(NodeError::WaitTimeout(timeout)))
  }
}
