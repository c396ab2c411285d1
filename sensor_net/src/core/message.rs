use crate::cluster::NodeEvent;
use crate::core::NodeId;
use crate::sensor::Reading;
use serde::{Deserialize, Serialize};

/// Everything nodes say to each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
  Heartbeat,
  Election,
  Answer,
  Coordinator(NodeId),
  Token,
  Marker(SnapshotId),
  Data(Reading),
}
impl Message {
  pub fn kind(&self) -> &'static str {
    match self {
      Message::Heartbeat => "HEARTBEAT",
      Message::Election => "ELECTION",
      Message::Answer => "ANSWER",
      Message::Coordinator(_) => "COORDINATOR",
      Message::Token => "TOKEN",
      Message::Marker(_) => "MARKER",
      Message::Data(_) => "CHANNEL_DATA",
    }
  }

  /// Messages that carry application state across a channel, and therefore belong in a
  /// snapshot's channel state when caught in flight.
  pub fn is_channel_state(&self) -> bool {
    matches!(self, Message::Token | Message::Data(_))
  }
}

/// Names one snapshot round: the node that started it and that node's clock when it did. An
/// initiator's clock only grows, so its later rounds always have a higher `seq`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
  pub initiator: NodeId,
  pub seq: u64,
}

/// A [`Message`] as it travels: tagged with its sender and the sender's clock at send time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub from: NodeId,
  pub clock: u64,
  pub msg: Message,
}

/// Collects what a state machine wants done after a step: messages to send, in order, and
/// events for the audit sink.
#[derive(Default, Debug)]
pub struct Outbox {
  messages: Vec<(NodeId, Message)>,
  events: Vec<NodeEvent>,
}
impl Outbox {
  pub fn new() -> Outbox {
    Outbox::default()
  }

  pub fn send(&mut self, to: NodeId, msg: Message) {
    self.messages.push((to, msg));
  }

  pub fn broadcast<I: IntoIterator<Item = NodeId>>(&mut self, to: I, msg: Message) {
    for id in to {
      self.messages.push((id, msg.clone()));
    }
  }

  pub fn event(&mut self, event: NodeEvent) {
    self.events.push(event);
  }

  pub fn messages(&self) -> &[(NodeId, Message)] {
    &self.messages
  }

  pub fn events(&self) -> &[NodeEvent] {
    &self.events
  }

  pub fn is_empty(&self) -> bool {
    self.messages.is_empty() && self.events.is_empty()
  }

  /// Takes the queued messages and events, leaving the outbox empty.
  pub fn drain(&mut self) -> (Vec<(NodeId, Message)>, Vec<NodeEvent>) {
    (
      std::mem::take(&mut self.messages),
      std::mem::take(&mut self.events),
    )
  }

  /// Messages addressed to `to`, in the order they were queued.
  pub fn sent_to(&self, to: NodeId) -> Vec<&Message> {
    self
      .messages
      .iter()
      .filter(|(id, _)| *id == to)
      .map(|(_, m)| m)
      .collect()
  }
}
