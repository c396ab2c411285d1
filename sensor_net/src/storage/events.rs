use crate::cluster::NodeEvent;
use crate::core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// One entry of the audit log: what happened, where, and at which logical time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
  pub node: NodeId,
  pub clock: u64,
  /// Wall-clock milliseconds since the epoch, for humans reading the log.
  pub recorded_at_ms: u64,
  pub event: NodeEvent,
}
impl AuditRecord {
  pub fn new(node: NodeId, clock: u64, event: NodeEvent) -> AuditRecord {
    AuditRecord {
      node: node,
      clock: clock,
      recorded_at_ms: unix_millis(),
      event: event,
    }
  }

  pub fn kind(&self) -> &'static str {
    self.event.kind()
  }
}

pub(crate) fn unix_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Where nodes report their events. Fire and forget: implementations must not block and must not
/// fail the caller.
pub trait EventSink: Send + Sync + 'static {
  fn record_event(&self, record: AuditRecord);
}

/// Discards everything.
pub struct NullSink;
impl EventSink for NullSink {
  fn record_event(&self, _: AuditRecord) {}
}

/// An in-memory audit log keeping the most recent records. Can be shared by a whole cluster.
pub struct EventLog {
  capacity: usize,
  records: Mutex<VecDeque<AuditRecord>>,
}
impl EventLog {
  pub const DEFAULT_CAPACITY: usize = 1000;

  pub fn new() -> EventLog {
    EventLog::with_capacity(Self::DEFAULT_CAPACITY)
  }

  pub fn with_capacity(capacity: usize) -> EventLog {
    EventLog {
      capacity: capacity,
      records: Mutex::new(VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY))),
    }
  }

  fn lock(&self) -> MutexGuard<'_, VecDeque<AuditRecord>> {
    self.records.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn all(&self) -> Vec<AuditRecord> {
    self.lock().iter().cloned().collect()
  }

  pub fn events_by_kind(&self, kind: &str) -> Vec<AuditRecord> {
    self.lock().iter().filter(|r| r.kind() == kind).cloned().collect()
  }

  pub fn for_node(&self, node: NodeId) -> Vec<AuditRecord> {
    self.lock().iter().filter(|r| r.node == node).cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}
impl Default for EventLog {
  fn default() -> Self {
    EventLog::new()
  }
}
impl EventSink for EventLog {
  fn record_event(&self, record: AuditRecord) {
    if self.capacity == 0 {
      return;
    }
    let mut records = self.lock();
    while records.len() >= self.capacity {
      records.pop_front();
    }
    records.push_back(record);
  }
}

#[test]
fn test_event_log_keeps_most_recent() {
  let log = EventLog::with_capacity(3);
  for clock in 1..=5 {
    log.record_event(AuditRecord::new(1, clock, NodeEvent::CheckpointSaved { clock: clock }));
  }
  log.record_event(AuditRecord::new(2, 9, NodeEvent::NodeFailed { node: 1 }));
  let clocks = log.all().iter().map(|r| r.clock).collect::<Vec<_>>();
  assert_eq!(clocks, vec![4, 5, 9]);
  assert_eq!(log.events_by_kind("failure").len(), 1);
  assert_eq!(log.events_by_kind("checkpoint").len(), 2);
  assert_eq!(log.for_node(2)[0].event, NodeEvent::NodeFailed { node: 1 });
}
