//! The coordination layer: every protocol a sensor node runs, each as a state machine stepped by
//! the [`SensorNode`] actor.
//!
//! The state machines never touch the network or a timer. They take the current [`Instant`] and
//! write what they want sent into an [`Outbox`], and report deadlines for the node to sleep
//! until. This keeps every protocol testable without a runtime.
//!
//! - [`FailureDetector`]: heartbeat timeouts. Losing the coordinator triggers an election.
//! - [`BullyElection`]: the highest live id becomes coordinator.
//! - [`TokenRing`]: a single token grants the right to multicast a reading.
//! - [`SnapshotRecorder`]: Chandy-Lamport markers; fragments assemble into a [`GlobalSnapshot`].
//!
//! [`Instant`]: tokio::time::Instant
//! [`Outbox`]: crate::core::Outbox

mod election;
mod failure_detector;
mod node;
mod snapshot;
mod token_ring;
mod utils;

#[rustfmt::skip]
pub use {
  election::BullyElection,
  election::ElectionConfig,
  election::ElectionState,
  failure_detector::FailureDetector,
  node::NodeDeps,
  node::NodeError,
  node::NodeHandle,
  node::NodeStatus,
  node::SensorNode,
  snapshot::GlobalSnapshot,
  snapshot::Inconsistency,
  snapshot::LocalState,
  snapshot::SnapshotFragment,
  snapshot::SnapshotRecorder,
  token_ring::RingError,
  token_ring::TokenRing,
  utils::ClusterFile,
  utils::NodeConfig,
  utils::NodeEvent,
};
