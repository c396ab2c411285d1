//! The two collaborators a node writes to besides the network: an audit [`EventSink`] and a
//! [`CheckpointStore`].

mod checkpoint;
mod events;

pub(crate) use events::unix_millis;

#[rustfmt::skip]
pub use {
  checkpoint::Checkpoint,
  checkpoint::CheckpointError,
  checkpoint::CheckpointStore,
  checkpoint::FileCheckpointStore,
  checkpoint::MemoryCheckpointStore,
  events::AuditRecord,
  events::EventLog,
  events::EventSink,
  events::NullSink,
};
