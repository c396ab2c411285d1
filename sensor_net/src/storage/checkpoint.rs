use crate::core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// The state a node carries across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub node: NodeId,
  pub lamport_clock: u64,
  pub coordinator: Option<NodeId>,
  pub saved_at_ms: u64,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
  #[error("checkpoint I/O failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("malformed checkpoint: {0}")]
  Json(#[from] serde_json::Error),
}

pub trait CheckpointStore: Send + Sync + 'static {
  fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

  /// The checkpoint with the highest clock, if any was ever saved for `node`.
  fn load_latest_checkpoint(&self, node: NodeId) -> Result<Option<Checkpoint>, CheckpointError>;
}

/// One JSON file per checkpoint, named `checkpoint_<node>_<clock>.json`.
pub struct FileCheckpointStore {
  dir: PathBuf,
}
impl FileCheckpointStore {
  pub fn new<P: Into<PathBuf>>(dir: P) -> Result<FileCheckpointStore, CheckpointError> {
    let dir = dir.into();
    fs::create_dir_all(&dir)?;
    Ok(FileCheckpointStore { dir: dir })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn file_name(node: NodeId, clock: u64) -> String {
    // Zero padded so names sort like the clocks they carry.
    format!("checkpoint_{}_{:020}.json", node, clock)
  }

  // Clocks of every checkpoint file for `node`, ascending.
  fn versions(&self, node: NodeId) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
    let prefix = format!("checkpoint_{}_", node);
    let mut found = Vec::new();
    for entry in fs::read_dir(&self.dir)? {
      let path = entry?.path();
      let clock = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(prefix.as_str()))
        .and_then(|n| n.strip_suffix(".json"))
        .and_then(|n| n.parse::<u64>().ok());
      if let Some(clock) = clock {
        found.push((clock, path));
      }
    }
    found.sort_by_key(|(clock, _)| *clock);
    Ok(found)
  }

  fn read(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
  }

  /// Every checkpoint saved for `node`, oldest first.
  pub fn list_checkpoints(&self, node: NodeId) -> Result<Vec<Checkpoint>, CheckpointError> {
    self
      .versions(node)?
      .iter()
      .map(|(_, path)| Self::read(path))
      .collect()
  }
}
impl CheckpointStore for FileCheckpointStore {
  fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let name = Self::file_name(checkpoint.node, checkpoint.lamport_clock);
    let path = self.dir.join(&name);
    let temp = self.dir.join(format!(".{}.tmp", name));
    let data = serde_json::to_vec_pretty(checkpoint)?;
    let mut file = fs::File::create(&temp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    fs::rename(&temp, &path)?;
    Ok(())
  }

  fn load_latest_checkpoint(&self, node: NodeId) -> Result<Option<Checkpoint>, CheckpointError> {
    match self.versions(node)?.last() {
      Some((_, path)) => Ok(Some(Self::read(path)?)),
      None => Ok(None),
    }
  }
}

/// Keeps every checkpoint in memory. Outlives the nodes that use it, so a restarted node finds
/// what its previous incarnation saved.
#[derive(Default)]
pub struct MemoryCheckpointStore {
  saved: Mutex<BTreeMap<NodeId, Vec<Checkpoint>>>,
}
impl MemoryCheckpointStore {
  pub fn new() -> MemoryCheckpointStore {
    MemoryCheckpointStore::default()
  }

  pub fn list_checkpoints(&self, node: NodeId) -> Vec<Checkpoint> {
    let saved = self.saved.lock().unwrap_or_else(|e| e.into_inner());
    saved.get(&node).cloned().unwrap_or_default()
  }
}
impl CheckpointStore for MemoryCheckpointStore {
  fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let mut saved = self.saved.lock().unwrap_or_else(|e| e.into_inner());
    let history = saved.entry(checkpoint.node).or_default();
    history.retain(|c| c.lamport_clock != checkpoint.lamport_clock);
    history.push(checkpoint.clone());
    history.sort_by_key(|c| c.lamport_clock);
    Ok(())
  }

  fn load_latest_checkpoint(&self, node: NodeId) -> Result<Option<Checkpoint>, CheckpointError> {
    Ok(self.list_checkpoints(node).pop())
  }
}
