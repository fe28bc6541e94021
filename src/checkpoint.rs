//! Checkpoint storage for change-feed consumers.
//!
//! A consumer persists its progress as opaque continuation tokens keyed by a
//! lease name (one lease per consumer and range). [`CheckpointStore`] is the
//! storage seam; [`PositionCheckpointer`] sits on top of it, encoding
//! [`StreamPosition`]s through [`ContinuationCodec`] and deciding when to
//! write according to its [`CommitCadence`].

use crate::continuation::ContinuationCodec;
use crate::position::{FeedRange, PositionError, StreamPosition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

/// A committed continuation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
  /// Opaque token produced by [`ContinuationCodec::encode`].
  pub token: String,
  /// When the token was committed.
  pub committed_at: DateTime<Utc>,
}

impl Checkpoint {
  /// Wraps a token committed now.
  pub fn new(token: impl Into<String>) -> Self {
    Self {
      token: token.into(),
      committed_at: Utc::now(),
    }
  }
}

/// When [`PositionCheckpointer::record`] writes through to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommitCadence {
  /// Commit after every page of reads.
  #[default]
  EveryPage,
  /// Commit every `n` recorded pages.
  Periodic(usize),
  /// Only commit when asked.
  Manual,
}

/// Error type for checkpoint operations.
#[derive(Error, Debug)]
pub enum CheckpointError {
  /// IO error during persistence.
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
  /// Serialization/deserialization error.
  #[error("serialization error: {0}")]
  Serialization(String),
  /// Lock acquisition failed.
  #[error("lock error: {0}")]
  Lock(String),
  /// A stored token could not be turned back into a position, or a position
  /// could not be encoded.
  #[error(transparent)]
  Position(#[from] PositionError),
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Storage backend for continuation tokens.
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
  /// Gets the checkpoint committed for a lease.
  fn get(&self, lease: &str) -> CheckpointResult<Option<Checkpoint>>;

  /// Commits a checkpoint for a lease, replacing the previous one.
  fn commit(&self, lease: &str, checkpoint: Checkpoint) -> CheckpointResult<()>;

  /// Gets every committed checkpoint.
  fn get_all(&self) -> CheckpointResult<HashMap<String, Checkpoint>>;

  /// Forgets a lease.
  fn clear(&self, lease: &str) -> CheckpointResult<()>;

  /// Forgets every lease.
  fn clear_all(&self) -> CheckpointResult<()>;
}

fn lock_error<E: std::fmt::Display>(e: E) -> CheckpointError {
  CheckpointError::Lock(e.to_string())
}

/// In-memory checkpoint store, for tests and consumers that do not outlive
/// the process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
  checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
  /// Creates an empty store.
  pub fn new() -> Self {
    Self::default()
  }
}

impl CheckpointStore for InMemoryCheckpointStore {
  fn get(&self, lease: &str) -> CheckpointResult<Option<Checkpoint>> {
    let checkpoints = self.checkpoints.read().map_err(lock_error)?;
    Ok(checkpoints.get(lease).cloned())
  }

  fn commit(&self, lease: &str, checkpoint: Checkpoint) -> CheckpointResult<()> {
    let mut checkpoints = self.checkpoints.write().map_err(lock_error)?;
    checkpoints.insert(lease.to_string(), checkpoint);
    Ok(())
  }

  fn get_all(&self) -> CheckpointResult<HashMap<String, Checkpoint>> {
    let checkpoints = self.checkpoints.read().map_err(lock_error)?;
    Ok(checkpoints.clone())
  }

  fn clear(&self, lease: &str) -> CheckpointResult<()> {
    let mut checkpoints = self.checkpoints.write().map_err(lock_error)?;
    checkpoints.remove(lease);
    Ok(())
  }

  fn clear_all(&self) -> CheckpointResult<()> {
    let mut checkpoints = self.checkpoints.write().map_err(lock_error)?;
    checkpoints.clear();
    Ok(())
  }
}

/// Checkpoint store backed by a JSON file.
///
/// The whole file is rewritten on every change.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
  path: PathBuf,
  cache: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl FileCheckpointStore {
  /// Opens the store at `path`, loading existing checkpoints if the file
  /// exists.
  pub fn new<P: AsRef<Path>>(path: P) -> CheckpointResult<Self> {
    let path = path.as_ref().to_path_buf();

    let cache = if path.exists() {
      let data = fs::read_to_string(&path)?;
      if data.trim().is_empty() {
        HashMap::new()
      } else {
        serde_json::from_str(&data).map_err(|e| CheckpointError::Serialization(e.to_string()))?
      }
    } else {
      HashMap::new()
    };

    Ok(Self {
      path,
      cache: Arc::new(RwLock::new(cache)),
    })
  }

  /// Path of the backing file.
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn persist(&self, checkpoints: &HashMap<String, Checkpoint>) -> CheckpointResult<()> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(checkpoints)
      .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    fs::write(&self.path, data)?;
    Ok(())
  }
}

impl CheckpointStore for FileCheckpointStore {
  fn get(&self, lease: &str) -> CheckpointResult<Option<Checkpoint>> {
    let cache = self.cache.read().map_err(lock_error)?;
    Ok(cache.get(lease).cloned())
  }

  fn commit(&self, lease: &str, checkpoint: Checkpoint) -> CheckpointResult<()> {
    let mut cache = self.cache.write().map_err(lock_error)?;
    cache.insert(lease.to_string(), checkpoint);
    self.persist(&cache)
  }

  fn get_all(&self) -> CheckpointResult<HashMap<String, Checkpoint>> {
    let cache = self.cache.read().map_err(lock_error)?;
    Ok(cache.clone())
  }

  fn clear(&self, lease: &str) -> CheckpointResult<()> {
    let mut cache = self.cache.write().map_err(lock_error)?;
    cache.remove(lease);
    self.persist(&cache)
  }

  fn clear_all(&self) -> CheckpointResult<()> {
    let mut cache = self.cache.write().map_err(lock_error)?;
    cache.clear();
    self.persist(&cache)
  }
}

/// Records [`StreamPosition`]s per lease and commits them as tokens.
#[derive(Debug)]
pub struct PositionCheckpointer {
  store: Box<dyn CheckpointStore>,
  codec: ContinuationCodec,
  cadence: CommitCadence,
  pending: RwLock<HashMap<String, (StreamPosition, usize)>>,
}

impl PositionCheckpointer {
  /// Creates a checkpointer that commits every page.
  pub fn new(store: Box<dyn CheckpointStore>) -> Self {
    Self::with_cadence(store, CommitCadence::default())
  }

  /// Creates a checkpointer with the given cadence.
  pub fn with_cadence(store: Box<dyn CheckpointStore>, cadence: CommitCadence) -> Self {
    Self {
      store,
      codec: ContinuationCodec::new(),
      cadence,
      pending: RwLock::new(HashMap::new()),
    }
  }

  /// Commit cadence.
  pub fn cadence(&self) -> CommitCadence {
    self.cadence
  }

  /// Loads the committed position for a lease.
  pub fn load(&self, lease: &str) -> CheckpointResult<Option<StreamPosition>> {
    match self.store.get(lease)? {
      Some(checkpoint) => Ok(Some(self.codec.decode(&checkpoint.token)?)),
      None => Ok(None),
    }
  }

  /// Loads the committed position for a lease, re-targeted at `range`.
  ///
  /// Used when the lease's range has split or merged since the commit.
  pub fn load_for_range(&self, lease: &str, range: &FeedRange) -> CheckpointResult<Option<StreamPosition>> {
    match self.store.get(lease)? {
      Some(checkpoint) => Ok(Some(self.codec.decode_for_range(&checkpoint.token, range)?)),
      None => Ok(None),
    }
  }

  /// Records a position after a successful page of reads.
  ///
  /// Depending on the cadence this commits now or holds the position.
  pub fn record(&self, lease: &str, position: &StreamPosition) -> CheckpointResult<()> {
    let due = {
      let mut pending = self.pending.write().map_err(lock_error)?;
      let entry = pending
        .entry(lease.to_string())
        .or_insert_with(|| (position.clone(), 0));
      entry.0 = position.clone();
      entry.1 += 1;
      match self.cadence {
        CommitCadence::EveryPage => true,
        CommitCadence::Periodic(interval) => entry.1 >= interval.max(1),
        CommitCadence::Manual => false,
      }
    };

    if due {
      self.commit(lease)?;
    }
    Ok(())
  }

  /// Commits the pending position for a lease, if any.
  pub fn commit(&self, lease: &str) -> CheckpointResult<()> {
    let position = {
      let pending = self.pending.read().map_err(lock_error)?;
      pending.get(lease).map(|(position, _)| position.clone())
    };

    if let Some(position) = position {
      let token = self.codec.encode(&position)?;
      self.store.commit(lease, Checkpoint::new(token))?;
      debug!(lease, position = %position, "checkpoint committed");
      let mut pending = self.pending.write().map_err(lock_error)?;
      pending.remove(lease);
    }
    Ok(())
  }

  /// Commits every pending position.
  pub fn commit_all(&self) -> CheckpointResult<()> {
    let leases: Vec<String> = {
      let pending = self.pending.read().map_err(lock_error)?;
      pending.keys().cloned().collect()
    };
    for lease in leases {
      self.commit(&lease)?;
    }
    Ok(())
  }

  /// Position recorded for a lease but not yet committed.
  pub fn pending(&self, lease: &str) -> CheckpointResult<Option<StreamPosition>> {
    let pending = self.pending.read().map_err(lock_error)?;
    Ok(pending.get(lease).map(|(position, _)| position.clone()))
  }

  /// Forgets both the committed and the pending position of a lease.
  pub fn clear(&self, lease: &str) -> CheckpointResult<()> {
    self.store.clear(lease)?;
    let mut pending = self.pending.write().map_err(lock_error)?;
    pending.remove(lease);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::position::{RetentionWindow, StartSpecification, StreamMode};
  use crate::resolver::PositionResolver;
  use tempfile::tempdir;

  fn marker_position(etag: &str) -> StreamPosition {
    PositionResolver::default().resolve_from_marker(Some(etag), FeedRange::full("0"))
  }

  #[test]
  fn test_in_memory_store() {
    let store = InMemoryCheckpointStore::new();
    assert!(store.get("lease-a").unwrap().is_none());

    store.commit("lease-a", Checkpoint::new("t1")).unwrap();
    store.commit("lease-b", Checkpoint::new("t2")).unwrap();
    store.commit("lease-a", Checkpoint::new("t3")).unwrap();

    assert_eq!(store.get("lease-a").unwrap().unwrap().token, "t3");
    assert_eq!(store.get_all().unwrap().len(), 2);

    store.clear("lease-a").unwrap();
    assert!(store.get("lease-a").unwrap().is_none());
    store.clear_all().unwrap();
    assert!(store.get_all().unwrap().is_empty());
  }

  #[test]
  fn test_file_store_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("leases.json");

    {
      let store = FileCheckpointStore::new(&path).unwrap();
      store.commit("lease-a", Checkpoint::new("token-a")).unwrap();
      store.commit("lease-b", Checkpoint::new("token-b")).unwrap();
      store.clear("lease-b").unwrap();
    }

    let reopened = FileCheckpointStore::new(&path).unwrap();
    assert_eq!(reopened.path(), path.as_path());
    assert_eq!(reopened.get("lease-a").unwrap().unwrap().token, "token-a");
    assert!(reopened.get("lease-b").unwrap().is_none());
  }

  #[test]
  fn test_file_store_rejects_corrupt_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("leases.json");
    fs::write(&path, "not json").unwrap();

    assert!(matches!(
      FileCheckpointStore::new(&path),
      Err(CheckpointError::Serialization(_))
    ));
  }

  #[test]
  fn test_checkpointer_every_page() {
    let store = InMemoryCheckpointStore::new();
    let checkpointer = PositionCheckpointer::new(Box::new(store.clone()));

    checkpointer.record("lease", &marker_position("1")).unwrap();
    checkpointer.record("lease", &marker_position("2")).unwrap();

    assert_eq!(checkpointer.load("lease").unwrap(), Some(marker_position("2")));
    assert!(checkpointer.pending("lease").unwrap().is_none());
    assert!(store.get("lease").unwrap().unwrap().token.starts_with("cf1."));
  }

  #[test]
  fn test_checkpointer_periodic() {
    let checkpointer = PositionCheckpointer::with_cadence(
      Box::new(InMemoryCheckpointStore::new()),
      CommitCadence::Periodic(3),
    );

    checkpointer.record("lease", &marker_position("1")).unwrap();
    checkpointer.record("lease", &marker_position("2")).unwrap();
    assert!(checkpointer.load("lease").unwrap().is_none());
    assert_eq!(checkpointer.pending("lease").unwrap(), Some(marker_position("2")));

    checkpointer.record("lease", &marker_position("3")).unwrap();
    assert_eq!(checkpointer.load("lease").unwrap(), Some(marker_position("3")));

    checkpointer.record("lease", &marker_position("4")).unwrap();
    assert_eq!(checkpointer.load("lease").unwrap(), Some(marker_position("3")));
  }

  #[test]
  fn test_checkpointer_manual() {
    let checkpointer = PositionCheckpointer::with_cadence(
      Box::new(InMemoryCheckpointStore::new()),
      CommitCadence::Manual,
    );

    checkpointer.record("a", &marker_position("1")).unwrap();
    checkpointer.record("b", &marker_position("2")).unwrap();
    assert!(checkpointer.load("a").unwrap().is_none());

    checkpointer.commit_all().unwrap();
    assert_eq!(checkpointer.load("a").unwrap(), Some(marker_position("1")));
    assert_eq!(checkpointer.load("b").unwrap(), Some(marker_position("2")));

    checkpointer.clear("a").unwrap();
    assert!(checkpointer.load("a").unwrap().is_none());
  }

  #[test]
  fn test_checkpointer_load_for_split_range() {
    let checkpointer = PositionCheckpointer::new(Box::new(InMemoryCheckpointStore::new()));
    checkpointer.record("lease", &marker_position("\"77\"")).unwrap();

    let child = FeedRange::new("1", "", "7F").unwrap();
    let position = checkpointer.load_for_range("lease", &child).unwrap().unwrap();
    assert_eq!(position.range(), &child);
    assert_eq!(position.effective_start(), StartSpecification::Beginning);
  }

  #[test]
  fn test_checkpointer_keeps_mode() {
    let resolver = PositionResolver::new(RetentionWindow::from_minutes(10));
    let position = resolver
      .resolve(Some(FeedRange::full("0")), StartSpecification::Now, StreamMode::FullFidelity)
      .unwrap();
    let checkpointer = PositionCheckpointer::new(Box::new(InMemoryCheckpointStore::new()));
    checkpointer.record("lease", &position).unwrap();

    let loaded = checkpointer.load("lease").unwrap().unwrap();
    assert_eq!(loaded.mode(), StreamMode::FullFidelity);
  }

  #[test]
  fn test_checkpointer_surfaces_corrupt_token() {
    let store = InMemoryCheckpointStore::new();
    store.commit("lease", Checkpoint::new("cf1.broken")).unwrap();
    let checkpointer = PositionCheckpointer::new(Box::new(store));

    assert!(matches!(
      checkpointer.load("lease"),
      Err(CheckpointError::Position(PositionError::Decode(_)))
    ));
  }
}
