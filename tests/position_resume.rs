use chrono::{TimeZone, Utc};
use feedweave::checkpoint::{
  Checkpoint, CheckpointError, CheckpointStore, CommitCadence, FileCheckpointStore, PositionCheckpointer,
};
use feedweave::position::{FeedRange, PositionError, RetentionWindow, StartSpecification, StreamMode};
use feedweave::resolver::PositionResolver;
use tempfile::tempdir;

// Test helpers

fn parent() -> FeedRange {
  FeedRange::full("0")
}

fn left() -> FeedRange {
  FeedRange::new("1", "", "7F").unwrap()
}

fn right() -> FeedRange {
  FeedRange::new("2", "7F", "FF").unwrap()
}

fn open(path: &std::path::Path, cadence: CommitCadence) -> PositionCheckpointer {
  PositionCheckpointer::with_cadence(Box::new(FileCheckpointStore::new(path).unwrap()), cadence)
}

// ============================================================================
// Resume after restart
// ============================================================================

#[test]
fn test_full_fidelity_position_survives_restart() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("leases").join("checkpoints.json");
  let resolver = PositionResolver::new(RetentionWindow::from_minutes(60));

  let position = resolver
    .resolve(Some(parent()), StartSpecification::Now, StreamMode::FullFidelity)
    .unwrap();
  let position = resolver.record_progress(&position, "\"10\"");
  {
    let checkpointer = open(&path, CommitCadence::EveryPage);
    checkpointer.record("lease-0", &position).unwrap();
    assert!(checkpointer.pending("lease-0").unwrap().is_none());
  }

  let checkpointer = open(&path, CommitCadence::EveryPage);
  let restored = checkpointer.load("lease-0").unwrap().unwrap();
  assert_eq!(restored, position);
  assert_eq!(restored.mode(), StreamMode::FullFidelity);
  assert_eq!(restored.start(), &StartSpecification::marker("\"10\"", parent()));

  // The restored position is a valid full-fidelity starting point.
  let resumed = resolver
    .resolve(
      None,
      StartSpecification::from_continuation(restored),
      StreamMode::FullFidelity,
    )
    .unwrap();
  assert_eq!(resumed.range(), &parent());
}

#[test]
fn test_manual_cadence_persists_only_on_commit() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("checkpoints.json");
  let resolver = PositionResolver::new(RetentionWindow::unset());
  let position = resolver.resolve_from_marker(Some("\"3\""), parent());

  let checkpointer = open(&path, CommitCadence::Manual);
  checkpointer.record("lease-0", &position).unwrap();
  assert!(open(&path, CommitCadence::Manual).load("lease-0").unwrap().is_none());

  checkpointer.commit_all().unwrap();
  assert_eq!(
    open(&path, CommitCadence::Manual).load("lease-0").unwrap(),
    Some(position)
  );
}

#[test]
fn test_periodic_cadence_commits_every_n_pages() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("checkpoints.json");
  let resolver = PositionResolver::new(RetentionWindow::unset());
  let checkpointer = open(&path, CommitCadence::Periodic(3));

  let mut position = resolver.resolve_from_marker(None, parent());
  for page in 1..=2 {
    position = resolver.record_progress(&position, &format!("\"{}\"", page));
    checkpointer.record("lease-0", &position).unwrap();
  }
  assert!(checkpointer.load("lease-0").unwrap().is_none());

  position = resolver.record_progress(&position, "\"3\"");
  checkpointer.record("lease-0", &position).unwrap();
  assert_eq!(checkpointer.load("lease-0").unwrap(), Some(position));
}

#[test]
fn test_corrupted_checkpoint_is_a_decode_error() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("checkpoints.json");
  FileCheckpointStore::new(&path)
    .unwrap()
    .commit("lease-0", Checkpoint::new("cf1.not-base64!.0000"))
    .unwrap();

  let result = open(&path, CommitCadence::EveryPage).load("lease-0");
  assert!(matches!(
    result,
    Err(CheckpointError::Position(PositionError::Decode(_)))
  ));
}

// ============================================================================
// Split recovery
// ============================================================================

#[test]
fn test_split_recovery_from_committed_token() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("checkpoints.json");
  let resolver = PositionResolver::new(RetentionWindow::unset());

  let position = resolver
    .resolve(Some(parent()), StartSpecification::Beginning, StreamMode::Incremental)
    .unwrap();
  let position = resolver.record_progress(&position, "\"10\"");
  let position = resolver
    .record_sub_range_progress(&position, &left(), "\"5\"")
    .unwrap();
  open(&path, CommitCadence::EveryPage)
    .record("lease-0", &position)
    .unwrap();

  // The parent range split while the consumer was down.
  let checkpointer = open(&path, CommitCadence::EveryPage);
  let left_position = checkpointer.load_for_range("lease-0", &left()).unwrap().unwrap();
  let right_position = checkpointer.load_for_range("lease-0", &right()).unwrap().unwrap();

  assert_eq!(left_position.range(), &left());
  assert_eq!(left_position.effective_start(), StartSpecification::marker("\"5\"", left()));
  assert_eq!(right_position.range(), &right());
  assert_eq!(right_position.effective_start(), StartSpecification::Beginning);

  // The unsplit range still resumes from its own marker.
  let same = checkpointer.load_for_range("lease-0", &parent()).unwrap().unwrap();
  assert_eq!(same.effective_start(), StartSpecification::marker("\"10\"", parent()));
}

#[test]
fn test_split_recovery_keeps_point_in_time() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("checkpoints.json");
  let resolver = PositionResolver::new(RetentionWindow::unset());
  let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

  let position = resolver
    .resolve(
      Some(parent()),
      StartSpecification::point_in_time(at),
      StreamMode::Incremental,
    )
    .unwrap();
  open(&path, CommitCadence::EveryPage)
    .record("lease-0", &position)
    .unwrap();

  let checkpointer = open(&path, CommitCadence::EveryPage);
  for child in [left(), right()] {
    let restored = checkpointer.load_for_range("lease-0", &child).unwrap().unwrap();
    assert_eq!(restored.start(), &StartSpecification::point_in_time(at));
  }
}

#[test]
fn test_split_children_round_trip_through_checkpoints() {
  let dir = tempdir().unwrap();
  let path = dir.path().join("checkpoints.json");
  let resolver = PositionResolver::new(RetentionWindow::from_minutes(10));

  let position = resolver
    .resolve(Some(parent()), StartSpecification::Now, StreamMode::FullFidelity)
    .unwrap();
  let position = resolver
    .record_sub_range_progress(&position, &right(), "\"7\"")
    .unwrap();
  let children = resolver.split(&position, &[left(), right()]).unwrap();

  let checkpointer = open(&path, CommitCadence::Manual);
  checkpointer.record("lease-1", &children[0]).unwrap();
  checkpointer.record("lease-2", &children[1]).unwrap();
  checkpointer.commit_all().unwrap();

  let checkpointer = open(&path, CommitCadence::Manual);
  let restored_left = checkpointer.load("lease-1").unwrap().unwrap();
  let restored_right = checkpointer.load("lease-2").unwrap().unwrap();
  assert_eq!(restored_left.effective_start(), StartSpecification::Now);
  assert_eq!(
    restored_right.effective_start(),
    StartSpecification::marker("\"7\"", right())
  );
  assert!(restored_left.mode() == StreamMode::FullFidelity && restored_right.mode() == StreamMode::FullFidelity);

  checkpointer.clear("lease-1").unwrap();
  assert!(checkpointer.load("lease-1").unwrap().is_none());
  assert!(checkpointer.load("lease-2").unwrap().is_some());
}
