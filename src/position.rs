//! Change-feed positions.
//!
//! A [`StreamPosition`] says where a consumer reads a change feed from: which
//! [`FeedRange`] of the partition-key space, in which [`StreamMode`], starting
//! at which [`StartSpecification`], plus the per-sub-range progress recorded in
//! a [`CompositeMarker`] once the range has been split.
//!
//! Positions are plain values. They are produced by
//! [`PositionResolver`](crate::resolver::PositionResolver), persisted through
//! [`ContinuationCodec`](crate::continuation::ContinuationCodec), and never
//! mutated in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Lower bound of the effective partition-key space.
pub const MIN_EFFECTIVE_KEY: &str = "";
/// Upper (exclusive) bound of the effective partition-key space.
pub const MAX_EFFECTIVE_KEY: &str = "FF";

/// Error type for position resolution and continuation decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PositionError {
  /// A value supplied by the caller is malformed or missing.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),
  /// The requested transition is not allowed from the current state.
  #[error("invalid state: {0}")]
  InvalidState(String),
  /// A continuation token could not be decoded.
  #[error("malformed continuation token: {0}")]
  Decode(String),
}

/// Result type for position operations.
pub type PositionResult<T> = Result<T, PositionError>;

/// Which changes a feed surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
  /// Latest state of each changed item.
  #[default]
  Incremental,
  /// Every intermediate change and delete inside the retention window.
  FullFidelity,
}

impl StreamMode {
  /// Canonical lowercase name.
  pub fn as_str(self) -> &'static str {
    match self {
      StreamMode::Incremental => "incremental",
      StreamMode::FullFidelity => "full_fidelity",
    }
  }
}

impl Display for StreamMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for StreamMode {
  type Err = PositionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "incremental" => Ok(StreamMode::Incremental),
      "full_fidelity" | "fullfidelity" => Ok(StreamMode::FullFidelity),
      other => Err(PositionError::InvalidArgument(format!(
        "unknown stream mode '{}', expected 'incremental' or 'full_fidelity'",
        other
      ))),
    }
  }
}

/// Full-fidelity retention configured on a container, in whole minutes.
///
/// Zero and unset both mean full fidelity is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RetentionWindow {
  minutes: Option<u32>,
}

impl RetentionWindow {
  /// No retention configured.
  pub const fn unset() -> Self {
    Self { minutes: None }
  }

  /// Retention of `minutes` minutes. Zero disables full fidelity.
  pub const fn from_minutes(minutes: u32) -> Self {
    Self {
      minutes: Some(minutes),
    }
  }

  /// Converts a finer-grained duration. It must be a whole number of minutes.
  pub fn from_duration(duration: Duration) -> PositionResult<Self> {
    if duration.subsec_nanos() != 0 || duration.as_secs() % 60 != 0 {
      return Err(PositionError::InvalidArgument(format!(
        "retention window {:?} is not a whole number of minutes",
        duration
      )));
    }
    let minutes = u32::try_from(duration.as_secs() / 60).map_err(|_| {
      PositionError::InvalidArgument(format!("retention window {:?} is too large", duration))
    })?;
    Ok(Self::from_minutes(minutes))
  }

  /// Configured minutes, if any.
  pub fn minutes(&self) -> Option<u32> {
    self.minutes
  }

  /// True when the window is a positive number of minutes.
  pub fn allows_full_fidelity(&self) -> bool {
    matches!(self.minutes, Some(m) if m > 0)
  }
}

/// A contiguous slice of the effective partition-key space.
///
/// Bounds are uppercase hex strings compared lexicographically; `""` to `"FF"`
/// covers the whole space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedRange {
  id: String,
  min_inclusive: String,
  max_exclusive: String,
}

impl FeedRange {
  /// Creates a range with explicit bounds.
  pub fn new(
    id: impl Into<String>,
    min_inclusive: impl Into<String>,
    max_exclusive: impl Into<String>,
  ) -> PositionResult<Self> {
    let id = id.into();
    let min_inclusive = min_inclusive.into().to_ascii_uppercase();
    let max_exclusive = max_exclusive.into().to_ascii_uppercase();
    if id.trim().is_empty() {
      return Err(PositionError::InvalidArgument(
        "feed range id must not be empty".to_string(),
      ));
    }
    if min_inclusive >= max_exclusive {
      return Err(PositionError::InvalidArgument(format!(
        "feed range '{}' has empty span [{}, {})",
        id, min_inclusive, max_exclusive
      )));
    }
    Ok(Self {
      id,
      min_inclusive,
      max_exclusive,
    })
  }

  /// A range with the given id covering the whole key space.
  pub fn full(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      min_inclusive: MIN_EFFECTIVE_KEY.to_string(),
      max_exclusive: MAX_EFFECTIVE_KEY.to_string(),
    }
  }

  /// Range identifier.
  pub fn id(&self) -> &str {
    &self.id
  }

  /// Inclusive lower bound.
  pub fn min_inclusive(&self) -> &str {
    &self.min_inclusive
  }

  /// Exclusive upper bound.
  pub fn max_exclusive(&self) -> &str {
    &self.max_exclusive
  }

  /// True when `other` lies entirely inside this range.
  pub fn contains(&self, other: &FeedRange) -> bool {
    self.min_inclusive <= other.min_inclusive && other.max_exclusive <= self.max_exclusive
  }

  /// True when the two spans share at least one key.
  pub fn overlaps(&self, other: &FeedRange) -> bool {
    self.min_inclusive < other.max_exclusive && other.min_inclusive < self.max_exclusive
  }
}

impl Display for FeedRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}[{},{})",
      self.id, self.min_inclusive, self.max_exclusive
    )
  }
}

/// Where a feed starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartSpecification {
  /// The oldest retained change.
  Beginning,
  /// The current tail.
  Now,
  /// The first change at or after the timestamp.
  PointInTime(DateTime<Utc>),
  /// Immediately after an opaque marker within a range.
  Marker {
    /// Opaque marker (etag) of the last change read.
    etag: String,
    /// Range the marker belongs to.
    range: FeedRange,
  },
  /// A previously persisted position, adopted wholesale.
  FromContinuation(Box<StreamPosition>),
}

impl StartSpecification {
  /// Creates a point-in-time start.
  pub fn point_in_time(at: DateTime<Utc>) -> Self {
    StartSpecification::PointInTime(at)
  }

  /// Creates a marker start.
  pub fn marker(etag: impl Into<String>, range: FeedRange) -> Self {
    StartSpecification::Marker {
      etag: etag.into(),
      range,
    }
  }

  /// Creates a start that adopts `position`.
  pub fn from_continuation(position: StreamPosition) -> Self {
    StartSpecification::FromContinuation(Box::new(position))
  }

  /// Whether a full-fidelity feed may start here.
  ///
  /// Full-fidelity retention is a bounded forward-looking window, so only the
  /// current tail and a persisted continuation qualify.
  pub fn supports_full_fidelity(&self) -> bool {
    matches!(
      self,
      StartSpecification::Now | StartSpecification::FromContinuation(_)
    )
  }

  /// Returns true for [`StartSpecification::Beginning`].
  pub fn is_beginning(&self) -> bool {
    matches!(self, StartSpecification::Beginning)
  }

  /// The range a marker start is bound to.
  pub fn marker_range(&self) -> Option<&FeedRange> {
    match self {
      StartSpecification::Marker { range, .. } => Some(range),
      _ => None,
    }
  }
}

impl Display for StartSpecification {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StartSpecification::Beginning => write!(f, "beginning"),
      StartSpecification::Now => write!(f, "now"),
      StartSpecification::PointInTime(at) => write!(f, "pit:{}", at.to_rfc3339()),
      StartSpecification::Marker { etag, range } => write!(f, "marker:{}@{}", etag, range.id()),
      StartSpecification::FromContinuation(position) => {
        write!(f, "continuation:{}", position.range().id())
      }
    }
  }
}

/// Per-sub-range progress, ordered by sub-range id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeMarker {
  entries: BTreeMap<String, String>,
}

impl CompositeMarker {
  /// Creates an empty composite marker.
  pub fn new() -> Self {
    Self::default()
  }

  /// Marker recorded for a sub-range.
  pub fn get(&self, range_id: &str) -> Option<&str> {
    self.entries.get(range_id).map(String::as_str)
  }

  /// Records a marker for a sub-range, replacing any previous one.
  pub fn set(&mut self, range_id: impl Into<String>, marker: impl Into<String>) {
    self.entries.insert(range_id.into(), marker.into());
  }

  /// Forgets a sub-range.
  pub fn remove(&mut self, range_id: &str) -> Option<String> {
    self.entries.remove(range_id)
  }

  /// Number of sub-ranges with recorded progress.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// True when no sub-range has progress.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Iterates `(sub-range id, marker)` pairs in id order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .entries
      .iter()
      .map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

/// A resolved, validated change-feed position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPosition {
  range: FeedRange,
  mode: StreamMode,
  start: StartSpecification,
  composite: Option<CompositeMarker>,
  resumed: bool,
}

impl StreamPosition {
  pub(crate) fn new(
    range: FeedRange,
    mode: StreamMode,
    start: StartSpecification,
    composite: Option<CompositeMarker>,
  ) -> Self {
    Self {
      range,
      mode,
      start,
      composite,
      resumed: false,
    }
  }

  /// Range this position reads.
  pub fn range(&self) -> &FeedRange {
    &self.range
  }

  /// Feed mode.
  pub fn mode(&self) -> StreamMode {
    self.mode
  }

  /// Recorded starting specification.
  pub fn start(&self) -> &StartSpecification {
    &self.start
  }

  /// Per-sub-range progress, once tracked.
  pub fn composite_marker(&self) -> Option<&CompositeMarker> {
    self.composite.as_ref()
  }

  /// True when the position was adopted from a continuation. The recorded
  /// start is then the continuation's own start.
  pub fn is_resumed(&self) -> bool {
    self.resumed
  }

  /// Whether this position may be read in full-fidelity mode, as far as its
  /// start is concerned. Continuations always qualify.
  pub fn supports_full_fidelity(&self) -> bool {
    self.resumed || self.start.supports_full_fidelity()
  }

  /// The point reads resume from.
  ///
  /// A composite entry for this range wins over the recorded start. Once
  /// sub-range progress is tracked, a marker bound to another range says
  /// nothing about this one, so reads start from the beginning of this range.
  pub fn effective_start(&self) -> StartSpecification {
    let Some(composite) = &self.composite else {
      return self.start.clone();
    };
    match composite.get(self.range.id()) {
      Some(etag) => StartSpecification::marker(etag, self.range.clone()),
      None => match &self.start {
        StartSpecification::Marker { range, .. } if range.id() != self.range.id() => {
          StartSpecification::Beginning
        }
        start => start.clone(),
      },
    }
  }

  pub(crate) fn with_mode(&self, mode: StreamMode) -> Self {
    Self {
      mode,
      ..self.clone()
    }
  }

  pub(crate) fn with_start(&self, start: StartSpecification) -> Self {
    Self {
      start,
      ..self.clone()
    }
  }

  pub(crate) fn with_composite(&self, composite: Option<CompositeMarker>) -> Self {
    Self {
      composite,
      ..self.clone()
    }
  }

  pub(crate) fn with_resumed(&self, resumed: bool) -> Self {
    Self {
      resumed,
      ..self.clone()
    }
  }

}

impl Display for StreamPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {} from {}", self.range, self.mode, self.effective_start())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stream_mode_parse() {
    assert_eq!("incremental".parse::<StreamMode>(), Ok(StreamMode::Incremental));
    assert_eq!(
      " Full_Fidelity ".parse::<StreamMode>(),
      Ok(StreamMode::FullFidelity)
    );
    assert!(matches!(
      "latest".parse::<StreamMode>(),
      Err(PositionError::InvalidArgument(_))
    ));
  }

  #[test]
  fn test_stream_mode_display() {
    assert_eq!(StreamMode::Incremental.to_string(), "incremental");
    assert_eq!(StreamMode::FullFidelity.to_string(), "full_fidelity");
    assert_eq!(StreamMode::default(), StreamMode::Incremental);
  }

  #[test]
  fn test_retention_window_availability() {
    assert!(!RetentionWindow::unset().allows_full_fidelity());
    assert!(!RetentionWindow::from_minutes(0).allows_full_fidelity());
    assert!(RetentionWindow::from_minutes(1).allows_full_fidelity());
    assert!(RetentionWindow::from_minutes(10_080).allows_full_fidelity());
  }

  #[test]
  fn test_retention_window_from_duration() {
    let window = RetentionWindow::from_duration(Duration::from_secs(3600)).unwrap();
    assert_eq!(window.minutes(), Some(60));

    let zero = RetentionWindow::from_duration(Duration::ZERO).unwrap();
    assert!(!zero.allows_full_fidelity());

    assert!(RetentionWindow::from_duration(Duration::from_secs(90)).is_err());
    assert!(RetentionWindow::from_duration(Duration::from_millis(60_500)).is_err());
  }

  #[test]
  fn test_feed_range_bounds() {
    let parent = FeedRange::full("0");
    let left = FeedRange::new("1", "", "7F").unwrap();
    let right = FeedRange::new("2", "7f", "FF").unwrap();

    assert_eq!(right.min_inclusive(), "7F");
    assert!(parent.contains(&left));
    assert!(parent.contains(&right));
    assert!(!left.contains(&parent));
    assert!(!left.overlaps(&right));
    assert!(parent.overlaps(&left));
  }

  #[test]
  fn test_feed_range_rejects_bad_input() {
    assert!(FeedRange::new("", "", "FF").is_err());
    assert!(FeedRange::new("x", "80", "80").is_err());
    assert!(FeedRange::new("x", "A0", "80").is_err());
  }

  #[test]
  fn test_start_supports_full_fidelity() {
    let range = FeedRange::full("0");
    let position = StreamPosition::new(
      range.clone(),
      StreamMode::Incremental,
      StartSpecification::Now,
      None,
    );

    assert!(StartSpecification::Now.supports_full_fidelity());
    assert!(StartSpecification::from_continuation(position).supports_full_fidelity());
    assert!(!StartSpecification::Beginning.supports_full_fidelity());
    assert!(!StartSpecification::point_in_time(Utc::now()).supports_full_fidelity());
    assert!(!StartSpecification::marker("\"12\"", range).supports_full_fidelity());
  }

  #[test]
  fn test_start_display() {
    let range = FeedRange::full("0");
    assert_eq!(StartSpecification::Beginning.to_string(), "beginning");
    assert_eq!(StartSpecification::Now.to_string(), "now");
    assert_eq!(
      StartSpecification::marker("42", range).to_string(),
      "marker:42@0"
    );
  }

  #[test]
  fn test_composite_marker_ordering() {
    let mut composite = CompositeMarker::new();
    composite.set("2", "b");
    composite.set("1", "a");
    composite.set("2", "c");

    let entries: Vec<_> = composite.iter().collect();
    assert_eq!(entries, vec![("1", "a"), ("2", "c")]);
    assert_eq!(composite.remove("1"), Some("a".to_string()));
    assert_eq!(composite.len(), 1);
  }

  #[test]
  fn test_effective_start_prefers_composite_entry() {
    let range = FeedRange::full("0");
    let mut composite = CompositeMarker::new();
    composite.set("0", "99");
    let position = StreamPosition::new(
      range.clone(),
      StreamMode::Incremental,
      StartSpecification::Beginning,
      Some(composite),
    );

    assert_eq!(
      position.effective_start(),
      StartSpecification::marker("99", range)
    );
  }

  #[test]
  fn test_effective_start_foreign_marker_is_beginning() {
    let parent = FeedRange::full("0");
    let child = FeedRange::new("1", "", "7F").unwrap();
    let mut composite = CompositeMarker::new();
    composite.set("2", "5");
    let position = StreamPosition::new(
      child,
      StreamMode::Incremental,
      StartSpecification::marker("7", parent),
      Some(composite),
    );

    assert_eq!(position.effective_start(), StartSpecification::Beginning);
  }

  #[test]
  fn test_effective_start_keeps_own_marker() {
    let range = FeedRange::full("0");
    let mut composite = CompositeMarker::new();
    composite.set("1", "5");
    let position = StreamPosition::new(
      range.clone(),
      StreamMode::Incremental,
      StartSpecification::marker("7", range.clone()),
      Some(composite),
    );

    assert_eq!(
      position.effective_start(),
      StartSpecification::marker("7", range)
    );
  }

  #[test]
  fn test_effective_start_without_entry_keeps_time_based_start() {
    let range = FeedRange::full("0");
    let mut composite = CompositeMarker::new();
    composite.set("other", "5");
    let position = StreamPosition::new(
      range,
      StreamMode::FullFidelity,
      StartSpecification::Now,
      Some(composite),
    );

    assert_eq!(position.effective_start(), StartSpecification::Now);
  }
}
