//! Position resolution for change-feed consumers.
//!
//! [`PositionResolver`] turns a starting specification, a requested
//! [`StreamMode`] and a [`FeedRange`] into a validated [`StreamPosition`]. It
//! is pure: no I/O, no shared state, safe to call from any number of tasks.
//!
//! ## Full fidelity
//!
//! A full-fidelity feed needs two things:
//!
//! - a start that supports retention (`Now` or a continuation), and
//! - a container [`RetentionWindow`] of at least one minute.
//!
//! The first rule is about the starting specification only. A generous
//! retention window never makes `Beginning` or `PointInTime` legal.

use crate::position::{
  FeedRange, PositionError, PositionResult, RetentionWindow, StartSpecification,
  StreamMode, StreamPosition,
};
use tracing::{debug, info};

/// Resolves and advances [`StreamPosition`]s against one container's retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionResolver {
  retention: RetentionWindow,
}

impl PositionResolver {
  /// Creates a resolver for a container with the given retention window.
  pub fn new(retention: RetentionWindow) -> Self {
    Self { retention }
  }

  /// Retention window this resolver validates against.
  pub fn retention(&self) -> RetentionWindow {
    self.retention
  }

  /// Builds a position from a starting specification.
  ///
  /// `range` is required for every start except
  /// [`StartSpecification::FromContinuation`], which adopts the continuation's
  /// range, start and composite marker and only takes `mode` from the caller.
  ///
  /// # Errors
  ///
  /// - [`PositionError::InvalidArgument`] when `range` is missing, or does not
  ///   overlap the marker / continuation range.
  /// - [`PositionError::InvalidState`] when `mode` is full fidelity and either
  ///   the start or the retention window does not allow it.
  pub fn resolve(
    &self,
    range: Option<FeedRange>,
    start: StartSpecification,
    mode: StreamMode,
  ) -> PositionResult<StreamPosition> {
    match start {
      StartSpecification::FromContinuation(position) => {
        let position = flatten(*position);
        if let Some(range) = &range {
          if !range.overlaps(position.range()) {
            return Err(PositionError::InvalidArgument(format!(
              "continuation for {} does not cover requested range {}",
              position.range(),
              range
            )));
          }
        }
        if mode == StreamMode::FullFidelity {
          self.check_retention()?;
        }
        Ok(position.with_mode(mode).with_resumed(true))
      }
      start => {
        let range = range.ok_or_else(|| {
          PositionError::InvalidArgument(format!("a feed range is required to start from {}", start))
        })?;
        if mode == StreamMode::FullFidelity {
          self.check_full_fidelity(&start)?;
        }
        let start = match start {
          StartSpecification::Marker {
            etag,
            range: marker_range,
          } => {
            if !range.overlaps(&marker_range) {
              return Err(PositionError::InvalidArgument(format!(
                "marker range {} does not overlap {}",
                marker_range, range
              )));
            }
            if etag.trim().is_empty() {
              debug!(range = %range, "empty marker, starting from the beginning");
              StartSpecification::Beginning
            } else {
              StartSpecification::Marker {
                etag,
                range: marker_range,
              }
            }
          }
          other => other,
        };
        Ok(StreamPosition::new(range, mode, start, None))
      }
    }
  }

  /// Like [`resolve`](Self::resolve), with the mode given by name
  /// (`"incremental"` or `"full_fidelity"`).
  pub fn resolve_named(
    &self,
    range: Option<FeedRange>,
    start: StartSpecification,
    mode: &str,
  ) -> PositionResult<StreamPosition> {
    let mode = mode.parse::<StreamMode>()?;
    self.resolve(range, start, mode)
  }

  /// Returns a copy of `position` in full-fidelity mode.
  ///
  /// Applies the same start rule as [`resolve`](Self::resolve): a position
  /// resolved from a continuation qualifies whatever start it adopted.
  /// One-way: there is no downgrade.
  pub fn upgrade_to_full_fidelity(&self, position: &StreamPosition) -> PositionResult<StreamPosition> {
    if position.mode() == StreamMode::FullFidelity {
      return Ok(position.clone());
    }
    if position.is_resumed() {
      self.check_retention()?;
    } else {
      self.check_full_fidelity(position.start())?;
    }
    Ok(position.with_mode(StreamMode::FullFidelity))
  }

  /// Builds a marker-based position. A missing or blank `etag` means "no
  /// progress yet" and starts from the beginning of `range`.
  pub fn resolve_from_marker(&self, etag: Option<&str>, range: FeedRange) -> StreamPosition {
    match etag.map(str::trim).filter(|etag| !etag.is_empty()) {
      Some(etag) => StreamPosition::new(
        range.clone(),
        StreamMode::Incremental,
        StartSpecification::marker(etag, range),
        None,
      ),
      None => {
        debug!(range = %range, "no marker recorded, starting from the beginning");
        StreamPosition::new(range, StreamMode::Incremental, StartSpecification::Beginning, None)
      }
    }
  }

  /// Returns `position` with its marker replaced by `marker`.
  ///
  /// An empty marker records nothing.
  pub fn record_progress(&self, position: &StreamPosition, marker: &str) -> StreamPosition {
    if marker.is_empty() {
      return position.clone();
    }
    let range = position.range().clone();
    let composite = position.composite_marker().cloned().map(|mut composite| {
      composite.set(range.id(), marker);
      composite
    });
    position
      .with_start(StartSpecification::marker(marker, range))
      .with_composite(composite)
  }

  /// Records progress for one sub-range of `position` in its composite marker.
  pub fn record_sub_range_progress(
    &self,
    position: &StreamPosition,
    sub_range: &FeedRange,
    marker: &str,
  ) -> PositionResult<StreamPosition> {
    if !position.range().overlaps(sub_range) {
      return Err(PositionError::InvalidArgument(format!(
        "sub-range {} is outside {}",
        sub_range,
        position.range()
      )));
    }
    if marker.is_empty() {
      return Ok(position.clone());
    }
    let mut composite = position.composite_marker().cloned().unwrap_or_default();
    composite.set(sub_range.id(), marker);
    Ok(position.with_composite(Some(composite)))
  }

  /// Splits `position` into one position per child range.
  ///
  /// Children must be non-overlapping and lie inside the parent span. The
  /// parent's own marker does not carry over: a marker is scoped to the range
  /// that produced it, so each child resumes from the beginning of its slice
  /// unless the parent started from `Now` or a point in time. Progress recorded for
  /// other sub-ranges is kept.
  pub fn split(
    &self,
    position: &StreamPosition,
    children: &[FeedRange],
  ) -> PositionResult<Vec<StreamPosition>> {
    if children.is_empty() {
      return Err(PositionError::InvalidArgument(format!(
        "split of {} needs at least one child range",
        position.range()
      )));
    }
    for (i, child) in children.iter().enumerate() {
      if !position.range().contains(child) {
        return Err(PositionError::InvalidArgument(format!(
          "child range {} is outside parent {}",
          child,
          position.range()
        )));
      }
      if children[..i].iter().any(|other| other.overlaps(child)) {
        return Err(PositionError::InvalidArgument(format!(
          "child range {} overlaps a sibling",
          child
        )));
      }
    }

    let inherited = match position.effective_start() {
      StartSpecification::Marker { .. } => StartSpecification::Beginning,
      other => other,
    };
    let composite = position.composite_marker().cloned().and_then(|mut composite| {
      composite.remove(position.range().id());
      (!composite.is_empty()).then_some(composite)
    });

    Ok(
      children
        .iter()
        .map(|child| {
          let recorded = composite.as_ref().and_then(|c| c.get(child.id()));
          if recorded.is_none() && inherited.is_beginning() {
            info!(
              parent = %position.range(),
              child = %child,
              "split child has no recorded marker, starting from its beginning"
            );
          }
          StreamPosition::new(
            child.clone(),
            position.mode(),
            inherited.clone(),
            composite.clone(),
          )
          .with_resumed(position.is_resumed())
        })
        .collect(),
    )
  }

  fn check_full_fidelity(&self, start: &StartSpecification) -> PositionResult<()> {
    if !start.supports_full_fidelity() {
      return Err(PositionError::InvalidState(format!(
        "full fidelity change feed cannot start from {}; start from Now or from a continuation",
        start
      )));
    }
    self.check_retention()
  }

  fn check_retention(&self) -> PositionResult<()> {
    if !self.retention.allows_full_fidelity() {
      return Err(PositionError::InvalidState(format!(
        "full fidelity change feed needs a positive retention window, container has {}",
        match self.retention.minutes() {
          Some(m) => format!("{} minutes", m),
          None => "none".to_string(),
        }
      )));
    }
    Ok(())
  }
}

/// Unwraps nested continuations so a position's start is never itself a
/// continuation.
fn flatten(position: StreamPosition) -> StreamPosition {
  match position.start() {
    StartSpecification::FromContinuation(inner) => {
      let inner = flatten((**inner).clone());
      inner.with_mode(position.mode())
    }
    _ => position,
  }
}
