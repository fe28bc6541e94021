//! Continuation tokens.
//!
//! [`ContinuationCodec`] turns a [`StreamPosition`] into an opaque string a
//! caller can persist verbatim, and back. Tokens look like
//! `cf1.<payload>.<checksum>`:
//!
//! - `cf1` is the format version,
//! - `<payload>` is URL-safe, unpadded base64 of a JSON envelope,
//! - `<checksum>` is a truncated SHA-256 of everything before it.
//!
//! Decoding never needs the range topology the token was issued under. A token
//! can be decoded for any overlapping range with
//! [`decode_for_range`](ContinuationCodec::decode_for_range), which is how a
//! consumer resumes after its range has split or merged.

use crate::position::{
  CompositeMarker, FeedRange, PositionError, PositionResult, StartSpecification, StreamMode,
  StreamPosition,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

const TOKEN_PREFIX: &str = "cf1";
const ENVELOPE_VERSION: u32 = 1;
const CHECKSUM_HEX_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  v: u32,
  range: FeedRange,
  mode: StreamMode,
  start: StartRecord,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  markers: Option<CompositeMarker>,
  #[serde(default, skip_serializing_if = "is_false")]
  resumed: bool,
}

fn is_false(value: &bool) -> bool {
  !*value
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StartRecord {
  Beginning,
  Now,
  PointInTime { at: DateTime<Utc> },
  Marker { etag: String, range: FeedRange },
}

impl StartRecord {
  fn from_start(start: &StartSpecification) -> Self {
    match start {
      StartSpecification::Beginning => StartRecord::Beginning,
      StartSpecification::Now => StartRecord::Now,
      StartSpecification::PointInTime(at) => StartRecord::PointInTime { at: *at },
      StartSpecification::Marker { etag, range } => StartRecord::Marker {
        etag: etag.clone(),
        range: range.clone(),
      },
      StartSpecification::FromContinuation(position) => StartRecord::from_start(position.start()),
    }
  }

  fn into_start(self) -> PositionResult<StartSpecification> {
    Ok(match self {
      StartRecord::Beginning => StartSpecification::Beginning,
      StartRecord::Now => StartSpecification::Now,
      StartRecord::PointInTime { at } => StartSpecification::PointInTime(at),
      StartRecord::Marker { etag, range } => {
        if etag.is_empty() {
          return Err(PositionError::Decode("marker start has an empty etag".to_string()));
        }
        StartSpecification::marker(etag, checked_range(range)?)
      }
    })
  }
}

/// Encodes and decodes continuation tokens. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinuationCodec;

impl ContinuationCodec {
  /// Creates a codec.
  pub fn new() -> Self {
    Self
  }

  /// Encodes `position` into a token.
  ///
  /// Encoding is deterministic: equal positions give equal tokens.
  pub fn encode(&self, position: &StreamPosition) -> PositionResult<String> {
    let envelope = Envelope {
      v: ENVELOPE_VERSION,
      range: position.range().clone(),
      mode: position.mode(),
      start: StartRecord::from_start(position.start()),
      markers: position.composite_marker().cloned(),
      resumed: position.is_resumed(),
    };
    let json = serde_json::to_vec(&envelope).map_err(|e| {
      PositionError::InvalidArgument(format!("position for {} is not encodable: {}", position.range(), e))
    })?;
    let body = format!("{}.{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(json));
    let checksum = checksum(&body);
    Ok(format!("{}.{}", body, checksum))
  }

  /// Decodes a token into the position it was encoded from.
  ///
  /// The result keeps the recorded start and composite marker; use
  /// [`StreamPosition::effective_start`] for the point reads resume from.
  ///
  /// # Errors
  ///
  /// [`PositionError::Decode`] for anything that is not an intact token of a
  /// supported version. A malformed token never decodes to a default position.
  pub fn decode(&self, token: &str) -> PositionResult<StreamPosition> {
    let token = token.trim();
    let (body, expected) = token
      .rsplit_once('.')
      .ok_or_else(|| PositionError::Decode("missing checksum".to_string()))?;
    let (prefix, payload) = body
      .split_once('.')
      .ok_or_else(|| PositionError::Decode("missing version prefix".to_string()))?;
    if prefix != TOKEN_PREFIX {
      return Err(PositionError::Decode(format!("unsupported token version '{}'", prefix)));
    }
    if checksum(body) != expected {
      return Err(PositionError::Decode("checksum mismatch".to_string()));
    }

    let json = URL_SAFE_NO_PAD
      .decode(payload)
      .map_err(|e| PositionError::Decode(format!("payload is not base64: {}", e)))?;
    let envelope: Envelope = serde_json::from_slice(&json)
      .map_err(|e| PositionError::Decode(format!("payload is not a position: {}", e)))?;
    if envelope.v != ENVELOPE_VERSION {
      return Err(PositionError::Decode(format!(
        "unsupported envelope version {}",
        envelope.v
      )));
    }

    let range = checked_range(envelope.range)?;
    let start = envelope.start.into_start()?;
    Ok(StreamPosition::new(range, envelope.mode, start, envelope.markers).with_resumed(envelope.resumed))
  }

  /// Decodes a token for `target`, which may be a different range than the
  /// one the token was issued for (after a split or a merge).
  ///
  /// The start is picked in order:
  ///
  /// 1. the composite marker entry recorded for `target`,
  /// 2. `Beginning` when the token's marker belongs to another range, since
  ///    markers are range-scoped,
  /// 3. otherwise the start the token recorded.
  ///
  /// A `Now` or `PointInTime` start is kept for a `target` that has no
  /// composite entry, rather than falling back to `Beginning`. Neither start is
  /// bound to a range, and `Beginning` is not a legal full-fidelity start.
  ///
  /// # Errors
  ///
  /// [`PositionError::Decode`] for a malformed token and
  /// [`PositionError::InvalidArgument`] when `target` shares no keys with the
  /// token's range.
  pub fn decode_for_range(&self, token: &str, target: &FeedRange) -> PositionResult<StreamPosition> {
    let position = self.decode(token)?;
    if position.range() == target {
      return Ok(position);
    }
    if !position.range().overlaps(target) {
      return Err(PositionError::InvalidArgument(format!(
        "continuation for {} does not cover {}",
        position.range(),
        target
      )));
    }

    let recorded = position
      .composite_marker()
      .and_then(|composite| composite.get(target.id()));
    let start = match recorded {
      Some(etag) => StartSpecification::marker(etag, target.clone()),
      None => match position.effective_start() {
        StartSpecification::Marker { .. } | StartSpecification::Beginning => {
          info!(
            issued_for = %position.range(),
            range = %target,
            "no marker recorded for range, starting from its beginning"
          );
          StartSpecification::Beginning
        }
        other => other,
      },
    };
    let composite = position.composite_marker().cloned().and_then(|mut composite| {
      composite.remove(position.range().id());
      (!composite.is_empty()).then_some(composite)
    });
    Ok(
      StreamPosition::new(target.clone(), position.mode(), start, composite)
        .with_resumed(position.is_resumed()),
    )
  }
}

fn checked_range(range: FeedRange) -> PositionResult<FeedRange> {
  FeedRange::new(range.id(), range.min_inclusive(), range.max_exclusive())
    .map_err(|e| PositionError::Decode(e.to_string()))
}

fn checksum(body: &str) -> String {
  let digest = Sha256::digest(body.as_bytes());
  let mut encoded = String::with_capacity(digest.len() * 2);
  for byte in digest.iter() {
    encoded.push_str(&format!("{:02x}", byte));
  }
  encoded.truncate(CHECKSUM_HEX_LEN);
  encoded
}
