//! Configuration for the batch controller.
//!
//! Hard limits (operations and bytes per batch), concurrency, the target
//! retry-rate band and the tuning constants of the size-control loop.

use super::error::BatchError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for [`BatchPolicy::concurrency_per_group`].
pub const MAX_CONCURRENCY_PER_GROUP: usize = 5;

/// Target band for the ratio of retried to dispatched operations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryRateBand {
    /// At or below this rate the batch-size cap grows.
    pub min: f64,
    /// Above this rate the batch-size cap shrinks.
    pub max: f64,
}

impl Default for RetryRateBand {
    fn default() -> Self {
        Self { min: 0.0, max: 0.02 }
    }
}

impl RetryRateBand {
    /// Creates a band.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Validates `0 <= min <= max`.
    pub fn validate(&self) -> Result<(), BatchError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(BatchError::InvalidArgument(
                "retry_rate_band bounds must be finite".to_string(),
            ));
        }
        if self.min < 0.0 || self.max < 0.0 {
            return Err(BatchError::InvalidArgument(format!(
                "retry_rate_band bounds must be >= 0, got ({}, {})",
                self.min, self.max
            )));
        }
        if self.min > self.max {
            return Err(BatchError::InvalidArgument(format!(
                "retry_rate_band min ({}) must be <= max ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Configuration for [`BatchController`](super::BatchController).
///
/// Durations are (de)serialized as whole milliseconds under `*_ms` keys.
/// Missing keys take their default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Hard cap on operations per micro-batch.
    pub max_operations_per_batch: usize,
    /// Hard cap on payload bytes per micro-batch.
    pub max_batch_bytes: usize,
    /// Micro-batches a group may have in flight at once (1..=5).
    pub concurrency_per_group: usize,
    /// Micro-batches in flight across all groups. `None` is unbounded.
    pub max_group_concurrency: Option<usize>,
    /// Target retry-rate band.
    pub retry_rate_band: RetryRateBand,
    /// Longest a partial batch may wait before it is sent anyway.
    #[serde(rename = "flush_interval_ms", with = "duration_ms")]
    pub flush_interval: Duration,
    /// Starting batch-size cap. `None` starts at `max_operations_per_batch`.
    pub initial_batch_size: Option<usize>,
    /// Multiplier applied to the cap when the retry rate is above the band.
    pub decrease_factor: f64,
    /// Added to the cap when the retry rate is at or below the band.
    pub increase_step: usize,
    /// EWMA weight of the newest batch in the retry rate. `1.0` uses the
    /// latest batch alone.
    pub retry_rate_smoothing: f64,
    /// Whole-batch retries after a transport failure. `0` disables retries.
    pub max_transport_retries: u32,
    /// Times one operation may come back throttled before it is failed.
    pub max_throttle_retries: u32,
    /// Base delay between transport retries, multiplied by the attempt number.
    #[serde(rename = "transport_retry_backoff_ms", with = "duration_ms")]
    pub transport_retry_backoff: Duration,
    /// How long a group's lane may sit with nothing queued or in flight
    /// before it exits. The next operation for the group starts a new lane.
    #[serde(rename = "lane_idle_timeout_ms", with = "duration_ms")]
    pub lane_idle_timeout: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_operations_per_batch: 100,
            max_batch_bytes: 220 * 1024,
            concurrency_per_group: 1,
            max_group_concurrency: None,
            retry_rate_band: RetryRateBand::default(),
            flush_interval: Duration::from_secs(1),
            initial_batch_size: None,
            decrease_factor: 0.5,
            increase_step: 1,
            retry_rate_smoothing: 1.0,
            max_transport_retries: 3,
            max_throttle_retries: 10,
            transport_retry_backoff: Duration::from_millis(10),
            lane_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl BatchPolicy {
    /// Creates a policy with the given hard limits and defaults elsewhere.
    pub fn new(max_operations_per_batch: usize, max_batch_bytes: usize) -> Self {
        Self {
            max_operations_per_batch,
            max_batch_bytes,
            ..Default::default()
        }
    }

    /// Loads a policy from JSON and validates it.
    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        let policy: Self = serde_json::from_str(json)
            .map_err(|e| BatchError::InvalidArgument(format!("batch policy: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Sets the per-group concurrency.
    pub fn with_concurrency_per_group(mut self, concurrency: usize) -> Self {
        self.concurrency_per_group = concurrency;
        self
    }

    /// Sets the global concurrency cap.
    pub fn with_max_group_concurrency(mut self, limit: usize) -> Self {
        self.max_group_concurrency = Some(limit);
        self
    }

    /// Sets the retry-rate band.
    pub fn with_retry_rate_band(mut self, min: f64, max: f64) -> Self {
        self.retry_rate_band = RetryRateBand::new(min, max);
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the starting batch-size cap.
    pub fn with_initial_batch_size(mut self, size: usize) -> Self {
        self.initial_batch_size = Some(size);
        self
    }

    /// Sets the transport retry budget and backoff.
    pub fn with_transport_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.max_transport_retries = retries;
        self.transport_retry_backoff = backoff;
        self
    }

    /// Sets how long an idle lane lingers.
    pub fn with_lane_idle_timeout(mut self, timeout: Duration) -> Self {
        self.lane_idle_timeout = timeout;
        self
    }

    /// Starting batch-size cap, clamped to `[1, max_operations_per_batch]`.
    pub fn initial_cap(&self) -> usize {
        self.initial_batch_size
            .unwrap_or(self.max_operations_per_batch)
            .clamp(1, self.max_operations_per_batch.max(1))
    }

    /// Validates limits, band and control constants.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.max_operations_per_batch == 0 {
            return Err(invalid("max_operations_per_batch must be > 0"));
        }
        if self.max_batch_bytes == 0 {
            return Err(invalid("max_batch_bytes must be > 0"));
        }
        if !(1..=MAX_CONCURRENCY_PER_GROUP).contains(&self.concurrency_per_group) {
            return Err(BatchError::InvalidArgument(format!(
                "concurrency_per_group must be in 1..={}, got {}",
                MAX_CONCURRENCY_PER_GROUP, self.concurrency_per_group
            )));
        }
        if self.max_group_concurrency == Some(0) {
            return Err(invalid("max_group_concurrency must be > 0 when set"));
        }
        self.retry_rate_band.validate()?;
        if self.flush_interval.is_zero() {
            return Err(invalid("flush_interval must be > 0"));
        }
        if self.lane_idle_timeout.is_zero() {
            return Err(invalid("lane_idle_timeout must be > 0"));
        }
        if let Some(size) = self.initial_batch_size {
            if size == 0 || size > self.max_operations_per_batch {
                return Err(BatchError::InvalidArgument(format!(
                    "initial_batch_size must be in 1..={}, got {}",
                    self.max_operations_per_batch, size
                )));
            }
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(BatchError::InvalidArgument(format!(
                "decrease_factor must be in (0, 1), got {}",
                self.decrease_factor
            )));
        }
        if self.increase_step == 0 {
            return Err(invalid("increase_step must be > 0"));
        }
        if !(self.retry_rate_smoothing > 0.0 && self.retry_rate_smoothing <= 1.0) {
            return Err(BatchError::InvalidArgument(format!(
                "retry_rate_smoothing must be in (0, 1], got {}",
                self.retry_rate_smoothing
            )));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> BatchError {
    BatchError::InvalidArgument(message.to_string())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates() {
        let policy = BatchPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.initial_cap(), 100);
    }

    #[test]
    fn validate_limits() {
        assert!(BatchPolicy::new(0, 1024).validate().is_err());
        assert!(BatchPolicy::new(10, 0).validate().is_err());
        assert!(BatchPolicy::default().with_concurrency_per_group(0).validate().is_err());
        assert!(BatchPolicy::default().with_concurrency_per_group(6).validate().is_err());
        assert!(BatchPolicy::default().with_concurrency_per_group(5).validate().is_ok());
        assert!(BatchPolicy::default().with_max_group_concurrency(0).validate().is_err());
    }

    #[test]
    fn validate_band() {
        assert!(BatchPolicy::default().with_retry_rate_band(0.1, 0.05).validate().is_err());
        assert!(BatchPolicy::default().with_retry_rate_band(-0.1, 0.05).validate().is_err());
        assert!(BatchPolicy::default().with_retry_rate_band(0.05, 0.05).validate().is_ok());
    }

    #[test]
    fn validate_control_constants() {
        let mut policy = BatchPolicy::default();
        policy.decrease_factor = 1.0;
        assert!(policy.validate().is_err());

        let mut policy = BatchPolicy::default();
        policy.increase_step = 0;
        assert!(policy.validate().is_err());

        let mut policy = BatchPolicy::default();
        policy.retry_rate_smoothing = 0.0;
        assert!(policy.validate().is_err());

        assert!(BatchPolicy::new(10, 1024).with_initial_batch_size(11).validate().is_err());
        assert!(BatchPolicy::default().with_flush_interval(Duration::ZERO).validate().is_err());
        assert!(BatchPolicy::default().with_lane_idle_timeout(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn from_json_fills_defaults() {
        let policy = BatchPolicy::from_json(
            r#"{"max_operations_per_batch": 50, "flush_interval_ms": 250, "initial_batch_size": 10}"#,
        )
        .unwrap();
        assert_eq!(policy.max_operations_per_batch, 50);
        assert_eq!(policy.flush_interval, Duration::from_millis(250));
        assert_eq!(policy.initial_cap(), 10);
        assert_eq!(policy.max_batch_bytes, 220 * 1024);
    }

    #[test]
    fn from_json_rejects_invalid() {
        assert!(BatchPolicy::from_json(r#"{"concurrency_per_group": 9}"#).is_err());
        assert!(BatchPolicy::from_json("{not json").is_err());
    }

    #[test]
    fn json_uses_millisecond_keys() {
        let json = serde_json::to_value(BatchPolicy::default()).unwrap();
        assert_eq!(json["flush_interval_ms"], 1000);
        assert_eq!(json["transport_retry_backoff_ms"], 10);
        assert_eq!(json["lane_idle_timeout_ms"], 30_000);
    }
}
