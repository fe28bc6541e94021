//! Errors surfaced by the batch controller and its dispatchers.

use crate::partitioning::GroupKey;
use thiserror::Error;

/// Error type for batch submission and per-operation results.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Invalid policy or reconfiguration request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation alone is larger than the batch byte limit.
    #[error("operation '{id}' is {size} bytes, over the {limit} byte batch limit")]
    OversizedOperation {
        /// Operation id.
        id: String,
        /// Payload size in bytes.
        size: usize,
        /// Configured `max_batch_bytes`.
        limit: usize,
    },
    /// The service rejected the operation for a non-retryable reason, or it
    /// stayed throttled past `max_throttle_retries`.
    #[error("operation '{id}' in group {group} failed: {reason}")]
    OperationFailure {
        /// Operation id.
        id: String,
        /// Partition group the operation was routed to.
        group: GroupKey,
        /// Reason reported by the dispatcher.
        reason: String,
    },
    /// Every transport attempt for the operation's batch failed.
    #[error("batch for group {group} failed after {attempts} attempt(s): {reason}")]
    TransportFailure {
        /// Partition group of the batch.
        group: GroupKey,
        /// Attempts made, including the first.
        attempts: u32,
        /// Last transport error.
        reason: String,
    },
    /// The controller was cancelled before the operation completed.
    #[error("operation '{id}' was cancelled")]
    Cancelled {
        /// Operation id.
        id: String,
    },
    /// The controller no longer accepts operations.
    #[error("batch controller is closed")]
    Closed,
}

/// A whole-batch failure returned by a [`BatchDispatcher`](super::BatchDispatcher).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    /// Creates a transport error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}
