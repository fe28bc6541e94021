//! Write operations, micro-batches and their outcomes.

use super::error::BatchError;
use crate::partitioning::{GroupKey, PartitionKey};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// One write operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    id: String,
    partition_key: PartitionKey,
    payload: Bytes,
}

impl Operation {
    /// Creates an operation.
    pub fn new(id: impl Into<String>, partition_key: impl Into<PartitionKey>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
            payload: payload.into(),
        }
    }

    /// Caller-chosen id, echoed in errors.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Routing key.
    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    /// Serialized body.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Bytes this operation counts against `max_batch_bytes`.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Operations of one partition group sent as one request.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    group: GroupKey,
    sequence: u64,
    operations: Vec<Operation>,
    bytes: usize,
}

impl MicroBatch {
    pub(crate) fn new(group: GroupKey, sequence: u64, operations: Vec<Operation>) -> Self {
        let bytes = operations.iter().map(Operation::size).sum();
        Self {
            group,
            sequence,
            operations,
            bytes,
        }
    }

    /// Group every operation belongs to.
    pub fn group(&self) -> &GroupKey {
        &self.group
    }

    /// Position of this batch among the group's batches, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Operations in submission order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Total payload bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True for a batch with no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Result of one operation inside a dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// Applied.
    Succeeded,
    /// Rejected for load; the controller sends it again.
    Throttled,
    /// Rejected for a reason retrying will not fix.
    Failed(String),
}

/// Per-operation results of a dispatched batch, in batch order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    statuses: Vec<OperationStatus>,
}

impl BatchOutcome {
    /// Creates an outcome from per-operation statuses.
    pub fn new(statuses: Vec<OperationStatus>) -> Self {
        Self { statuses }
    }

    /// Outcome where all `len` operations succeeded.
    pub fn all_succeeded(len: usize) -> Self {
        Self::new(vec![OperationStatus::Succeeded; len])
    }

    /// Per-operation statuses.
    pub fn statuses(&self) -> &[OperationStatus] {
        &self.statuses
    }

    /// Number of statuses.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// True when there are no statuses.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Operations the service throttled.
    pub fn retried_count(&self) -> usize {
        self.count(|status| matches!(status, OperationStatus::Throttled))
    }

    /// Operations the service rejected for good.
    pub fn failed_count(&self) -> usize {
        self.count(|status| matches!(status, OperationStatus::Failed(_)))
    }

    /// Operations counted by the size-control loop: succeeded plus throttled.
    pub fn dispatched_count(&self) -> usize {
        self.statuses.len() - self.failed_count()
    }

    fn count(&self, predicate: impl Fn(&OperationStatus) -> bool) -> usize {
        self.statuses.iter().filter(|status| predicate(status)).count()
    }
}

/// Completion of one submitted operation.
///
/// Resolves to `Ok(())` once the operation succeeded, or to its final error.
/// If the controller is dropped or cancelled first, it resolves to
/// [`BatchError::Cancelled`].
#[derive(Debug)]
pub struct OperationTicket {
    id: String,
    rx: oneshot::Receiver<Result<(), BatchError>>,
}

impl OperationTicket {
    /// Id of the submitted operation.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for OperationTicket {
    type Output = Result<(), BatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(BatchError::Cancelled {
                id: this.id.clone(),
            }),
        })
    }
}

/// An operation waiting in a lane, with the channel its ticket listens on.
#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) operation: Operation,
    pub(crate) reply: oneshot::Sender<Result<(), BatchError>>,
    pub(crate) throttled: u32,
    pub(crate) enqueued_at: Instant,
}

impl Pending {
    pub(crate) fn new(operation: Operation) -> (Self, OperationTicket) {
        let (tx, rx) = oneshot::channel();
        let ticket = OperationTicket {
            id: operation.id().to_string(),
            rx,
        };
        let pending = Self {
            operation,
            reply: tx,
            throttled: 0,
            enqueued_at: Instant::now(),
        };
        (pending, ticket)
    }

    pub(crate) fn complete(self, result: Result<(), BatchError>) {
        // The caller may have dropped its ticket.
        let _ = self.reply.send(result);
    }
}
