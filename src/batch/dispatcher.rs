//! The transport seam.

use super::error::TransportError;
use super::operation::{BatchOutcome, MicroBatch};
use async_trait::async_trait;
use std::sync::Arc;

/// Sends micro-batches to the service.
///
/// Return one [`OperationStatus`](super::OperationStatus) per operation, in
/// batch order, or a [`TransportError`] when the request as a whole failed.
/// An outcome with the wrong number of statuses is treated as a transport
/// failure.
#[async_trait]
pub trait BatchDispatcher: Send + Sync + 'static {
    /// Sends one batch.
    async fn dispatch(&self, batch: &MicroBatch) -> Result<BatchOutcome, TransportError>;
}

#[async_trait]
impl<D: BatchDispatcher + ?Sized> BatchDispatcher for Arc<D> {
    async fn dispatch(&self, batch: &MicroBatch) -> Result<BatchOutcome, TransportError> {
        (**self).dispatch(batch).await
    }
}
