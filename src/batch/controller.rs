//! The batch controller: routing, lanes, drain and cancellation.

use super::dispatcher::BatchDispatcher;
use super::error::BatchError;
use super::group::GroupSnapshot;
use super::lane::Shared;
use super::operation::{Operation, OperationTicket, Pending};
use super::policy::BatchPolicy;
use crate::partitioning::{GroupKey, GroupRouter, KeyRouter};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shapes submitted operations into micro-batches per partition group and
/// adapts each group's batch size to the retry rate it observes.
///
/// Lanes are spawned on the current Tokio runtime when a group receives an
/// operation and no lane is running for it. Idle lanes exit after
/// [`BatchPolicy::lane_idle_timeout`]; the group's cap and counters are kept.
///
/// ```no_run
/// # use feedweave::batch::{BatchController, BatchPolicy, BatchDispatcher, BatchOutcome, MicroBatch, Operation, TransportError};
/// # struct Sink;
/// # #[async_trait::async_trait]
/// # impl BatchDispatcher for Sink {
/// #     async fn dispatch(&self, batch: &MicroBatch) -> Result<BatchOutcome, TransportError> {
/// #         Ok(BatchOutcome::all_succeeded(batch.len()))
/// #     }
/// # }
/// # async fn run() -> Result<(), feedweave::batch::BatchError> {
/// let controller = BatchController::start(BatchPolicy::default(), Sink)?;
/// let ticket = controller.submit(Operation::new("op-1", "tenant-a", "{}")).await?;
/// controller.drain().await;
/// ticket.await?;
/// # Ok(())
/// # }
/// ```
pub struct BatchController<R: GroupRouter = KeyRouter> {
    router: R,
    shared: Arc<Shared>,
}

impl BatchController<KeyRouter> {
    /// Starts a controller with one group per partition key.
    pub fn start<D: BatchDispatcher>(policy: BatchPolicy, dispatcher: D) -> Result<Self, BatchError> {
        Self::start_with_router(policy, dispatcher, KeyRouter)
    }
}

impl<R: GroupRouter> BatchController<R> {
    /// Starts a controller that groups operations with `router`.
    ///
    /// # Errors
    ///
    /// [`BatchError::InvalidArgument`] when the policy does not validate.
    pub fn start_with_router<D: BatchDispatcher>(
        policy: BatchPolicy,
        dispatcher: D,
        router: R,
    ) -> Result<Self, BatchError> {
        policy.validate()?;
        info!(
            max_operations = policy.max_operations_per_batch,
            max_bytes = policy.max_batch_bytes,
            concurrency = policy.concurrency_per_group,
            "batch controller started"
        );
        Ok(Self {
            router,
            shared: Arc::new(Shared::new(policy, Arc::new(dispatcher))),
        })
    }

    /// Queues an operation on its group's lane.
    ///
    /// Waits only while the global in-flight cap is saturated. The returned
    /// ticket resolves once the operation has settled.
    ///
    /// # Errors
    ///
    /// - [`BatchError::OversizedOperation`] when the payload alone exceeds
    ///   `max_batch_bytes`.
    /// - [`BatchError::Closed`] after [`drain`](Self::drain) or
    ///   [`cancel`](Self::cancel).
    pub async fn submit(&self, operation: Operation) -> Result<OperationTicket, BatchError> {
        let policy = self.shared.policy();
        if operation.size() > policy.max_batch_bytes {
            return Err(BatchError::OversizedOperation {
                id: operation.id().to_string(),
                size: operation.size(),
                limit: policy.max_batch_bytes,
            });
        }
        if self.is_closed() {
            return Err(BatchError::Closed);
        }

        if let Some(global) = &self.shared.global {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => return Err(BatchError::Closed),
                permit = global.acquire() => {
                    drop(permit.map_err(|_| BatchError::Closed)?);
                }
            }
        }

        let group = self.router.route(operation.partition_key());
        let (pending, ticket) = Pending::new(operation);

        let mut lanes = self.shared.lanes();
        if lanes.closed {
            return Err(BatchError::Closed);
        }
        lanes.send(group, pending, &self.shared)?;
        Ok(ticket)
    }

    /// Feeds an outcome for `group` into its retry window and returns the
    /// group's new batch-size cap.
    ///
    /// Lanes call this for every dispatched batch; callers that dispatch
    /// out of band can report their own outcomes here.
    pub fn on_batch_outcome(&self, group: &GroupKey, dispatched: usize, retried: usize) -> usize {
        let policy = self.shared.policy();
        let state = self.shared.lanes().group(group, &policy);
        state.record_outcome(dispatched, retried, &policy)
    }

    /// Stops intake, flushes partial batches and waits until every lane is
    /// quiescent.
    pub async fn drain(&self) {
        let handles = self.shared.lanes().close();
        info!(lanes = handles.len(), "draining batch controller");
        self.join(handles).await;
        info!("batch controller drained");
    }

    /// Abandons all queued and in-flight work. Outstanding tickets resolve
    /// to [`BatchError::Cancelled`].
    pub async fn cancel(&self) {
        self.shared.cancel.cancel();
        let handles = self.shared.lanes().close();
        info!(lanes = handles.len(), "cancelling batch controller");
        self.join(handles).await;
    }

    async fn join(&self, handles: Vec<JoinHandle<()>>) {
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "lane task failed");
            }
        }
    }

    /// Replaces the policy. Batches sealed from now on use it.
    ///
    /// # Errors
    ///
    /// [`BatchError::InvalidArgument`] when the policy does not validate or
    /// changes `concurrency_per_group` or `max_group_concurrency`, which are
    /// fixed at start.
    pub fn reconfigure(&self, policy: BatchPolicy) -> Result<(), BatchError> {
        policy.validate()?;
        let current = self.shared.policy();
        if policy.concurrency_per_group != current.concurrency_per_group
            || policy.max_group_concurrency != current.max_group_concurrency
        {
            return Err(BatchError::InvalidArgument(
                "concurrency limits cannot change after the controller has started".to_string(),
            ));
        }
        info!(
            max_operations = policy.max_operations_per_batch,
            max_bytes = policy.max_batch_bytes,
            "batch policy reconfigured"
        );
        self.shared.set_policy(policy);
        Ok(())
    }

    /// Policy in effect.
    pub fn policy(&self) -> Arc<BatchPolicy> {
        self.shared.policy()
    }

    /// True once the controller no longer accepts operations.
    pub fn is_closed(&self) -> bool {
        self.shared.lanes().closed
    }

    /// Number of lanes currently running.
    pub fn active_lanes(&self) -> usize {
        self.shared.lanes().running()
    }

    /// Snapshot of one group, if it has seen any operation or outcome.
    pub fn group_stats(&self, group: &GroupKey) -> Option<GroupSnapshot> {
        self.shared.lanes().groups.get(group).map(|state| state.snapshot())
    }

    /// Snapshots of every group.
    pub fn stats(&self) -> HashMap<GroupKey, GroupSnapshot> {
        self.shared
            .lanes()
            .groups
            .iter()
            .map(|(key, state)| (key.clone(), state.snapshot()))
            .collect()
    }
}

impl<R: GroupRouter> Drop for BatchController<R> {
    /// Closes intake. Running lanes flush what they hold and exit.
    fn drop(&mut self) {
        drop(self.shared.lanes().close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchOutcome, MicroBatch, TransportError};
    use async_trait::async_trait;

    struct Accept;

    #[async_trait]
    impl BatchDispatcher for Accept {
        async fn dispatch(&self, batch: &MicroBatch) -> Result<BatchOutcome, TransportError> {
            Ok(BatchOutcome::all_succeeded(batch.len()))
        }
    }

    #[test]
    fn start_rejects_invalid_policy() {
        let policy = BatchPolicy::default().with_concurrency_per_group(0);
        assert!(matches!(
            BatchController::start(policy, Accept),
            Err(BatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn reconfigure_keeps_concurrency_fixed() {
        let controller = BatchController::start(BatchPolicy::default(), Accept).unwrap();
        let changed = BatchPolicy::default().with_concurrency_per_group(2);
        assert!(controller.reconfigure(changed).is_err());

        let smaller = BatchPolicy::new(10, 1024);
        controller.reconfigure(smaller).unwrap();
        assert_eq!(controller.policy().max_operations_per_batch, 10);
    }

    #[test]
    fn on_batch_outcome_creates_group() {
        let controller = BatchController::start(BatchPolicy::new(10, 1024), Accept).unwrap();
        let group = GroupKey::from("orders");
        assert_eq!(controller.on_batch_outcome(&group, 10, 5), 5);
        assert_eq!(controller.group_stats(&group).unwrap().cap, 5);
        assert_eq!(controller.stats().len(), 1);
    }

    #[tokio::test]
    async fn oversized_operation_fails_synchronously() {
        let controller = BatchController::start(BatchPolicy::new(10, 8), Accept).unwrap();
        let err = controller
            .submit(Operation::new("big", "k", vec![0u8; 9]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BatchError::OversizedOperation {
                id: "big".to_string(),
                size: 9,
                limit: 8,
            }
        );
    }

    #[tokio::test]
    async fn submit_after_drain_is_closed() {
        let controller = BatchController::start(BatchPolicy::default(), Accept).unwrap();
        let ticket = controller
            .submit(Operation::new("a", "k", "x"))
            .await
            .unwrap();
        controller.drain().await;
        assert_eq!(ticket.await, Ok(()));
        assert!(controller.is_closed());
        assert_eq!(
            controller.submit(Operation::new("b", "k", "x")).await.unwrap_err(),
            BatchError::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_controller_flushes_lanes() {
        let controller = BatchController::start(BatchPolicy::default(), Accept).unwrap();
        let ticket = controller
            .submit(Operation::new("a", "k", "x"))
            .await
            .unwrap();
        let shared = controller.shared.clone();
        drop(controller);
        assert_eq!(ticket.await, Ok(()));
        assert_eq!(shared.lanes().running(), 0);
    }
}
