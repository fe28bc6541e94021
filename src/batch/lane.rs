//! One worker lane per partition group.
//!
//! A lane owns its group's backlog. It seals micro-batches from the front of
//! the backlog when the batch reaches the group's size cap, when the next
//! operation would overflow `max_batch_bytes`, when the oldest operation has
//! waited `flush_interval`, or when intake is closed. At most
//! `concurrency_per_group` sealed batches are in flight at once, each holding
//! a global permit when `max_group_concurrency` is set.
//!
//! A lane that has nothing queued or in flight for `lane_idle_timeout` takes
//! itself out of the registry and exits.

use super::dispatcher::BatchDispatcher;
use super::error::{BatchError, TransportError};
use super::group::GroupState;
use super::operation::{BatchOutcome, MicroBatch, OperationStatus, Pending};
use super::policy::BatchPolicy;
use crate::partitioning::GroupKey;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct LaneEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Pending>,
    handle: JoinHandle<()>,
}

/// Running lanes and every group seen so far.
#[derive(Default)]
pub(crate) struct Lanes {
    pub(crate) closed: bool,
    next_id: u64,
    running: HashMap<GroupKey, LaneEntry>,
    pub(crate) groups: HashMap<GroupKey, Arc<GroupState>>,
}

impl Lanes {
    pub(crate) fn group(&mut self, key: &GroupKey, policy: &BatchPolicy) -> Arc<GroupState> {
        self.groups
            .entry(key.clone())
            .or_insert_with(|| Arc::new(GroupState::new(key.clone(), policy)))
            .clone()
    }

    /// Hands `pending` to the group's lane, starting one if none is running.
    pub(crate) fn send(
        &mut self,
        group: GroupKey,
        pending: Pending,
        shared: &Arc<Shared>,
    ) -> Result<(), BatchError> {
        let state = self.group(&group, &shared.policy());
        let entry = match self.running.entry(group) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.next_id += 1;
                let id = self.next_id;
                let (tx, rx) = mpsc::unbounded_channel();
                let lane = Lane::new(id, entry.key().clone(), rx, shared.clone(), state);
                let handle = tokio::spawn(lane.run());
                entry.insert(LaneEntry { id, tx, handle })
            }
        };
        entry.tx.send(pending).map_err(|_| BatchError::Closed)
    }

    /// Stops intake and returns the running lanes' handles.
    pub(crate) fn close(&mut self) -> Vec<JoinHandle<()>> {
        self.closed = true;
        self.running.drain().map(|(_, entry)| entry.handle).collect()
    }

    pub(crate) fn running(&self) -> usize {
        self.running.len()
    }

    fn retire(&mut self, group: &GroupKey, id: u64) {
        if self.running.get(group).is_some_and(|entry| entry.id == id) {
            self.running.remove(group);
        }
    }
}

/// State shared by the controller and its lanes.
pub(crate) struct Shared {
    policy: RwLock<Arc<BatchPolicy>>,
    lanes: Mutex<Lanes>,
    pub(crate) dispatcher: Arc<dyn BatchDispatcher>,
    pub(crate) global: Option<Arc<Semaphore>>,
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn new(policy: BatchPolicy, dispatcher: Arc<dyn BatchDispatcher>) -> Self {
        let global = policy
            .max_group_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            policy: RwLock::new(Arc::new(policy)),
            lanes: Mutex::new(Lanes::default()),
            dispatcher,
            global,
            cancel: CancellationToken::new(),
        }
    }

    /// Policy in effect for the next sealed batch.
    pub(crate) fn policy(&self) -> Arc<BatchPolicy> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_policy(&self, policy: BatchPolicy) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(policy);
    }

    /// Lane registry. Never held across an await.
    pub(crate) fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A dispatched batch coming back to its lane.
struct Flight {
    pendings: Vec<Pending>,
    result: Result<BatchOutcome, (u32, TransportError)>,
}

pub(crate) struct Lane {
    id: u64,
    group: GroupKey,
    rx: mpsc::UnboundedReceiver<Pending>,
    shared: Arc<Shared>,
    state: Arc<GroupState>,
    backlog: VecDeque<Pending>,
    in_flight: JoinSet<Flight>,
    reserved: Option<OwnedSemaphorePermit>,
    intake_open: bool,
}

impl Lane {
    fn new(
        id: u64,
        group: GroupKey,
        rx: mpsc::UnboundedReceiver<Pending>,
        shared: Arc<Shared>,
        state: Arc<GroupState>,
    ) -> Self {
        Self {
            id,
            group,
            rx,
            shared,
            state,
            backlog: VecDeque::new(),
            in_flight: JoinSet::new(),
            reserved: None,
            intake_open: true,
        }
    }

    /// Runs until intake is closed and every operation has settled, until the
    /// lane retires after idling, or until the controller is cancelled.
    async fn run(mut self) {
        debug!(group = %self.group, lane = self.id, "lane started");
        loop {
            if self.shared.cancel.is_cancelled() {
                self.abandon().await;
                return;
            }

            let policy = self.shared.policy();
            let mut waiting_for_permit = false;
            while self.in_flight.len() < policy.concurrency_per_group {
                self.reject_oversized(&policy);
                if !self.should_seal(&policy, Instant::now()) {
                    break;
                }
                let permit = match &self.shared.global {
                    None => None,
                    Some(global) => match self.reserved.take() {
                        Some(permit) => Some(permit),
                        None => match global.clone().try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                waiting_for_permit = true;
                                break;
                            }
                        },
                    },
                };
                self.seal_and_dispatch(&policy, permit);
            }
            // A reserved permit that did not go into a batch goes back.
            self.reserved = None;
            if !self.intake_open && self.backlog.is_empty() && self.in_flight.is_empty() {
                break;
            }

            let can_dispatch = self.in_flight.len() < policy.concurrency_per_group && !waiting_for_permit;
            let idle = self.intake_open && self.backlog.is_empty() && self.in_flight.is_empty();
            let deadline = self
                .backlog
                .front()
                .map(|pending| pending.enqueued_at + policy.flush_interval);
            let global = self.shared.global.clone();

            tokio::select! {
                biased;

                _ = self.shared.cancel.cancelled() => {
                    self.abandon().await;
                    return;
                }

                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.settle(joined, &policy);
                }

                permit = acquire(global), if waiting_for_permit => {
                    self.reserved = permit;
                }

                received = self.rx.recv(), if self.intake_open => match received {
                    Some(pending) => self.backlog.push_back(pending),
                    None => {
                        debug!(group = %self.group, backlog = self.backlog.len(), "lane intake closed");
                        self.intake_open = false;
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if can_dispatch && deadline.is_some() => {}

                _ = sleep(policy.lane_idle_timeout), if idle => {
                    if self.try_retire() {
                        debug!(group = %self.group, lane = self.id, "idle lane retired");
                        return;
                    }
                }
            }
        }
        info!(group = %self.group, "lane drained");
    }

    /// Leaves the registry unless an operation arrived in the meantime.
    ///
    /// `submit` sends under the registry lock, so once the entry is gone no
    /// operation can reach this lane.
    fn try_retire(&mut self) -> bool {
        let mut lanes = self.shared.lanes();
        match self.rx.try_recv() {
            Ok(pending) => {
                self.backlog.push_back(pending);
                false
            }
            Err(TryRecvError::Disconnected) => {
                self.intake_open = false;
                false
            }
            Err(TryRecvError::Empty) => {
                lanes.retire(&self.group, self.id);
                true
            }
        }
    }

    fn should_seal(&self, policy: &BatchPolicy, now: Instant) -> bool {
        let Some(front) = self.backlog.front() else {
            return false;
        };
        if !self.intake_open || now >= front.enqueued_at + policy.flush_interval {
            return true;
        }
        if self.backlog.len() >= self.state.cap(policy) {
            return true;
        }
        // Under the cap every queued operation would join the batch, so it is
        // full once their bytes reach the limit.
        let bytes: usize = self
            .backlog
            .iter()
            .map(|pending| pending.operation.size())
            .sum();
        bytes >= policy.max_batch_bytes
    }

    /// Fails operations at the front that no longer fit in any batch after
    /// `max_batch_bytes` was lowered.
    fn reject_oversized(&mut self, policy: &BatchPolicy) {
        while self
            .backlog
            .front()
            .is_some_and(|pending| pending.operation.size() > policy.max_batch_bytes)
        {
            if let Some(pending) = self.backlog.pop_front() {
                let error = BatchError::OversizedOperation {
                    id: pending.operation.id().to_string(),
                    size: pending.operation.size(),
                    limit: policy.max_batch_bytes,
                };
                pending.complete(Err(error));
            }
        }
    }

    fn seal_and_dispatch(&mut self, policy: &Arc<BatchPolicy>, permit: Option<OwnedSemaphorePermit>) {
        let cap = self.state.cap(policy);
        let mut pendings = Vec::new();
        let mut bytes = 0;
        while pendings.len() < cap {
            let Some(front) = self.backlog.front() else {
                break;
            };
            let size = front.operation.size();
            if !pendings.is_empty() && bytes + size > policy.max_batch_bytes {
                break;
            }
            if let Some(pending) = self.backlog.pop_front() {
                bytes += size;
                pendings.push(pending);
            }
        }

        let sequence = self.state.next_sequence();
        let operations = pendings
            .iter()
            .map(|pending| pending.operation.clone())
            .collect();
        let batch = MicroBatch::new(self.group.clone(), sequence, operations);
        debug!(
            group = %self.group,
            sequence,
            operations = batch.len(),
            bytes = batch.bytes(),
            cap,
            "micro-batch sealed"
        );

        self.state.flight_started();
        let dispatcher = self.shared.dispatcher.clone();
        let state = self.state.clone();
        let policy = policy.clone();
        self.in_flight.spawn(async move {
            let _permit = permit;
            let result = send(dispatcher.as_ref(), &batch, &policy, &state).await;
            Flight { pendings, result }
        });
    }

    fn settle(&mut self, joined: Result<Flight, JoinError>, policy: &BatchPolicy) {
        self.state.flight_finished();
        let flight = match joined {
            Ok(flight) => flight,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                warn!(group = %self.group, error = %e, "dispatch task failed");
                return;
            }
        };

        match flight.result {
            Ok(outcome) => {
                let mut requeue = Vec::new();
                for (mut pending, status) in flight.pendings.into_iter().zip(outcome.statuses()) {
                    match status {
                        OperationStatus::Succeeded => pending.complete(Ok(())),
                        OperationStatus::Throttled => {
                            pending.throttled += 1;
                            if pending.throttled > policy.max_throttle_retries {
                                let error = BatchError::OperationFailure {
                                    id: pending.operation.id().to_string(),
                                    group: self.group.clone(),
                                    reason: format!("still throttled after {} attempts", pending.throttled),
                                };
                                pending.complete(Err(error));
                            } else {
                                requeue.push(pending);
                            }
                        }
                        OperationStatus::Failed(reason) => {
                            let error = BatchError::OperationFailure {
                                id: pending.operation.id().to_string(),
                                group: self.group.clone(),
                                reason: reason.clone(),
                            };
                            pending.complete(Err(error));
                        }
                    }
                }
                for pending in requeue.into_iter().rev() {
                    self.backlog.push_front(pending);
                }
                self.state.record_outcome(
                    outcome.dispatched_count(),
                    outcome.retried_count(),
                    policy,
                );
            }
            Err((attempts, error)) => {
                warn!(
                    group = %self.group,
                    attempts,
                    error = %error,
                    operations = flight.pendings.len(),
                    "micro-batch failed, transport retries exhausted"
                );
                for pending in flight.pendings {
                    let error = BatchError::TransportFailure {
                        group: self.group.clone(),
                        attempts,
                        reason: error.to_string(),
                    };
                    pending.complete(Err(error));
                }
            }
        }
    }

    /// Aborts in-flight batches and cancels everything not yet settled.
    async fn abandon(&mut self) {
        let policy = self.shared.policy();
        self.in_flight.abort_all();
        while let Some(joined) = self.in_flight.join_next().await {
            self.settle(joined, &policy);
        }

        self.rx.close();
        while let Ok(pending) = self.rx.try_recv() {
            self.backlog.push_back(pending);
        }
        let cancelled = self.backlog.len();
        for pending in self.backlog.drain(..) {
            let error = BatchError::Cancelled {
                id: pending.operation.id().to_string(),
            };
            pending.complete(Err(error));
        }
        info!(group = %self.group, cancelled, "lane cancelled");
    }
}

/// Sends `batch`, retrying whole-batch transport failures on the same slot.
///
/// Every failed attempt counts as all operations retried. Returns the
/// number of attempts with the final error once retries are exhausted.
async fn send(
    dispatcher: &dyn BatchDispatcher,
    batch: &MicroBatch,
    policy: &BatchPolicy,
    state: &GroupState,
) -> Result<BatchOutcome, (u32, TransportError)> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let error = match dispatcher.dispatch(batch).await {
            Ok(outcome) if outcome.len() == batch.len() => return Ok(outcome),
            Ok(outcome) => TransportError::new(format!(
                "dispatcher returned {} statuses for {} operations",
                outcome.len(),
                batch.len()
            )),
            Err(error) => error,
        };
        state.record_outcome(batch.len(), batch.len(), policy);

        if attempts > policy.max_transport_retries {
            return Err((attempts, error));
        }
        warn!(
            group = %batch.group(),
            sequence = batch.sequence(),
            attempt = attempts,
            error = %error,
            "micro-batch transport failure, retrying"
        );
        sleep(policy.transport_retry_backoff * attempts).await;
        state.retry_sent();
    }
}

async fn acquire(global: Option<Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    match global {
        Some(global) => global.acquire_owned().await.ok(),
        None => std::future::pending().await,
    }
}
