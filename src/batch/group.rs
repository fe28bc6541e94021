//! Per-group controller state.

use super::policy::BatchPolicy;
use super::window::{RetryRateWindow, next_cap};
use crate::partitioning::GroupKey;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Point-in-time view of one partition group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    /// Current batch-size cap.
    pub cap: usize,
    /// Operations counted as dispatched by the control loop.
    pub dispatched_total: u64,
    /// Operations counted as retried by the control loop.
    pub retried_total: u64,
    /// Current smoothed retry rate.
    pub retry_rate: f64,
    /// Micro-batches handed to the dispatcher, retries included.
    pub batches_sent: u64,
    /// Micro-batches in flight right now.
    pub in_flight: usize,
    /// Most micro-batches ever in flight at once.
    pub peak_in_flight: usize,
}

#[derive(Debug)]
struct Inner {
    cap: usize,
    window: RetryRateWindow,
    batches_sent: u64,
    in_flight: usize,
    peak_in_flight: usize,
    next_sequence: u64,
}

/// Cap, retry window and counters of one group. Every outcome goes through
/// [`GroupState::record_outcome`] under the group's lock.
#[derive(Debug)]
pub(crate) struct GroupState {
    key: GroupKey,
    inner: Mutex<Inner>,
}

impl GroupState {
    pub(crate) fn new(key: GroupKey, policy: &BatchPolicy) -> Self {
        Self {
            key,
            inner: Mutex::new(Inner {
                cap: policy.initial_cap(),
                window: RetryRateWindow::new(),
                batches_sent: 0,
                in_flight: 0,
                peak_in_flight: 0,
                next_sequence: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cap to use for the next batch under `policy`.
    pub(crate) fn cap(&self, policy: &BatchPolicy) -> usize {
        self.lock().cap.clamp(1, policy.max_operations_per_batch.max(1))
    }

    /// Feeds one outcome into the retry window and moves the cap.
    pub(crate) fn record_outcome(&self, dispatched: usize, retried: usize, policy: &BatchPolicy) -> usize {
        let mut inner = self.lock();
        let rate = inner
            .window
            .record(dispatched, retried, policy.retry_rate_smoothing);
        if dispatched == 0 {
            return inner.cap;
        }
        let previous = inner.cap;
        inner.cap = next_cap(previous, rate, policy);
        if inner.cap != previous {
            debug!(
                group = %self.key,
                rate,
                from = previous,
                to = inner.cap,
                "batch size cap adjusted"
            );
        }
        inner.cap
    }

    /// Sequence number for the next sealed batch. Survives lane restarts.
    pub(crate) fn next_sequence(&self) -> u64 {
        let mut inner = self.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        sequence
    }

    pub(crate) fn flight_started(&self) {
        let mut inner = self.lock();
        inner.batches_sent += 1;
        inner.in_flight += 1;
        inner.peak_in_flight = inner.peak_in_flight.max(inner.in_flight);
    }

    pub(crate) fn retry_sent(&self) {
        self.lock().batches_sent += 1;
    }

    pub(crate) fn flight_finished(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    pub(crate) fn snapshot(&self) -> GroupSnapshot {
        let inner = self.lock();
        GroupSnapshot {
            cap: inner.cap,
            dispatched_total: inner.window.dispatched_total(),
            retried_total: inner.window.retried_total(),
            retry_rate: inner.window.rate(),
            batches_sent: inner.batches_sent,
            in_flight: inner.in_flight,
            peak_in_flight: inner.peak_in_flight,
        }
    }
}
