//! Adaptive micro-batching for bulk writes.
//!
//! [`BatchController`] accepts write operations, routes them to partition
//! groups and ships them to a [`BatchDispatcher`] as bounded
//! [`MicroBatch`]es. Each group runs an additive-increase /
//! multiplicative-decrease loop over its batch-size cap, driven by the ratio
//! of throttled to dispatched operations ([`RetryRateWindow`]).

mod controller;
mod dispatcher;
mod error;
mod group;
mod lane;
mod operation;
mod policy;
mod window;

pub use controller::BatchController;
pub use dispatcher::BatchDispatcher;
pub use error::{BatchError, TransportError};
pub use group::GroupSnapshot;
pub use operation::{BatchOutcome, MicroBatch, Operation, OperationStatus, OperationTicket};
pub use policy::{BatchPolicy, MAX_CONCURRENCY_PER_GROUP, RetryRateBand};
pub use window::{RetryRateWindow, next_cap};
