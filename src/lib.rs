//! # FeedWeave
//!
//! Change-feed position tracking and adaptive bulk write batching.
//!
//! Two independent halves:
//!
//! - **Reading**: [`PositionResolver`](resolver::PositionResolver) validates
//!   where a change-feed consumer starts, [`ContinuationCodec`](continuation::ContinuationCodec)
//!   turns positions into opaque tokens that survive range splits, and
//!   [`PositionCheckpointer`](checkpoint::PositionCheckpointer) persists them.
//! - **Writing**: [`BatchController`](batch::BatchController) groups write
//!   operations into bounded micro-batches per partition group and adapts
//!   batch sizes to the throttling it observes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use feedweave::continuation::ContinuationCodec;
//! use feedweave::position::{FeedRange, RetentionWindow, StartSpecification, StreamMode};
//! use feedweave::resolver::PositionResolver;
//!
//! let resolver = PositionResolver::new(RetentionWindow::from_minutes(60));
//! let position = resolver.resolve(
//!   Some(FeedRange::full("0")),
//!   StartSpecification::Now,
//!   StreamMode::FullFidelity,
//! )?;
//! let position = resolver.record_progress(&position, "\"42\"");
//! let token = ContinuationCodec::new().encode(&position)?;
//! # Ok::<(), feedweave::position::PositionError>(())
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Change-feed positions: ranges, modes, starting points.
pub mod position;
/// Position resolution, progress recording and split handling.
pub mod resolver;
/// Opaque, versioned continuation tokens.
pub mod continuation;
/// Checkpoint storage for continuation tokens.
pub mod checkpoint;
/// Partition keys and partition-group routing.
pub mod partitioning;
/// Adaptive micro-batching controller for bulk writes.
pub mod batch;
/// `tracing-subscriber` setup helper.
pub mod logging;
