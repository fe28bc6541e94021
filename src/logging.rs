//! Logging setup.
//!
//! The crate emits [`tracing`] events: `debug` for batch sealing and cap
//! changes, `info` for lane lifecycle and split recovery, `warn` for
//! transport failures. Applications usually install their own subscriber;
//! [`init_logging`] is a convenience for binaries and tests.

use tracing::Level;

/// Installs a `tracing-subscriber` fmt subscriber at `level`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging(level: Level) -> bool {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_target(true)
    .try_init()
    .is_ok()
}
