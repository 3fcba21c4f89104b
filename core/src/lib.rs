// core/src/lib.rs

//! conduit - asynchronous signalling primitives and a pipe-driven duplex
//! transport runtime for Tokio.
//!
//! The crate provides wait/signal primitives that honour cancellation tokens,
//! an exactly-once start/stop lifecycle, and a runtime that turns a raw
//! connection into a buffered byte stream driven by producer and consumer loops.

/// Start/stop lifecycle with admission gating and disposal.
pub mod activity;
/// Process configuration read from the environment.
pub mod config;
/// Defines the `Runtime`, which threads configuration into created primitives.
pub mod context;
/// Opt-in waiter gauge.
pub mod diagnostics;
/// Defines the error type used throughout the library.
pub mod error;
/// Byte pipe, connection/consumer traits and the duplex pipe.
pub mod pipe;
/// Operations run under their own cancellation scope.
pub mod scope;
/// Semaphore, countdown and manual-reset signals.
pub mod sync;

// Re-export core types for user convenience (e.g. `conduit::AsyncSemaphore`).
pub use activity::{Activity, ActivityHooks, ActivityState};
pub use config::RuntimeConfig;
pub use context::Runtime;
pub use diagnostics::{AsyncWaiterGauge, WaiterGauge};
pub use error::ConduitError;
pub use pipe::{Connection, ConsumePosition, Consumer, DuplexPipe, LoopExit, PipeOptions};
pub use scope::CancelableOperationScope;
pub use sync::{AsyncSemaphore, CountdownSignal, ManualResetSignal};

// Cancellation is expressed with tokio-util tokens throughout the API.
pub use tokio_util::sync::CancellationToken;

// --- Top-Level Library Information Functions ---

const VERSION_MAJOR: i32 = 0;
const VERSION_MINOR: i32 = 1;
const VERSION_PATCH: i32 = 0;

/// Returns the library version as a tuple (major, minor, patch).
///
/// # Examples
///
/// ```
/// let (major, minor, patch) = conduit::version();
/// println!("conduit version: {}.{}.{}", major, minor, patch);
/// ```
pub fn version() -> (i32, i32, i32) {
  (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

/// Returns the major version number of the library.
pub fn version_major() -> i32 {
  VERSION_MAJOR
}

/// Returns the minor version number of the library.
pub fn version_minor() -> i32 {
  VERSION_MINOR
}

/// Returns the patch version number of the library.
pub fn version_patch() -> i32 {
  VERSION_PATCH
}
