// core/src/diagnostics.rs

//! Opt-in, purely observational instrumentation.
//!
//! Semaphores created through a [`Runtime`](crate::Runtime) whose config has
//! `async_waiter_metrics` enabled publish their parked-waiter count into a
//! shared [`WaiterGauge`]. The gauge never influences primitive behaviour.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Sink for the live "asynchronous waiters" gauge.
pub trait WaiterGauge: Send + Sync + fmt::Debug {
  /// Adjusts the gauge by `delta` (positive on enqueue, negative on dequeue or cancel).
  fn adjust(&self, delta: i64);
}

/// Default in-process gauge: a single atomic counter aggregated across every
/// semaphore sharing it.
#[derive(Debug, Default)]
pub struct AsyncWaiterGauge {
  waiters: AtomicI64,
}

impl AsyncWaiterGauge {
  pub fn new() -> Self {
    Self::default()
  }

  /// Current number of parked waiters.
  pub fn value(&self) -> i64 {
    self.waiters.load(Ordering::Relaxed)
  }
}

impl WaiterGauge for AsyncWaiterGauge {
  fn adjust(&self, delta: i64) {
    let now = self.waiters.fetch_add(delta, Ordering::Relaxed) + delta;
    tracing::trace!(delta, waiters = now, "Async waiter gauge adjusted");
  }
}
