// core/src/activity.rs

//! Start/stop lifecycle with exactly-once, mutually exclusive transitions.
//!
//! State machine: `Stopped -> Starting -> Started -> Stopping -> Stopped`,
//! with `Disposed` terminal. Transitions are admitted through a one-slot
//! [`AsyncSemaphore`]; the running state is re-checked after admission so
//! concurrent callers never run a hook twice.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ConduitError;
use crate::sync::AsyncSemaphore;

/// User-supplied transition hooks.
#[async_trait]
pub trait ActivityHooks: Send + Sync {
  /// Runs while the activity is `Starting`. An error leaves it `Stopped`.
  async fn on_starting(&self, cancel: &CancellationToken) -> Result<(), ConduitError>;

  /// Runs while the activity is `Stopping`. The activity ends `Stopped` even
  /// when this fails; the error is returned to the caller.
  async fn on_stopping(&self) -> Result<(), ConduitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
  Stopped,
  Starting,
  Started,
  Stopping,
  Disposed,
}

/// Holds the admission slot. Dropping it releases the slot and settles a
/// transition that was abandoned mid-hook (error or dropped future).
struct GateSlot<'a> {
  gate: &'a AsyncSemaphore,
  state: &'a Mutex<ActivityState>,
}

impl Drop for GateSlot<'_> {
  fn drop(&mut self) {
    {
      let mut state = self.state.lock();
      if matches!(*state, ActivityState::Starting | ActivityState::Stopping) {
        *state = ActivityState::Stopped;
      }
    }
    if let Err(e) = self.gate.release(1) {
      tracing::warn!(error = %e, "Activity gate release failed");
    }
  }
}

pub struct Activity<H: ActivityHooks> {
  handle: usize,
  hooks: H,
  state: Mutex<ActivityState>,
  gate: AsyncSemaphore,
  disposed: AtomicBool,
}

impl<H: ActivityHooks + fmt::Debug> fmt::Debug for Activity<H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Activity")
      .field("handle", &self.handle)
      .field("state", &*self.state.lock())
      .field("hooks", &self.hooks)
      .finish_non_exhaustive()
  }
}

impl<H: ActivityHooks> Activity<H> {
  pub fn new(hooks: H) -> Self {
    Self::with_handle(0, hooks)
  }

  /// `handle` only tags log records.
  pub fn with_handle(handle: usize, hooks: H) -> Self {
    Self::with_gate(handle, hooks, AsyncSemaphore::single_slot(None))
  }

  pub(crate) fn with_gate(handle: usize, hooks: H, gate: AsyncSemaphore) -> Self {
    Self {
      handle,
      hooks,
      state: Mutex::new(ActivityState::Stopped),
      gate,
      disposed: AtomicBool::new(false),
    }
  }

  pub fn handle(&self) -> usize {
    self.handle
  }

  pub fn hooks(&self) -> &H {
    &self.hooks
  }

  pub fn state(&self) -> ActivityState {
    *self.state.lock()
  }

  pub fn is_running(&self) -> bool {
    self.state() == ActivityState::Started
  }

  pub fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire)
  }

  fn ensure_not_disposed(&self) -> Result<(), ConduitError> {
    if self.is_disposed() {
      return Err(ConduitError::Disposed("activity"));
    }
    Ok(())
  }

  fn set_state(&self, next: ActivityState) {
    *self.state.lock() = next;
  }

  async fn enter(&self, cancel: Option<&CancellationToken>) -> Result<GateSlot<'_>, ConduitError> {
    self.gate.wait(cancel).await?;
    Ok(GateSlot {
      gate: &self.gate,
      state: &self.state,
    })
  }

  /// Starts the activity. Returns immediately when already running; fails
  /// with `Disposed` once disposal has begun.
  pub async fn start_activity(&self, cancel: &CancellationToken) -> Result<(), ConduitError> {
    self.ensure_not_disposed()?;
    if self.is_running() {
      return Ok(());
    }

    let _slot = self.enter(Some(cancel)).await?;
    self.ensure_not_disposed()?;
    if self.is_running() {
      return Ok(());
    }

    self.set_state(ActivityState::Starting);
    tracing::debug!(handle = self.handle, "Activity starting");
    self.hooks.on_starting(cancel).await.map_err(|e| {
      tracing::debug!(handle = self.handle, error = %e, "Activity failed to start");
      e
    })?;
    self.set_state(ActivityState::Started);
    tracing::debug!(handle = self.handle, "Activity started");
    Ok(())
  }

  /// Stops the activity. No-op when not running.
  pub async fn stop_activity(&self) -> Result<(), ConduitError> {
    self.ensure_not_disposed()?;
    self.stop_inner().await
  }

  async fn stop_inner(&self) -> Result<(), ConduitError> {
    if !self.is_running() {
      return Ok(());
    }
    let _slot = self.enter(None).await?;
    self.stop_admitted().await
  }

  /// Runs the stopping transition. The caller holds the admission slot.
  async fn stop_admitted(&self) -> Result<(), ConduitError> {
    if !self.is_running() {
      return Ok(());
    }

    self.set_state(ActivityState::Stopping);
    tracing::debug!(handle = self.handle, "Activity stopping");
    let result = self.hooks.on_stopping().await;
    self.set_state(ActivityState::Stopped);
    match &result {
      Ok(()) => tracing::debug!(handle = self.handle, "Activity stopped"),
      Err(e) => tracing::debug!(handle = self.handle, error = %e, "Activity stopped with error"),
    }
    result
  }

  /// Stops the activity if running and marks it disposed. Only the first call
  /// does any work.
  pub async fn dispose(&self) -> Result<(), ConduitError> {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    // Taking the slot first also waits out a start admitted before the flag flipped.
    let _slot = self.enter(None).await?;
    let result = self.stop_admitted().await;
    self.set_state(ActivityState::Disposed);
    tracing::debug!(handle = self.handle, "Activity disposed");
    result
  }
}
