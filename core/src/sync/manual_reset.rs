// core/src/sync/manual_reset.rs

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::completion::CompletionSignal;
use crate::error::ConduitError;

/// Manual-reset signal: stays set until explicitly reset.
///
/// Each set/reset period is one [`CompletionSignal`] generation. A `wait`
/// binds to the generation current at call time, so a later `reset` does not
/// strand a waiter that is already parked on a set generation.
#[derive(Debug)]
pub struct ManualResetSignal {
  generation: Mutex<Arc<CompletionSignal>>,
}

impl Default for ManualResetSignal {
  fn default() -> Self {
    Self::new(false)
  }
}

impl ManualResetSignal {
  pub fn new(initially_set: bool) -> Self {
    let generation = if initially_set {
      CompletionSignal::new_set()
    } else {
      CompletionSignal::new()
    };
    Self {
      generation: Mutex::new(Arc::new(generation)),
    }
  }

  pub fn is_set(&self) -> bool {
    self.generation.lock().is_set()
  }

  /// Sets the signal, releasing current waiters. No-op when already set.
  pub fn set(&self) {
    let generation = self.generation.lock().clone();
    if generation.set() {
      tracing::trace!("Manual-reset signal set");
    }
  }

  /// Clears the signal. No-op when already clear.
  pub fn reset(&self) {
    let mut generation = self.generation.lock();
    if generation.is_set() {
      *generation = Arc::new(CompletionSignal::new());
    }
  }

  pub async fn wait(&self, cancel: Option<&CancellationToken>) -> Result<(), ConduitError> {
    if cancel.is_some_and(|t| t.is_cancelled()) {
      return Err(ConduitError::Cancelled);
    }
    let generation = self.generation.lock().clone();
    generation.wait_cancellable(cancel).await
  }
}
