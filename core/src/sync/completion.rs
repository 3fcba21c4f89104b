// core/src/sync/completion.rs

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ConduitError;

/// A one-shot completion signal: transitions from pending to set exactly once
/// and releases every task suspended on it.
///
/// Countdown and manual-reset signals each hold an `Arc<CompletionSignal>` per
/// armed generation and swap in a fresh one when re-armed.
#[derive(Debug, Default)]
pub(crate) struct CompletionSignal {
  set: AtomicBool,
  notify: Notify,
}

impl CompletionSignal {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn new_set() -> Self {
    Self {
      set: AtomicBool::new(true),
      notify: Notify::new(),
    }
  }

  pub(crate) fn is_set(&self) -> bool {
    self.set.load(Ordering::Acquire)
  }

  /// Marks the signal set. Returns `true` only for the call that performed
  /// the transition.
  pub(crate) fn set(&self) -> bool {
    if self.set.swap(true, Ordering::AcqRel) {
      return false;
    }
    self.notify.notify_waiters();
    true
  }

  /// Waits until the signal is set.
  pub(crate) async fn wait(&self) {
    // Fast path mirrors the latch: no registration when already set.
    if self.is_set() {
      return;
    }
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      // Register interest before re-checking so a concurrent set() cannot slip between.
      notified.as_mut().enable();
      if self.is_set() {
        return;
      }
      notified.await;
      if self.is_set() {
        return;
      }
    }
  }

  /// Waits until the signal is set or `cancel` fires. A signal that is
  /// already set wins over an already-cancelled token.
  pub(crate) async fn wait_cancellable(&self, cancel: Option<&CancellationToken>) -> Result<(), ConduitError> {
    let Some(cancel) = cancel else {
      self.wait().await;
      return Ok(());
    };
    tokio::select! {
      biased;
      _ = self.wait() => Ok(()),
      _ = cancel.cancelled() => {
        if self.is_set() { Ok(()) } else { Err(ConduitError::Cancelled) }
      }
    }
  }
}
