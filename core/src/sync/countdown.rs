// core/src/sync/countdown.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::completion::CompletionSignal;
use crate::error::ConduitError;

/// Countdown signal: completes once its count has been signalled down to zero.
///
/// Counter updates are compare-and-retry loops, so `signal` and `add_count`
/// never block behind waiters. The completion generation is swapped only when
/// the countdown is re-armed by [`reset`](Self::reset).
#[derive(Debug)]
pub struct CountdownSignal {
  initial: AtomicUsize,
  current: AtomicUsize,
  completion: Mutex<Arc<CompletionSignal>>,
}

fn validate_step(n: usize) -> Result<(), ConduitError> {
  if n == 0 {
    return Err(ConduitError::invalid_argument("countdown step must be at least 1"));
  }
  Ok(())
}

fn completion_for(count: usize) -> Arc<CompletionSignal> {
  if count == 0 {
    Arc::new(CompletionSignal::new_set())
  } else {
    Arc::new(CompletionSignal::new())
  }
}

impl CountdownSignal {
  /// A countdown created at zero starts out complete.
  pub fn new(initial: usize) -> Self {
    Self {
      initial: AtomicUsize::new(initial),
      current: AtomicUsize::new(initial),
      completion: Mutex::new(completion_for(initial)),
    }
  }

  pub fn initial_count(&self) -> usize {
    self.initial.load(Ordering::Acquire)
  }

  pub fn current_count(&self) -> usize {
    self.current.load(Ordering::Acquire)
  }

  pub fn is_set(&self) -> bool {
    self.current_count() == 0
  }

  /// Increments the count. A countdown that already reached zero cannot be
  /// resurrected this way; use [`reset`](Self::reset).
  pub fn add_count(&self, n: usize) -> Result<(), ConduitError> {
    validate_step(n)?;
    let mut backoff = Backoff::new();
    let mut observed = self.current.load(Ordering::Acquire);
    loop {
      if observed == 0 {
        return Err(ConduitError::InvalidState("countdown already completed"));
      }
      let next = observed
        .checked_add(n)
        .ok_or_else(|| ConduitError::invalid_argument("countdown count would overflow"))?;
      match self
        .current
        .compare_exchange_weak(observed, next, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => return Ok(()),
        Err(actual) => {
          observed = actual;
          backoff.snooze();
        }
      }
    }
  }

  /// Non-throwing variant of [`add_count`](Self::add_count).
  pub fn try_add_count(&self, n: usize) -> Result<bool, ConduitError> {
    match self.add_count(n) {
      Ok(()) => Ok(true),
      Err(ConduitError::InvalidState(_)) => Ok(false),
      Err(e) => Err(e),
    }
  }

  /// Decrements the count by `n`. Returns `true` when this call brought it to
  /// zero and completed the signal.
  pub fn signal(&self, n: usize) -> Result<bool, ConduitError> {
    validate_step(n)?;
    let mut backoff = Backoff::new();
    let mut observed = self.current.load(Ordering::Acquire);
    loop {
      if n > observed {
        return Err(ConduitError::InvalidState("countdown signalled below zero"));
      }
      let next = observed - n;
      match self
        .current
        .compare_exchange_weak(observed, next, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) if next == 0 => {
          self.completion.lock().set();
          tracing::trace!("Countdown reached zero");
          return Ok(true);
        }
        Ok(_) => return Ok(false),
        Err(actual) => {
          observed = actual;
          backoff.snooze();
        }
      }
    }
  }

  /// Waits for the countdown to reach zero. An already-cancelled token fails
  /// immediately even if the countdown is complete.
  pub async fn wait(&self, cancel: Option<&CancellationToken>) -> Result<(), ConduitError> {
    if cancel.is_some_and(|t| t.is_cancelled()) {
      return Err(ConduitError::Cancelled);
    }
    let completion = self.completion.lock().clone();
    completion.wait_cancellable(cancel).await
  }

  /// Re-arms the countdown at `n`, pre-completing it when `n == 0`. Not meant
  /// to race with `signal`/`add_count`.
  pub fn reset(&self, n: usize) {
    let mut completion = self.completion.lock();
    self.initial.store(n, Ordering::Release);
    self.current.store(n, Ordering::Release);
    *completion = completion_for(n);
  }

  pub fn reset_to_initial(&self) {
    self.reset(self.initial_count());
  }
}
