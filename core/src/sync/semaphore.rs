// core/src/sync/semaphore.rs

//! Bounded counting semaphore with FIFO waiters and cooperative cancellation.
//!
//! The count goes negative while callers are parked: a count of `-k` means
//! exactly `k` waiters sit in the queue. Waiters live in a `LinkedHashMap`
//! keyed by a monotonically increasing id, which gives O(1) enqueue at the
//! tail, dequeue from the head and removal from the middle when a waiter is
//! cancelled.
//!
//! A release and a cancellation racing for the same waiter are resolved under
//! the semaphore lock: whichever side changes the waiter first wins, so each
//! waiter completes exactly once. A waiter whose token fired is never granted,
//! even if its handle has not been polled since.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::diagnostics::WaiterGauge;
use crate::error::ConduitError;

#[derive(Debug)]
struct Waiter {
  grant: oneshot::Sender<()>,
  cancel: Option<CancellationToken>,
}

impl Waiter {
  fn is_cancelled(&self) -> bool {
    self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
  }
}

#[derive(Debug)]
struct SemaphoreState {
  current: i64,
  max: i64,
  waiters: LinkedHashMap<u64, Waiter>,
  next_waiter_id: u64,
}

impl SemaphoreState {
  /// Adds `n` units and hands them to queued waiters. Returns how many waiters
  /// left the queue. The caller adjusts the gauge after dropping the lock.
  fn release_locked(&mut self, n: i64) -> Result<usize, ConduitError> {
    if self.current + n > self.max {
      return Err(ConduitError::CapacityExceeded {
        current: self.current,
        requested: n,
        max: self.max,
      });
    }

    let old = self.current;
    self.current += n;
    if old >= 0 {
      return Ok(0);
    }

    let mut budget = n;
    let mut dequeued = 0;
    while budget > 0 {
      let Some((waiter_id, waiter)) = self.waiters.pop_front() else {
        break;
      };
      dequeued += 1;
      if waiter.is_cancelled() {
        // Cancelled before this release: its reservation goes back, the budget is kept.
        self.current += 1;
        tracing::trace!(waiter_id, "Skipped cancelled semaphore waiter");
      } else if waiter.grant.send(()).is_ok() {
        budget -= 1;
      } else {
        self.current += 1;
        tracing::trace!(waiter_id, "Skipped abandoned semaphore waiter");
      }
    }
    Ok(dequeued)
  }

  /// Removes waiters whose token fired but whose handles have not observed
  /// it yet, restoring their reservations. Returns how many were removed.
  fn purge_cancelled(&mut self) -> usize {
    let cancelled: Vec<u64> = self
      .waiters
      .iter()
      .filter(|(_, waiter)| waiter.is_cancelled())
      .map(|(id, _)| *id)
      .collect();
    for waiter_id in &cancelled {
      self.waiters.remove(waiter_id);
      self.current += 1;
    }
    cancelled.len()
  }
}

#[derive(Debug)]
struct SemaphoreInner {
  state: Mutex<SemaphoreState>,
  gauge: Option<Arc<dyn WaiterGauge>>,
}

impl SemaphoreInner {
  fn adjust_gauge(&self, delta: i64) {
    if delta != 0 {
      if let Some(gauge) = &self.gauge {
        gauge.adjust(delta);
      }
    }
  }

  /// Runs `f` on the state after dropping cancelled waiters.
  fn with_live_state<R>(&self, f: impl FnOnce(&mut SemaphoreState) -> R) -> R {
    let mut state = self.state.lock();
    let purged = state.purge_cancelled();
    let result = f(&mut state);
    drop(state);
    self.adjust_gauge(-(purged as i64));
    result
  }
}

/// Asynchronous counting semaphore with an upper bound on its count.
///
/// Cloning yields another handle to the same semaphore.
#[derive(Debug, Clone)]
pub struct AsyncSemaphore {
  inner: Arc<SemaphoreInner>,
}

fn validate_counts(initial: usize, max: usize) -> Result<(i64, i64), ConduitError> {
  if max == 0 {
    return Err(ConduitError::invalid_argument("semaphore max count must be at least 1"));
  }
  if initial > max {
    return Err(ConduitError::invalid_argument(format!(
      "semaphore initial count {} exceeds max count {}",
      initial, max
    )));
  }
  let max = i64::try_from(max).map_err(|_| ConduitError::invalid_argument("semaphore max count too large"))?;
  Ok((initial as i64, max))
}

impl AsyncSemaphore {
  /// Creates a semaphore holding `initial` units out of at most `max`.
  pub fn new(initial: usize, max: usize) -> Result<Self, ConduitError> {
    Self::with_gauge(initial, max, None)
  }

  /// Same as [`new`](Self::new), publishing the parked-waiter count into `gauge`.
  pub fn with_gauge(
    initial: usize,
    max: usize,
    gauge: Option<Arc<dyn WaiterGauge>>,
  ) -> Result<Self, ConduitError> {
    let (initial, max) = validate_counts(initial, max)?;
    Ok(Self {
      inner: Arc::new(SemaphoreInner {
        state: Mutex::new(SemaphoreState {
          current: initial,
          max,
          waiters: LinkedHashMap::new(),
          next_waiter_id: 0,
        }),
        gauge,
      }),
    })
  }

  /// One free unit out of one: the admission gate used by activities.
  pub(crate) fn single_slot(gauge: Option<Arc<dyn WaiterGauge>>) -> Self {
    Self {
      inner: Arc::new(SemaphoreInner {
        state: Mutex::new(SemaphoreState {
          current: 1,
          max: 1,
          waiters: LinkedHashMap::new(),
          next_waiter_id: 0,
        }),
        gauge,
      }),
    }
  }

  /// Current count. Negative values are the number of parked waiters.
  pub fn current_count(&self) -> i64 {
    self.inner.with_live_state(|state| state.current)
  }

  pub fn max_count(&self) -> i64 {
    self.inner.state.lock().max
  }

  /// Parked waiters that have not been cancelled.
  pub fn waiter_count(&self) -> usize {
    self.inner.with_live_state(|state| state.waiters.len())
  }

  /// Takes one unit.
  ///
  /// The reservation is made synchronously: when the count is exhausted the
  /// waiter is queued before this returns, so FIFO order is call order. The
  /// returned handle resolves `Ok(())` once a unit is granted or
  /// `Err(Cancelled)` if `cancel` fires first. An already-cancelled token
  /// resolves immediately without touching the count.
  ///
  /// Dropping a pending handle withdraws the waiter; dropping a handle that
  /// was granted but never polled to completion gives the unit back.
  pub fn wait(&self, cancel: Option<&CancellationToken>) -> SemaphoreWait {
    if cancel.is_some_and(|t| t.is_cancelled()) {
      return SemaphoreWait::ready(Err(ConduitError::Cancelled));
    }

    let mut state = self.inner.state.lock();
    state.current -= 1;
    if state.current >= 0 {
      return SemaphoreWait::ready(Ok(()));
    }

    let waiter_id = state.next_waiter_id;
    state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
    let (tx, rx) = oneshot::channel();
    state.waiters.insert(
      waiter_id,
      Waiter {
        grant: tx,
        cancel: cancel.cloned(),
      },
    );
    let queued = state.waiters.len();
    drop(state);

    self.inner.adjust_gauge(1);
    tracing::trace!(waiter_id, queued, "Semaphore exhausted, waiter enqueued");

    SemaphoreWait {
      state: WaitState::Pending(PendingWait {
        semaphore: self.inner.clone(),
        waiter_id,
        grant: rx,
        cancelled: cancel.map(|t| Box::pin(t.clone().cancelled_owned())),
        finished: false,
      }),
    }
  }

  /// Returns `n` units, failing with `CapacityExceeded` (state untouched) if
  /// that would push the count above the maximum.
  pub fn release(&self, n: usize) -> Result<(), ConduitError> {
    let n = Self::validate_release(n)?;
    let dequeued = self.inner.state.lock().release_locked(n)?;
    self.inner.adjust_gauge(-(dequeued as i64));
    Ok(())
  }

  /// Non-throwing variant of [`release`](Self::release): `Ok(false)` when the
  /// maximum would be exceeded. `n == 0` is still a precondition violation.
  pub fn try_release(&self, n: usize) -> Result<bool, ConduitError> {
    let n = Self::validate_release(n)?;
    match self.inner.state.lock().release_locked(n) {
      Ok(dequeued) => {
        self.inner.adjust_gauge(-(dequeued as i64));
        Ok(true)
      }
      Err(ConduitError::CapacityExceeded { .. }) => Ok(false),
      Err(e) => Err(e),
    }
  }

  /// Reinitialises counts if no waiter is queued. Returns `Ok(false)` and
  /// leaves everything untouched otherwise.
  pub fn try_reset(&self, initial: usize, max: usize) -> Result<bool, ConduitError> {
    let (initial, max) = validate_counts(initial, max)?;
    Ok(self.inner.with_live_state(|state| {
      if !state.waiters.is_empty() {
        return false;
      }
      state.current = initial;
      state.max = max;
      true
    }))
  }

  fn validate_release(n: usize) -> Result<i64, ConduitError> {
    if n == 0 {
      return Err(ConduitError::invalid_argument("release count must be at least 1"));
    }
    i64::try_from(n).map_err(|_| ConduitError::invalid_argument("release count too large"))
  }
}

/// Handle returned by [`AsyncSemaphore::wait`].
#[derive(Debug)]
#[must_use = "dropping the handle withdraws the wait"]
pub struct SemaphoreWait {
  state: WaitState,
}

#[derive(Debug)]
enum WaitState {
  Ready(Option<Result<(), ConduitError>>),
  Pending(PendingWait),
}

struct PendingWait {
  semaphore: Arc<SemaphoreInner>,
  waiter_id: u64,
  grant: oneshot::Receiver<()>,
  cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
  finished: bool,
}

impl std::fmt::Debug for PendingWait {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PendingWait")
      .field("waiter_id", &self.waiter_id)
      .field("cancellable", &self.cancelled.is_some())
      .field("finished", &self.finished)
      .finish()
  }
}

impl PendingWait {
  /// Cancellation side of the race. Removing the waiter from the queue wins.
  /// Finding it gone means either a release granted it before the token fired,
  /// or a release or purge already withdrew it as cancelled.
  fn resolve_cancelled(&mut self) -> Result<(), ConduitError> {
    self.finished = true;
    let mut state = self.semaphore.state.lock();
    if state.waiters.remove(&self.waiter_id).is_some() {
      state.current += 1;
      drop(state);
      self.semaphore.adjust_gauge(-1);
      tracing::trace!(waiter_id = self.waiter_id, "Semaphore waiter cancelled");
      return Err(ConduitError::Cancelled);
    }
    drop(state);
    // Grants are sent under the lock, so the value is visible here.
    self.grant.try_recv().map_err(|_| ConduitError::Cancelled)
  }
}

impl Drop for PendingWait {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    let mut state = self.semaphore.state.lock();
    if state.waiters.remove(&self.waiter_id).is_some() {
      state.current += 1;
      drop(state);
      self.semaphore.adjust_gauge(-1);
      return;
    }
    if self.grant.try_recv().is_ok() {
      // Granted but never observed: hand the unit back.
      match state.release_locked(1) {
        Ok(dequeued) => {
          drop(state);
          self.semaphore.adjust_gauge(-(dequeued as i64));
        }
        Err(e) => {
          drop(state);
          tracing::warn!(waiter_id = self.waiter_id, error = %e, "Could not return unobserved semaphore grant");
        }
      }
    }
  }
}

impl SemaphoreWait {
  fn ready(result: Result<(), ConduitError>) -> Self {
    Self {
      state: WaitState::Ready(Some(result)),
    }
  }

  /// True once the wait has resolved or was resolved synchronously.
  pub fn is_ready(&self) -> bool {
    matches!(self.state, WaitState::Ready(_))
  }
}

impl Future for SemaphoreWait {
  type Output = Result<(), ConduitError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    let pending = match &mut this.state {
      WaitState::Ready(result) => {
        return Poll::Ready(
          result
            .take()
            .unwrap_or_else(|| Err(ConduitError::Internal("semaphore wait polled after completion".into()))),
        );
      }
      WaitState::Pending(pending) => pending,
    };

    // Cancellation first: `resolve_cancelled` still honours a grant that
    // landed before the token fired.
    if let Some(cancelled) = pending.cancelled.as_mut() {
      if cancelled.as_mut().poll(cx).is_ready() {
        let outcome = pending.resolve_cancelled();
        this.state = WaitState::Ready(None);
        return Poll::Ready(outcome);
      }
    }

    if let Poll::Ready(granted) = Pin::new(&mut pending.grant).poll(cx) {
      pending.finished = true;
      this.state = WaitState::Ready(None);
      // A dropped sender means the waiter was withdrawn as cancelled.
      return Poll::Ready(granted.map_err(|_| ConduitError::Cancelled));
    }
    Poll::Pending
  }
}
