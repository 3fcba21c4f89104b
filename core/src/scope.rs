// core/src/scope.rs

//! Runs one asynchronous operation under a private cancellation scope.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::ConduitError;
use crate::sync::ManualResetSignal;

#[derive(Debug, Clone)]
enum OperationStatus {
  Running,
  Succeeded,
  Cancelled,
  Faulted(ConduitError),
}

struct ScopeShared<T> {
  status: Mutex<OperationStatus>,
  output: Mutex<Option<T>>,
  done: ManualResetSignal,
}

impl<T> ScopeShared<T> {
  fn finish(&self, result: Result<T, ConduitError>) {
    let status = match result {
      Ok(value) => {
        *self.output.lock() = Some(value);
        OperationStatus::Succeeded
      }
      Err(e) if e.is_cancelled() => OperationStatus::Cancelled,
      Err(e) => OperationStatus::Faulted(e),
    };
    *self.status.lock() = status;
    self.done.set();
  }
}

/// Records an outcome even if the operation panics before finishing.
struct FinishGuard<T> {
  shared: Option<Arc<ScopeShared<T>>>,
}

impl<T> FinishGuard<T> {
  fn finish(mut self, result: Result<T, ConduitError>) {
    if let Some(shared) = self.shared.take() {
      shared.finish(result);
    }
  }
}

impl<T> Drop for FinishGuard<T> {
  fn drop(&mut self) {
    if let Some(shared) = self.shared.take() {
      tracing::warn!("Scoped operation ended without an outcome");
      shared.finish(Err(ConduitError::Internal("scoped operation panicked or was aborted".into())));
    }
  }
}

/// Handle to an operation started under its own cancellation token.
///
/// The token is a child of the optional external token: cancelling either the
/// external token or this scope cancels the operation, while cancelling the
/// scope leaves the external token untouched.
pub struct CancelableOperationScope<T> {
  cancel: CancellationToken,
  shared: Arc<ScopeShared<T>>,
}

impl<T> fmt::Debug for CancelableOperationScope<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelableOperationScope")
      .field("status", &*self.shared.status.lock())
      .field("cancel_requested", &self.cancel.is_cancelled())
      .finish()
  }
}

impl<T: Send + 'static> CancelableOperationScope<T> {
  /// Invokes `operation` with the scope's token and runs the returned future
  /// on the Tokio runtime without awaiting it.
  ///
  /// If `operation` fails synchronously the error is returned, the scope's
  /// token is dropped (unlinking it from `external`) and nothing is spawned.
  pub fn start<F, Fut>(operation: F, external: Option<&CancellationToken>) -> Result<Self, ConduitError>
  where
    F: FnOnce(CancellationToken) -> Result<Fut, ConduitError>,
    Fut: Future<Output = Result<T, ConduitError>> + Send + 'static,
  {
    let cancel = match external {
      Some(token) => token.child_token(),
      None => CancellationToken::new(),
    };
    let future = operation(cancel.clone())?;

    let shared = Arc::new(ScopeShared {
      status: Mutex::new(OperationStatus::Running),
      output: Mutex::new(None),
      done: ManualResetSignal::new(false),
    });
    let guard = FinishGuard {
      shared: Some(shared.clone()),
    };
    tokio::spawn(async move {
      let result = future.await;
      guard.finish(result);
    });

    Ok(Self { cancel, shared })
  }
}

impl<T> CancelableOperationScope<T> {
  /// Token observed by the operation.
  pub fn token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Requests cancellation without waiting.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn is_completed(&self) -> bool {
    !matches!(*self.shared.status.lock(), OperationStatus::Running)
  }

  pub fn is_canceled(&self) -> bool {
    matches!(*self.shared.status.lock(), OperationStatus::Cancelled)
  }

  /// The fault the operation completed with, if any. Cancellation is not a fault.
  pub fn error(&self) -> Option<ConduitError> {
    match &*self.shared.status.lock() {
      OperationStatus::Faulted(e) => Some(e.clone()),
      _ => None,
    }
  }

  /// Waits for the operation and reports how it ended: `Ok` on success,
  /// `Err(Cancelled)` on cancellation, the fault otherwise.
  pub async fn completion(&self) -> Result<(), ConduitError> {
    self.shared.done.wait(None).await?;
    match &*self.shared.status.lock() {
      OperationStatus::Succeeded => Ok(()),
      OperationStatus::Cancelled => Err(ConduitError::Cancelled),
      OperationStatus::Faulted(e) => Err(e.clone()),
      OperationStatus::Running => Err(ConduitError::Internal("scope signalled before completion".into())),
    }
  }

  /// Takes the operation's value once it succeeded.
  pub fn take_output(&self) -> Option<T> {
    self.shared.output.lock().take()
  }

  /// Cancels the scope and waits for the operation to finish. Never fails:
  /// cancellation is the expected outcome and any fault stays observable
  /// through [`error`](Self::error) and [`completion`](Self::completion).
  pub async fn dispose(&self) {
    self.cancel.cancel();
    if self.shared.done.wait(None).await.is_err() {
      tracing::warn!("Scope completion wait failed during dispose");
    }
  }
}

impl<T> Drop for CancelableOperationScope<T> {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}
