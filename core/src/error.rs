// core/src/error.rs

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// The error type shared by every primitive, loop and pipe in this crate.
///
/// `Clone` so a single transport fault can complete both ends of a pipe and
/// still be re-surfaced from the loop's own completion handle.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConduitError {
  // --- Precondition violations ---
  #[error("Invalid argument provided: {0}")]
  InvalidArgument(String),

  #[error("Capacity exceeded: current count {current} + {requested} would exceed maximum {max}")]
  CapacityExceeded { current: i64, requested: i64, max: i64 },

  #[error("Operation is invalid for the current state: {0}")]
  InvalidState(&'static str),

  #[error("Object has been disposed: {0}")]
  Disposed(&'static str),

  // --- Control flow ---
  #[error("Operation was cancelled")]
  Cancelled,

  // --- Transport ---
  #[error("I/O error: {0}")]
  Io(Arc<io::Error>),

  #[error("Connection closed by peer or transport")]
  ConnectionClosed,

  // --- Configuration ---
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),

  // --- Internal Errors ---
  #[error("Internal library error: {0}")]
  Internal(String),
}

impl ConduitError {
  /// True for the cancelled outcome, which loops and stop paths treat as a
  /// clean exit rather than a fault.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, ConduitError::Cancelled)
  }

  pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
    ConduitError::InvalidArgument(msg.into())
  }
}

impl From<io::Error> for ConduitError {
  fn from(e: io::Error) -> Self {
    match e.kind() {
      io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
        ConduitError::ConnectionClosed
      }
      _ => ConduitError::Io(Arc::new(e)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_errors_map_to_connection_closed_for_resets() {
    let err: ConduitError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
    assert!(matches!(err, ConduitError::ConnectionClosed));

    let err: ConduitError = io::Error::new(io::ErrorKind::Other, "boom").into();
    match err {
      ConduitError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::Other),
      other => panic!("unexpected mapping: {:?}", other),
    }
  }

  #[test]
  fn cloned_io_error_shares_source() {
    let err: ConduitError = io::Error::new(io::ErrorKind::Other, "shared").into();
    let copy = err.clone();
    assert_eq!(err.to_string(), copy.to_string());
    assert!(!copy.is_cancelled());
    assert!(ConduitError::Cancelled.is_cancelled());
  }
}
