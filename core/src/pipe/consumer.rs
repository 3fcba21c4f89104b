// core/src/pipe/consumer.rs

use tokio_util::sync::CancellationToken;

use super::byte_pipe::PipeReader;
use super::connection::Consumer;
use super::LoopExit;
use crate::error::ConduitError;

/// Pipe -> callback. Offers buffered bytes to `consumer` and advances the
/// reader by the reported position. A cancelled read (or `cancel` firing)
/// stops the loop; a completed source stops it after the final offer.
///
/// The reader is always completed on return, with the triggering error when
/// the loop faults.
pub async fn run_consumer<K: Consumer + ?Sized>(
  handle: usize,
  reader: &mut PipeReader,
  consumer: &mut K,
  cancel: &CancellationToken,
) -> Result<LoopExit, ConduitError> {
  tracing::debug!(handle, "Consumer loop started");
  let result = match consume(reader, consumer, cancel).await {
    Err(e) if e.is_cancelled() => Ok(LoopExit::Cancelled),
    other => other,
  };
  match &result {
    Ok(exit) => {
      reader.complete(None);
      tracing::debug!(handle, ?exit, "Consumer loop finished");
    }
    Err(e) => {
      reader.complete(Some(e.clone()));
      tracing::debug!(handle, error = %e, "Consumer loop faulted");
    }
  }
  result
}

async fn consume<K: Consumer + ?Sized>(
  reader: &mut PipeReader,
  consumer: &mut K,
  cancel: &CancellationToken,
) -> Result<LoopExit, ConduitError> {
  loop {
    let read = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Ok(LoopExit::Cancelled),
      read = reader.read() => read?,
    };
    if read.is_canceled {
      return Ok(LoopExit::Cancelled);
    }

    let is_completed = read.is_completed;
    let offered = read.buffer.len();
    let position = consumer.consume(read.buffer, is_completed).await?;
    tracing::trace!(offered, consumed = position.consumed, examined = position.examined, "Consumer advanced");
    reader.advance_to(position.consumed, position.examined)?;

    if is_completed {
      return Ok(LoopExit::SourceCompleted);
    }
  }
}
