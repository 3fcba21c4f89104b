// core/src/pipe/producer.rs

use tokio_util::sync::CancellationToken;

use super::byte_pipe::PipeWriter;
use super::connection::Connection;
use super::LoopExit;
use crate::error::ConduitError;

/// Network -> pipe. Receives from `connection` into the writer until end of
/// stream, reader completion, or cancellation, flushing after every receive.
///
/// The writer is always completed on return. A fault completes it with the
/// error, so the reading side observes it, and is returned as `Err`.
/// Cancellation is a clean `Ok(LoopExit::Cancelled)`.
pub async fn run_producer<C: Connection + ?Sized>(
  handle: usize,
  connection: &C,
  writer: &mut PipeWriter,
  cancel: &CancellationToken,
) -> Result<LoopExit, ConduitError> {
  tracing::debug!(handle, "Producer loop started");
  let result = match produce(connection, writer, cancel).await {
    Err(e) if e.is_cancelled() => Ok(LoopExit::Cancelled),
    other => other,
  };
  match &result {
    Ok(exit) => {
      writer.complete(None);
      tracing::debug!(handle, ?exit, "Producer loop finished");
    }
    Err(e) => {
      writer.complete(Some(e.clone()));
      tracing::debug!(handle, error = %e, "Producer loop faulted");
    }
  }
  result
}

async fn produce<C: Connection + ?Sized>(
  connection: &C,
  writer: &mut PipeWriter,
  cancel: &CancellationToken,
) -> Result<LoopExit, ConduitError> {
  loop {
    let size = writer.options().receive_buffer_size;
    let memory = writer.get_memory(size);
    let received = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Ok(LoopExit::Cancelled),
      received = connection.receive(memory, cancel) => received?,
    };

    writer.advance(received)?;
    if received == 0 {
      return Ok(LoopExit::EndOfStream);
    }
    tracing::trace!(received, "Producer committed bytes");

    let flushed = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Ok(LoopExit::Cancelled),
      flushed = writer.flush() => flushed?,
    };
    if flushed.is_completed {
      return Ok(LoopExit::ReaderCompleted);
    }
    if flushed.is_canceled {
      return Ok(LoopExit::Cancelled);
    }
  }
}
