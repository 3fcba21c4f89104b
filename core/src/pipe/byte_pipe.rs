// core/src/pipe/byte_pipe.rs

//! In-memory byte pipe with independent writer and reader ends.
//!
//! The writer stages bytes (`get_memory` + `advance`, or `write`) and
//! publishes them with `flush`, which suspends while the reader lags by more
//! than `pause_writer_threshold` bytes and resumes once the backlog drops to
//! `resume_writer_threshold`. The reader sees a growing slice and reports how
//! far it consumed and how far it examined; unconsumed bytes are offered
//! again, and a fully examined buffer makes the next `read` wait for new data.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ConduitError;

/// Sizing and backpressure knobs for a byte pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeOptions {
  /// Minimum size of the region handed out by `PipeWriter::get_memory`, and
  /// the receive buffer size used by the producer loop.
  pub receive_buffer_size: usize,
  /// Unconsumed byte count at which `flush` starts suspending. `0` disables
  /// backpressure.
  pub pause_writer_threshold: usize,
  /// Unconsumed byte count at or below which a suspended `flush` resumes.
  pub resume_writer_threshold: usize,
}

pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_PAUSE_WRITER_THRESHOLD: usize = 65536;
pub const DEFAULT_RESUME_WRITER_THRESHOLD: usize = 32768;

impl Default for PipeOptions {
  fn default() -> Self {
    Self {
      receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
      pause_writer_threshold: DEFAULT_PAUSE_WRITER_THRESHOLD,
      resume_writer_threshold: DEFAULT_RESUME_WRITER_THRESHOLD,
    }
  }
}

impl PipeOptions {
  pub fn validate(&self) -> Result<(), ConduitError> {
    if self.receive_buffer_size == 0 {
      return Err(ConduitError::InvalidConfig("receive_buffer_size must be at least 1".into()));
    }
    if self.resume_writer_threshold > self.pause_writer_threshold {
      return Err(ConduitError::InvalidConfig(format!(
        "resume_writer_threshold ({}) exceeds pause_writer_threshold ({})",
        self.resume_writer_threshold, self.pause_writer_threshold
      )));
    }
    Ok(())
  }
}

/// Outcome of [`PipeWriter::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
  /// The reader completed; nothing written from now on will be read.
  pub is_completed: bool,
  /// The flush was interrupted by `cancel_pending_flush`.
  pub is_canceled: bool,
}

/// Outcome of [`PipeReader::read`].
#[derive(Debug, Clone, Copy)]
pub struct ReadResult<'a> {
  /// Every byte not yet consumed, oldest first.
  pub buffer: &'a [u8],
  /// The writer completed; `buffer` is all that will ever arrive.
  pub is_completed: bool,
  /// The read was interrupted by `cancel_pending_read`.
  pub is_canceled: bool,
}

#[derive(Debug, Default)]
struct PipeState {
  /// Flushed bytes not yet moved into the reader's buffer.
  published: BytesMut,
  /// Flushed bytes the reader has not consumed, wherever they sit.
  unconsumed: usize,
  writer_completed: bool,
  writer_error: Option<ConduitError>,
  reader_completed: bool,
  read_cancel_requested: bool,
  flush_cancel_requested: bool,
}

#[derive(Debug)]
struct PipeShared {
  state: Mutex<PipeState>,
  read_ready: Notify,
  write_ready: Notify,
  options: PipeOptions,
}

/// Creates a connected writer/reader pair.
pub fn byte_pipe(options: PipeOptions) -> (PipeWriter, PipeReader) {
  let shared = Arc::new(PipeShared {
    state: Mutex::new(PipeState::default()),
    read_ready: Notify::new(),
    write_ready: Notify::new(),
    options,
  });
  let writer = PipeWriter {
    shared: shared.clone(),
    staged: BytesMut::new(),
    reserved_from: None,
    completed: false,
  };
  let reader = PipeReader {
    shared,
    buffered: BytesMut::new(),
    examined: 0,
    completed: false,
  };
  (writer, reader)
}

/// Interrupts pending operations on a pipe from outside the task that owns
/// the end.
#[derive(Debug, Clone)]
pub struct PipeCanceller {
  shared: Arc<PipeShared>,
}

impl PipeCanceller {
  /// Makes the current (or next) `read` return with `is_canceled` set.
  pub fn cancel_pending_read(&self) {
    self.shared.state.lock().read_cancel_requested = true;
    self.shared.read_ready.notify_waiters();
  }

  /// Makes the current (or next) backpressured `flush` return with
  /// `is_canceled` set.
  pub fn cancel_pending_flush(&self) {
    self.shared.state.lock().flush_cancel_requested = true;
    self.shared.write_ready.notify_waiters();
  }
}

// --- Writer ---

#[derive(Debug)]
pub struct PipeWriter {
  shared: Arc<PipeShared>,
  /// Advanced but unflushed bytes, followed by any outstanding reservation.
  staged: BytesMut,
  reserved_from: Option<usize>,
  completed: bool,
}

impl PipeWriter {
  pub fn canceller(&self) -> PipeCanceller {
    PipeCanceller {
      shared: self.shared.clone(),
    }
  }

  pub fn options(&self) -> &PipeOptions {
    &self.shared.options
  }

  /// Reserves a writable region of at least `size_hint` bytes (and at least
  /// the configured receive buffer size). Replaces any earlier reservation
  /// that was not advanced.
  pub fn get_memory(&mut self, size_hint: usize) -> &mut [u8] {
    self.drop_reservation();
    let size = size_hint.max(self.shared.options.receive_buffer_size);
    let start = self.staged.len();
    self.staged.resize(start + size, 0);
    self.reserved_from = Some(start);
    &mut self.staged[start..]
  }

  /// Commits the first `count` bytes of the last reservation.
  pub fn advance(&mut self, count: usize) -> Result<(), ConduitError> {
    let start = self
      .reserved_from
      .take()
      .ok_or(ConduitError::InvalidState("advance without a reserved region"))?;
    let reserved = self.staged.len() - start;
    if count > reserved {
      self.staged.truncate(start);
      return Err(ConduitError::invalid_argument(format!(
        "advanced {} bytes past a {} byte reservation",
        count, reserved
      )));
    }
    self.staged.truncate(start + count);
    Ok(())
  }

  /// Stages a copy of `data`.
  pub fn write(&mut self, data: &[u8]) -> Result<(), ConduitError> {
    self.ensure_open()?;
    self.drop_reservation();
    self.staged.extend_from_slice(data);
    Ok(())
  }

  /// Number of staged, unflushed bytes.
  pub fn unflushed_bytes(&self) -> usize {
    self.reserved_from.unwrap_or(self.staged.len())
  }

  fn drop_reservation(&mut self) {
    if let Some(start) = self.reserved_from.take() {
      self.staged.truncate(start);
    }
  }

  fn ensure_open(&self) -> Result<(), ConduitError> {
    if self.completed {
      return Err(ConduitError::InvalidState("pipe writer already completed"));
    }
    Ok(())
  }

  /// Moves staged bytes to the reader. Returns `true` if the reader is gone.
  fn publish(&mut self) -> bool {
    self.drop_reservation();
    let mut state = self.shared.state.lock();
    if state.reader_completed {
      self.staged.clear();
      return true;
    }
    if self.staged.is_empty() {
      return false;
    }
    state.unconsumed += self.staged.len();
    state.published.unsplit(self.staged.split());
    drop(state);
    self.shared.read_ready.notify_waiters();
    false
  }

  /// Publishes staged bytes, then applies backpressure.
  pub async fn flush(&mut self) -> Result<FlushResult, ConduitError> {
    self.ensure_open()?;
    if self.publish() {
      return Ok(FlushResult {
        is_completed: true,
        is_canceled: false,
      });
    }

    let pause = self.shared.options.pause_writer_threshold;
    let resume = self.shared.options.resume_writer_threshold;
    let mut paused = false;
    loop {
      let notified = self.shared.write_ready.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      {
        let mut state = self.shared.state.lock();
        if state.reader_completed {
          return Ok(FlushResult {
            is_completed: true,
            is_canceled: false,
          });
        }
        if std::mem::take(&mut state.flush_cancel_requested) {
          return Ok(FlushResult {
            is_completed: false,
            is_canceled: true,
          });
        }
        if pause == 0 {
          return Ok(FlushResult::default());
        }
        if !paused {
          if state.unconsumed < pause {
            return Ok(FlushResult::default());
          }
          paused = true;
          tracing::trace!(unconsumed = state.unconsumed, pause, "Pipe writer paused");
        } else if state.unconsumed <= resume {
          tracing::trace!(unconsumed = state.unconsumed, resume, "Pipe writer resumed");
          return Ok(FlushResult::default());
        }
      }
      notified.await;
    }
  }

  /// Publishes staged bytes and marks the writer done. With an error, the
  /// reader's next `read` fails with it. Later calls are no-ops.
  pub fn complete(&mut self, error: Option<ConduitError>) {
    if self.completed {
      return;
    }
    self.publish();
    self.completed = true;
    {
      let mut state = self.shared.state.lock();
      state.writer_completed = true;
      state.writer_error = error;
    }
    self.shared.read_ready.notify_waiters();
  }

  pub fn is_completed(&self) -> bool {
    self.completed
  }
}

impl Drop for PipeWriter {
  fn drop(&mut self) {
    self.complete(None);
  }
}

// --- Reader ---

#[derive(Debug)]
pub struct PipeReader {
  shared: Arc<PipeShared>,
  /// Received but unconsumed bytes.
  buffered: BytesMut,
  /// Prefix of `buffered` the consumer has already looked at.
  examined: usize,
  completed: bool,
}

impl PipeReader {
  pub fn canceller(&self) -> PipeCanceller {
    PipeCanceller {
      shared: self.shared.clone(),
    }
  }

  /// Waits until there are unexamined bytes, the writer completes, or a
  /// pending-read cancellation is requested. A writer that completed with an
  /// error fails the read with that error.
  pub async fn read(&mut self) -> Result<ReadResult<'_>, ConduitError> {
    if self.completed {
      return Err(ConduitError::InvalidState("pipe reader already completed"));
    }
    let shared = self.shared.clone();
    loop {
      let notified = shared.read_ready.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      {
        let mut state = shared.state.lock();
        if let Some(err) = &state.writer_error {
          return Err(err.clone());
        }
        if !state.published.is_empty() {
          self.buffered.unsplit(state.published.split());
        }
        let is_canceled = std::mem::take(&mut state.read_cancel_requested);
        let is_completed = state.writer_completed;
        if is_canceled || is_completed || self.buffered.len() > self.examined {
          drop(state);
          return Ok(ReadResult {
            buffer: &self.buffered[..],
            is_completed,
            is_canceled,
          });
        }
      }
      notified.await;
    }
  }

  /// Releases the first `consumed` bytes and records that the first
  /// `examined` bytes were inspected.
  pub fn advance_to(&mut self, consumed: usize, examined: usize) -> Result<(), ConduitError> {
    if consumed > examined || examined > self.buffered.len() {
      return Err(ConduitError::invalid_argument(format!(
        "invalid advance: consumed {} examined {} of {} buffered bytes",
        consumed,
        examined,
        self.buffered.len()
      )));
    }
    self.buffered.advance(consumed);
    self.examined = examined - consumed;
    if consumed > 0 {
      self.shared.state.lock().unconsumed -= consumed;
      self.shared.write_ready.notify_waiters();
    }
    Ok(())
  }

  /// Shorthand for consuming and examining the same prefix.
  pub fn advance(&mut self, consumed: usize) -> Result<(), ConduitError> {
    self.advance_to(consumed, consumed)
  }

  /// Marks the reader done; the writer's next `flush` reports
  /// `is_completed`. Later calls are no-ops.
  pub fn complete(&mut self, error: Option<ConduitError>) {
    if self.completed {
      return;
    }
    self.completed = true;
    if let Some(e) = &error {
      tracing::trace!(error = %e, "Pipe reader completed with error");
    }
    self.buffered.clear();
    self.examined = 0;
    {
      let mut state = self.shared.state.lock();
      state.reader_completed = true;
      state.published.clear();
      state.unconsumed = 0;
    }
    self.shared.write_ready.notify_waiters();
  }

  pub fn is_completed(&self) -> bool {
    self.completed
  }
}

impl Drop for PipeReader {
  fn drop(&mut self) {
    self.complete(None);
  }
}
