// core/src/pipe/duplex.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::byte_pipe::{byte_pipe, PipeCanceller, PipeOptions, PipeReader};
use super::connection::{Connection, Consumer};
use super::consumer::run_consumer;
use super::producer::run_producer;
use super::LoopExit;
use crate::activity::{Activity, ActivityHooks, ActivityState};
use crate::error::ConduitError;
use crate::sync::AsyncSemaphore;

type ProducerTask = JoinHandle<Result<LoopExit, ConduitError>>;
type ConsumerTask = JoinHandle<(Box<dyn Consumer>, Result<LoopExit, ConduitError>)>;

/// Loops launched by one start.
struct RunningLoops {
  producer: ProducerTask,
  consumer: Option<ConsumerTask>,
  read_canceller: PipeCanceller,
}

#[derive(Debug, Default, Clone, Copy)]
struct LoopExits {
  producer: Option<LoopExit>,
  consumer: Option<LoopExit>,
}

/// Starting/stopping hooks of a [`DuplexPipe`]. Owns the connection.
struct DuplexCore<C: Connection> {
  handle: usize,
  connection: Arc<C>,
  options: PipeOptions,
  consumer: Mutex<Option<Box<dyn Consumer>>>,
  /// Built with a consumer. Such a pipe never falls back to handing out its reader.
  consumer_attached: bool,
  reader: Mutex<Option<PipeReader>>,
  generation: Mutex<CancellationToken>,
  running: Mutex<Option<RunningLoops>>,
  exits: Mutex<LoopExits>,
  connection_released: AtomicBool,
}

fn join_failure(handle: usize, which: &'static str, e: JoinError) -> ConduitError {
  tracing::warn!(handle, loop_name = which, error = %e, "Pipe loop task failed to join");
  ConduitError::Internal(format!("{} loop task failed: {}", which, e))
}

impl<C: Connection> DuplexCore<C> {
  /// Token for the next generation of loops. A token that was never
  /// cancelled is reused.
  fn renew_generation(&self) -> CancellationToken {
    let mut generation = self.generation.lock();
    if generation.is_cancelled() {
      *generation = CancellationToken::new();
    }
    generation.clone()
  }

  async fn release_connection(&self) -> Result<(), ConduitError> {
    if self.connection_released.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    tracing::debug!(handle = self.handle, "Disposing pipe connection");
    self.connection.dispose().await
  }
}

#[async_trait]
impl<C: Connection> ActivityHooks for DuplexCore<C> {
  async fn on_starting(&self, cancel: &CancellationToken) -> Result<(), ConduitError> {
    if self.consumer_attached && self.consumer.lock().is_none() {
      tracing::warn!(handle = self.handle, "Pipe consumer was lost by a failed consumer loop");
      return Err(ConduitError::InvalidState("pipe consumer was lost by a failed consumer loop"));
    }
    self.connection.connect(cancel).await?;

    let generation = self.renew_generation();
    let (mut writer, mut reader) = byte_pipe(self.options.clone());
    let read_canceller = reader.canceller();
    *self.exits.lock() = LoopExits::default();

    let handle = self.handle;
    let producer = {
      let connection = self.connection.clone();
      let generation = generation.clone();
      tokio::spawn(async move { run_producer(handle, &*connection, &mut writer, &generation).await })
    };

    let consumer = self.consumer.lock().take();
    let consumer = match consumer {
      Some(mut consumer) => {
        let generation = generation.clone();
        Some(tokio::spawn(async move {
          let result = run_consumer(handle, &mut reader, &mut *consumer, &generation).await;
          (consumer, result)
        }))
      }
      None => {
        *self.reader.lock() = Some(reader);
        None
      }
    };

    *self.running.lock() = Some(RunningLoops {
      producer,
      consumer,
      read_canceller,
    });
    Ok(())
  }

  async fn on_stopping(&self) -> Result<(), ConduitError> {
    let running = self.running.lock().take();
    let Some(running) = running else {
      return Ok(());
    };

    // Unwind pending receives and reads before joining.
    self.generation.lock().cancel();
    running.read_canceller.cancel_pending_read();

    let consumer_task = running.consumer;
    let (producer_joined, consumer_joined) = futures::join!(running.producer, async move {
      match consumer_task {
        Some(task) => Some(task.await),
        None => None,
      }
    });

    let mut first_error: Option<ConduitError> = None;

    let producer_result = producer_joined.unwrap_or_else(|e| Err(join_failure(self.handle, "producer", e)));
    match producer_result {
      Ok(exit) => self.exits.lock().producer = Some(exit),
      Err(e) if e.is_cancelled() => self.exits.lock().producer = Some(LoopExit::Cancelled),
      Err(e) => {
        first_error.get_or_insert(e);
      }
    }

    if let Some(joined) = consumer_joined {
      match joined {
        Ok((consumer, result)) => {
          *self.consumer.lock() = Some(consumer);
          match result {
            Ok(exit) => self.exits.lock().consumer = Some(exit),
            Err(e) if e.is_cancelled() => self.exits.lock().consumer = Some(LoopExit::Cancelled),
            Err(e) => {
              first_error.get_or_insert(e);
            }
          }
        }
        Err(e) => {
          first_error.get_or_insert(join_failure(self.handle, "consumer", e));
        }
      }
    }

    // An unclaimed reader is completed by dropping it.
    self.reader.lock().take();

    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

impl<C: Connection> Drop for DuplexCore<C> {
  fn drop(&mut self) {
    // Loops of a pipe dropped without dispose must not outlive it.
    self.generation.get_mut().cancel();
  }
}

/// A connection turned into a buffered byte stream.
///
/// Starting connects and launches the producer loop (connection -> pipe).
/// With a [`Consumer`] attached, a consumer loop drains the pipe into it;
/// otherwise the pipe's reader is available through
/// [`take_reader`](Self::take_reader). Outbound bytes go through
/// [`send`](Self::send).
pub struct DuplexPipe<C: Connection> {
  activity: Activity<DuplexCore<C>>,
}

impl<C: Connection> DuplexPipe<C> {
  pub fn new(connection: C, options: PipeOptions) -> Self {
    Self::from_parts(0, connection, options, None, AsyncSemaphore::single_slot(None))
  }

  pub fn with_consumer(connection: C, options: PipeOptions, consumer: impl Consumer) -> Self {
    Self::from_parts(
      0,
      connection,
      options,
      Some(Box::new(consumer)),
      AsyncSemaphore::single_slot(None),
    )
  }

  pub(crate) fn from_parts(
    handle: usize,
    connection: C,
    options: PipeOptions,
    consumer: Option<Box<dyn Consumer>>,
    gate: AsyncSemaphore,
  ) -> Self {
    let core = DuplexCore {
      handle,
      connection: Arc::new(connection),
      options,
      consumer_attached: consumer.is_some(),
      consumer: Mutex::new(consumer),
      reader: Mutex::new(None),
      generation: Mutex::new(CancellationToken::new()),
      running: Mutex::new(None),
      exits: Mutex::new(LoopExits::default()),
      connection_released: AtomicBool::new(false),
    };
    Self {
      activity: Activity::with_gate(handle, core, gate),
    }
  }

  pub fn handle(&self) -> usize {
    self.activity.handle()
  }

  pub async fn start(&self, cancel: &CancellationToken) -> Result<(), ConduitError> {
    self.activity.start_activity(cancel).await
  }

  /// Cancels the loops and waits for them. Loop faults are returned;
  /// cancellation is not.
  pub async fn stop(&self) -> Result<(), ConduitError> {
    self.activity.stop_activity().await
  }

  /// Stops, then disposes the connection. The connection is released even
  /// when stopping fails; the stop error takes precedence.
  pub async fn dispose(&self) -> Result<(), ConduitError> {
    let stopped = self.activity.dispose().await;
    let released = self.activity.hooks().release_connection().await;
    if let Err(e) = &released {
      tracing::warn!(handle = self.handle(), error = %e, "Connection dispose failed");
    }
    stopped.and(released)
  }

  pub fn is_running(&self) -> bool {
    self.activity.is_running()
  }

  pub fn state(&self) -> ActivityState {
    self.activity.state()
  }

  /// Reader of the inbound stream for the current start, when no consumer is
  /// attached. Returns `None` once taken.
  pub fn take_reader(&self) -> Option<PipeReader> {
    self.activity.hooks().reader.lock().take()
  }

  /// Sends `data` on the connection.
  pub async fn send(&self, data: &[u8], cancel: &CancellationToken) -> Result<(), ConduitError> {
    if !self.is_running() {
      return Err(ConduitError::InvalidState("pipe is not running"));
    }
    self.activity.hooks().connection.send(data, cancel).await
  }

  /// How the producer loop of the last stopped start ended.
  pub fn producer_exit(&self) -> Option<LoopExit> {
    self.activity.hooks().exits.lock().producer
  }

  /// How the consumer loop of the last stopped start ended.
  pub fn consumer_exit(&self) -> Option<LoopExit> {
    self.activity.hooks().exits.lock().consumer
  }
}
