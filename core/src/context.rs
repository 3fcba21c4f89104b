// core/src/context.rs

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::activity::{Activity, ActivityHooks};
use crate::config::RuntimeConfig;
use crate::diagnostics::{AsyncWaiterGauge, WaiterGauge};
use crate::error::ConduitError;
use crate::pipe::{Connection, Consumer, DuplexPipe};
use crate::sync::AsyncSemaphore;

/// State shared by every clone of a [`Runtime`].
#[derive(Debug)]
pub(crate) struct RuntimeInner {
  config: RuntimeConfig,
  /// Present only when `config.async_waiter_metrics` is set.
  waiter_gauge: Option<Arc<AsyncWaiterGauge>>,
  /// Source of handle ids for pipes and activities. Starts at 1.
  next_handle: AtomicUsize,
}

impl RuntimeInner {
  fn new(config: RuntimeConfig) -> Self {
    let waiter_gauge = config.async_waiter_metrics.then(|| Arc::new(AsyncWaiterGauge::new()));
    Self {
      config,
      waiter_gauge,
      next_handle: AtomicUsize::new(1),
    }
  }

  pub(crate) fn next_handle(&self) -> usize {
    self.next_handle.fetch_add(1, AtomicOrdering::Relaxed)
  }

  fn gauge(&self) -> Option<Arc<dyn WaiterGauge>> {
    self
      .waiter_gauge
      .as_ref()
      .map(|gauge| gauge.clone() as Arc<dyn WaiterGauge>)
  }
}

/// Entry point that threads configuration into the primitives it creates.
///
/// Cloning is cheap and clones share the same gauge and handle source.
#[derive(Clone)]
pub struct Runtime {
  inner: Arc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Runtime")
      .field("config", &self.inner.config)
      .field("metrics", &self.inner.waiter_gauge.is_some())
      .finish()
  }
}

impl Default for Runtime {
  fn default() -> Self {
    Self::new()
  }
}

impl Runtime {
  /// Runtime configured from the process snapshot ([`RuntimeConfig::process`]).
  pub fn new() -> Self {
    Self {
      inner: Arc::new(RuntimeInner::new(RuntimeConfig::process().clone())),
    }
  }

  pub fn with_config(config: RuntimeConfig) -> Result<Self, ConduitError> {
    config.validate()?;
    tracing::debug!(?config, "Runtime created with explicit configuration");
    Ok(Self {
      inner: Arc::new(RuntimeInner::new(config)),
    })
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.inner.config
  }

  /// Shared parked-waiter gauge, when metrics are enabled.
  pub fn waiter_gauge(&self) -> Option<Arc<AsyncWaiterGauge>> {
    self.inner.waiter_gauge.clone()
  }

  pub fn semaphore(&self, initial: usize, max: usize) -> Result<AsyncSemaphore, ConduitError> {
    AsyncSemaphore::with_gauge(initial, max, self.inner.gauge())
  }

  /// Activity whose lifecycle gate reports to this runtime's gauge.
  pub fn activity<H: ActivityHooks>(&self, hooks: H) -> Activity<H> {
    let handle = self.inner.next_handle();
    Activity::with_gate(handle, hooks, AsyncSemaphore::single_slot(self.inner.gauge()))
  }

  pub fn duplex_pipe<C: Connection>(&self, connection: C) -> DuplexPipe<C> {
    self.build_pipe(connection, None)
  }

  pub fn duplex_pipe_with_consumer<C: Connection>(&self, connection: C, consumer: impl Consumer) -> DuplexPipe<C> {
    self.build_pipe(connection, Some(Box::new(consumer)))
  }

  fn build_pipe<C: Connection>(&self, connection: C, consumer: Option<Box<dyn Consumer>>) -> DuplexPipe<C> {
    let handle = self.inner.next_handle();
    tracing::debug!(handle, with_consumer = consumer.is_some(), "Creating duplex pipe");
    DuplexPipe::from_parts(
      handle,
      connection,
      self.inner.config.pipe.clone(),
      consumer,
      AsyncSemaphore::single_slot(self.inner.gauge()),
    )
  }
}
