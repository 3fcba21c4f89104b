// core/tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use conduit::{CancellationToken, ConduitError, ConsumePosition, Consumer, Connection, Runtime, RuntimeConfig};
use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING_INIT: Once = Once::new();

pub fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conduit=debug,warn"));
    let subscriber = FmtSubscriber::builder()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_test_writer()
      .finish();
    // Another test binary in the same process may have installed one already.
    let _ = tracing::subscriber::set_global_default(subscriber);
  });
}

pub fn test_runtime() -> Runtime {
  setup_tracing();
  Runtime::with_config(RuntimeConfig::default()).expect("default config is valid")
}

pub fn metrics_runtime() -> Runtime {
  setup_tracing();
  Runtime::with_config(RuntimeConfig {
    async_waiter_metrics: true,
    ..RuntimeConfig::default()
  })
  .expect("metrics config is valid")
}

/// Polls `condition` until it holds, failing after [`WAIT_TIMEOUT`].
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
  let result = tokio::time::timeout(WAIT_TIMEOUT, async {
    while !condition() {
      tokio::time::sleep(Duration::from_millis(2)).await;
    }
  })
  .await;
  assert!(result.is_ok(), "timed out waiting for {}", what);
}

// --- Scripted connection ---

/// What a [`ScriptedConnection`] does once its chunks run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
  /// Report end of stream.
  Eof,
  /// Block until cancelled.
  Hang,
  /// Fail the receive with an I/O error.
  Fail,
}

/// Observations shared between a test and the connection it handed off.
#[derive(Debug, Default)]
pub struct ConnectionProbe {
  pub connects: AtomicUsize,
  pub receives: AtomicUsize,
  pub disposes: AtomicUsize,
  pub sent: Mutex<Vec<u8>>,
}

impl ConnectionProbe {
  pub fn connects(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }

  pub fn disposes(&self) -> usize {
    self.disposes.load(Ordering::SeqCst)
  }
}

pub struct ScriptedConnection {
  chunks: Mutex<VecDeque<Vec<u8>>>,
  ending: Ending,
  fail_connect: bool,
  probe: Arc<ConnectionProbe>,
}

impl ScriptedConnection {
  pub fn new(chunks: Vec<Vec<u8>>, ending: Ending) -> (Self, Arc<ConnectionProbe>) {
    let probe = Arc::new(ConnectionProbe::default());
    let connection = Self {
      chunks: Mutex::new(chunks.into()),
      ending,
      fail_connect: false,
      probe: probe.clone(),
    };
    (connection, probe)
  }

  pub fn failing_connect() -> (Self, Arc<ConnectionProbe>) {
    let (mut connection, probe) = Self::new(Vec::new(), Ending::Eof);
    connection.fail_connect = true;
    (connection, probe)
  }
}

#[async_trait]
impl Connection for ScriptedConnection {
  async fn connect(&self, _cancel: &CancellationToken) -> Result<(), ConduitError> {
    self.probe.connects.fetch_add(1, Ordering::SeqCst);
    if self.fail_connect {
      return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal").into());
    }
    Ok(())
  }

  async fn receive(&self, buffer: &mut [u8], cancel: &CancellationToken) -> Result<usize, ConduitError> {
    self.probe.receives.fetch_add(1, Ordering::SeqCst);
    let next = self.chunks.lock().pop_front();
    if let Some(mut chunk) = next {
      let n = chunk.len().min(buffer.len());
      buffer[..n].copy_from_slice(&chunk[..n]);
      if n < chunk.len() {
        self.chunks.lock().push_front(chunk.split_off(n));
      }
      return Ok(n);
    }
    match self.ending {
      Ending::Eof => Ok(0),
      Ending::Hang => {
        cancel.cancelled().await;
        Err(ConduitError::Cancelled)
      }
      Ending::Fail => Err(io::Error::new(io::ErrorKind::Other, "scripted receive failure").into()),
    }
  }

  async fn send(&self, buffer: &[u8], _cancel: &CancellationToken) -> Result<(), ConduitError> {
    self.probe.sent.lock().extend_from_slice(buffer);
    Ok(())
  }

  async fn dispose(&self) -> Result<(), ConduitError> {
    self.probe.disposes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

// --- Consumers ---

#[derive(Debug, Default)]
pub struct Collected {
  pub bytes: Mutex<Vec<u8>>,
  pub saw_completion: std::sync::atomic::AtomicBool,
}

impl Collected {
  pub fn bytes(&self) -> Vec<u8> {
    self.bytes.lock().clone()
  }

  pub fn completed(&self) -> bool {
    self.saw_completion.load(Ordering::SeqCst)
  }
}

/// Consumes everything it is offered.
pub struct CollectingConsumer {
  pub collected: Arc<Collected>,
}

impl CollectingConsumer {
  pub fn new() -> (Self, Arc<Collected>) {
    let collected = Arc::new(Collected::default());
    (
      Self {
        collected: collected.clone(),
      },
      collected,
    )
  }
}

#[async_trait]
impl Consumer for CollectingConsumer {
  async fn consume(&mut self, buffer: &[u8], is_completed: bool) -> Result<ConsumePosition, ConduitError> {
    self.collected.bytes.lock().extend_from_slice(buffer);
    if is_completed {
      self.collected.saw_completion.store(true, Ordering::SeqCst);
    }
    Ok(ConsumePosition::consumed(buffer.len()))
  }
}
