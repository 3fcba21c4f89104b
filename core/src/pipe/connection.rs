// core/src/pipe/connection.rs

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ConduitError;

/// The raw transport a [`DuplexPipe`](super::DuplexPipe) drives.
///
/// Any listener or dialer (TCP, TLS, QUIC, WebSocket, Unix socket) plugs in by
/// implementing this. Methods take `&self` because receiving and sending run
/// concurrently on different tasks; implementations split their stream or
/// guard each half internally.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
  /// Establishes the connection. Called from the pipe's starting hook.
  async fn connect(&self, cancel: &CancellationToken) -> Result<(), ConduitError>;

  /// Receives into `buffer`, returning the byte count. `0` means end of stream.
  /// Should return `Err(Cancelled)` promptly once `cancel` fires.
  async fn receive(&self, buffer: &mut [u8], cancel: &CancellationToken) -> Result<usize, ConduitError>;

  /// Sends all of `buffer`.
  async fn send(&self, buffer: &[u8], cancel: &CancellationToken) -> Result<(), ConduitError>;

  /// Releases the transport. Called exactly once, when the pipe is disposed.
  async fn dispose(&self) -> Result<(), ConduitError>;
}

/// How much of an offered buffer a [`Consumer`] processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumePosition {
  /// Prefix fully processed; released from the pipe.
  pub consumed: usize,
  /// Prefix looked at. Bytes between `consumed` and `examined` stay buffered,
  /// and the next read waits for data beyond `examined`.
  pub examined: usize,
}

impl ConsumePosition {
  pub fn new(consumed: usize, examined: usize) -> Self {
    Self { consumed, examined }
  }

  /// Everything up to `count` processed and examined.
  pub fn consumed(count: usize) -> Self {
    Self::new(count, count)
  }

  /// Nothing processed, but the whole `len`-byte buffer was inspected: wait
  /// for more data before offering it again.
  pub fn need_more(len: usize) -> Self {
    Self::new(0, len)
  }
}

/// Protocol-side callback driven by the consumer loop.
#[async_trait]
pub trait Consumer: Send + 'static {
  /// Offered every unconsumed byte, oldest first, with newly arrived bytes
  /// appended. `is_completed` marks the final offer before the source ends.
  async fn consume(&mut self, buffer: &[u8], is_completed: bool) -> Result<ConsumePosition, ConduitError>;
}
