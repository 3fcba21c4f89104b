// core/src/pipe/mod.rs

//! Pipe-driven duplex transport runtime.
//!
//! A [`DuplexPipe`] owns a [`Connection`] and runs two loops over an internal
//! [`byte_pipe`]: the producer receives from the connection into the pipe, the
//! consumer drains the pipe into a protocol [`Consumer`]. Both stop on
//! cancellation without treating it as a fault.

pub mod byte_pipe;
pub mod connection;
pub mod consumer;
pub mod duplex;
pub mod producer;

pub use byte_pipe::{
  byte_pipe, FlushResult, PipeCanceller, PipeOptions, PipeReader, PipeWriter, ReadResult,
};
pub use connection::{Connection, ConsumePosition, Consumer};
pub use consumer::run_consumer;
pub use duplex::DuplexPipe;
pub use producer::run_producer;

/// Why a producer or consumer loop returned without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
  /// The connection reported end of stream (a zero-byte receive).
  EndOfStream,
  /// The reading side completed, so nothing more will be read.
  ReaderCompleted,
  /// The writing side completed and its final bytes were offered.
  SourceCompleted,
  /// Stopped by a cancellation request.
  Cancelled,
}
