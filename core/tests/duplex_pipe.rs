// core/tests/duplex_pipe.rs

use async_trait::async_trait;
use conduit::pipe::PipeReader;
use conduit::{ActivityState, CancellationToken, ConduitError, ConsumePosition, Consumer, LoopExit};
use parking_lot::Mutex;

use std::sync::Arc;

mod common;
use common::{eventually, CollectingConsumer, Ending, ScriptedConnection};

const PAYLOAD: [u8; 4] = [0x00, 0x11, 0x22, 0x33];

async fn drain(reader: &mut PipeReader) -> anyhow::Result<Vec<u8>> {
  let mut collected = Vec::new();
  loop {
    let read = reader.read().await?;
    collected.extend_from_slice(read.buffer);
    let len = read.buffer.len();
    let done = read.is_completed || read.is_canceled;
    reader.advance(len)?;
    if done {
      return Ok(collected);
    }
  }
}

#[tokio::test]
async fn reader_sees_every_byte_then_end_of_stream() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, probe) = ScriptedConnection::new(vec![PAYLOAD.to_vec()], Ending::Eof);
  let pipe = runtime.duplex_pipe(connection);

  pipe.start(&CancellationToken::new()).await?;
  assert!(pipe.is_running());
  assert_eq!(probe.connects(), 1);

  let mut reader = pipe.take_reader().expect("reader available without a consumer");
  assert!(pipe.take_reader().is_none());
  let bytes = tokio::time::timeout(common::WAIT_TIMEOUT, drain(&mut reader)).await??;
  assert_eq!(bytes, PAYLOAD);

  pipe.stop().await?;
  assert_eq!(pipe.state(), ActivityState::Stopped);
  assert_eq!(pipe.producer_exit(), Some(LoopExit::EndOfStream));
  assert_eq!(pipe.consumer_exit(), None);
  Ok(())
}

#[tokio::test]
async fn consumer_is_offered_the_stream_and_its_completion() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, _probe) = ScriptedConnection::new(vec![vec![0x00, 0x11], vec![0x22, 0x33]], Ending::Eof);
  let (consumer, collected) = CollectingConsumer::new();
  let pipe = runtime.duplex_pipe_with_consumer(connection, consumer);

  pipe.start(&CancellationToken::new()).await?;
  assert!(pipe.take_reader().is_none(), "reader belongs to the consumer loop");
  eventually("consumer completion", || collected.completed()).await;
  assert_eq!(collected.bytes(), PAYLOAD);

  pipe.stop().await?;
  assert_eq!(pipe.producer_exit(), Some(LoopExit::EndOfStream));
  assert_eq!(pipe.consumer_exit(), Some(LoopExit::SourceCompleted));
  Ok(())
}

#[tokio::test]
async fn stopping_mid_stream_is_a_clean_cancellation() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, _probe) = ScriptedConnection::new(vec![PAYLOAD.to_vec()], Ending::Hang);
  let (consumer, collected) = CollectingConsumer::new();
  let pipe = runtime.duplex_pipe_with_consumer(connection, consumer);

  pipe.start(&CancellationToken::new()).await?;
  eventually("payload delivery", || collected.bytes().len() == PAYLOAD.len()).await;

  pipe.stop().await?;
  assert!(!pipe.is_running());
  assert!(!collected.completed());
  assert_eq!(pipe.producer_exit(), Some(LoopExit::Cancelled));
  assert_eq!(pipe.consumer_exit(), Some(LoopExit::Cancelled));
  Ok(())
}

/// Splits the stream into fixed-size frames, leaving partial frames buffered.
struct FrameConsumer {
  frames: Arc<Mutex<Vec<Vec<u8>>>>,
  tail: Arc<Mutex<Option<Vec<u8>>>>,
}

#[async_trait]
impl Consumer for FrameConsumer {
  async fn consume(&mut self, buffer: &[u8], is_completed: bool) -> Result<ConsumePosition, ConduitError> {
    let mut consumed = 0;
    for frame in buffer.chunks_exact(4) {
      self.frames.lock().push(frame.to_vec());
      consumed += 4;
    }
    if is_completed {
      *self.tail.lock() = Some(buffer[consumed..].to_vec());
    }
    Ok(ConsumePosition::new(consumed, buffer.len()))
  }
}

#[tokio::test]
async fn partially_consumed_bytes_are_offered_again() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, _probe) = ScriptedConnection::new(vec![vec![0x00, 0x11], vec![0x22, 0x33, 0x44]], Ending::Eof);
  let frames = Arc::new(Mutex::new(Vec::new()));
  let tail = Arc::new(Mutex::new(None));
  let pipe = runtime.duplex_pipe_with_consumer(
    connection,
    FrameConsumer {
      frames: frames.clone(),
      tail: tail.clone(),
    },
  );

  pipe.start(&CancellationToken::new()).await?;
  eventually("final offer", || tail.lock().is_some()).await;

  assert_eq!(*frames.lock(), vec![PAYLOAD.to_vec()]);
  assert_eq!(*tail.lock(), Some(vec![0x44]));
  pipe.stop().await?;
  assert_eq!(pipe.consumer_exit(), Some(LoopExit::SourceCompleted));
  Ok(())
}

#[tokio::test]
async fn receive_fault_reaches_the_reader_and_stop() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, _probe) = ScriptedConnection::new(vec![PAYLOAD.to_vec()], Ending::Fail);
  let pipe = runtime.duplex_pipe(connection);
  pipe.start(&CancellationToken::new()).await?;

  let mut reader = pipe.take_reader().expect("reader available");
  let observed = tokio::time::timeout(common::WAIT_TIMEOUT, drain(&mut reader)).await?;
  let err = observed.expect_err("writer fault must fail the read");
  assert!(matches!(err.downcast_ref::<ConduitError>(), Some(ConduitError::Io(_))));

  let stopped = pipe.stop().await;
  assert!(matches!(stopped, Err(ConduitError::Io(_))));
  assert_eq!(pipe.state(), ActivityState::Stopped);
  assert_eq!(pipe.producer_exit(), None);
  Ok(())
}

#[tokio::test]
async fn failed_connect_leaves_the_pipe_stopped() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, probe) = ScriptedConnection::failing_connect();
  let pipe = runtime.duplex_pipe(connection);

  let started = pipe.start(&CancellationToken::new()).await;
  assert!(matches!(started, Err(ConduitError::Io(_))));
  assert_eq!(pipe.state(), ActivityState::Stopped);
  assert!(pipe.take_reader().is_none());

  pipe.dispose().await?;
  assert_eq!(probe.disposes(), 1);
  Ok(())
}

#[tokio::test]
async fn pipe_can_be_restarted_after_stop() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, probe) = ScriptedConnection::new(vec![PAYLOAD.to_vec()], Ending::Hang);
  let pipe = runtime.duplex_pipe(connection);

  pipe.start(&CancellationToken::new()).await?;
  pipe.stop().await?;
  pipe.start(&CancellationToken::new()).await?;
  assert!(pipe.is_running());
  assert_eq!(probe.connects(), 2);
  assert!(pipe.take_reader().is_some(), "each start gets a fresh reader");

  pipe.stop().await?;
  assert_eq!(pipe.producer_exit(), Some(LoopExit::Cancelled));
  Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_connect_once() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, probe) = ScriptedConnection::new(Vec::new(), Ending::Hang);
  let pipe = Arc::new(runtime.duplex_pipe(connection));
  let token = CancellationToken::new();

  let mut tasks = Vec::new();
  for _ in 0..8 {
    let pipe = pipe.clone();
    let token = token.clone();
    tasks.push(tokio::spawn(async move { pipe.start(&token).await }));
  }
  for task in tasks {
    task.await??;
  }
  assert_eq!(probe.connects(), 1);

  pipe.dispose().await?;
  Ok(())
}

#[tokio::test]
async fn dispose_is_terminal_and_releases_the_connection_once() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, probe) = ScriptedConnection::new(Vec::new(), Ending::Hang);
  let pipe = runtime.duplex_pipe(connection);

  pipe.start(&CancellationToken::new()).await?;
  pipe.dispose().await?;
  assert_eq!(pipe.state(), ActivityState::Disposed);
  assert_eq!(pipe.producer_exit(), Some(LoopExit::Cancelled));
  assert_eq!(probe.disposes(), 1);

  pipe.dispose().await?;
  assert_eq!(probe.disposes(), 1);
  assert!(matches!(
    pipe.start(&CancellationToken::new()).await,
    Err(ConduitError::Disposed(_))
  ));
  assert!(matches!(pipe.stop().await, Err(ConduitError::Disposed(_))));
  Ok(())
}

#[tokio::test]
async fn send_requires_a_running_pipe() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, probe) = ScriptedConnection::new(Vec::new(), Ending::Hang);
  let pipe = runtime.duplex_pipe(connection);
  let token = CancellationToken::new();

  assert!(matches!(
    pipe.send(b"early", &token).await,
    Err(ConduitError::InvalidState(_))
  ));

  pipe.start(&token).await?;
  pipe.send(b"ping", &token).await?;
  pipe.send(b"pong", &token).await?;
  assert_eq!(*probe.sent.lock(), b"pingpong".to_vec());

  pipe.dispose().await?;
  Ok(())
}

#[tokio::test]
async fn pipes_get_distinct_handles() {
  let runtime = common::test_runtime();
  let (a, _) = ScriptedConnection::new(Vec::new(), Ending::Eof);
  let (b, _) = ScriptedConnection::new(Vec::new(), Ending::Eof);
  let first = runtime.duplex_pipe(a);
  let second = runtime.duplex_pipe(b);
  assert_ne!(first.handle(), second.handle());
}

struct PanickingConsumer {
  reached: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl Consumer for PanickingConsumer {
  async fn consume(&mut self, _buffer: &[u8], _is_completed: bool) -> Result<ConsumePosition, ConduitError> {
    self.reached.store(true, std::sync::atomic::Ordering::SeqCst);
    panic!("consumer blew up");
  }
}

#[tokio::test]
async fn restart_fails_once_the_consumer_was_lost() -> anyhow::Result<()> {
  let runtime = common::test_runtime();
  let (connection, probe) = ScriptedConnection::new(vec![PAYLOAD.to_vec()], Ending::Hang);
  let reached = Arc::new(std::sync::atomic::AtomicBool::new(false));
  let pipe = runtime.duplex_pipe_with_consumer(
    connection,
    PanickingConsumer {
      reached: reached.clone(),
    },
  );

  pipe.start(&CancellationToken::new()).await?;
  eventually("consumer invocation", || reached.load(std::sync::atomic::Ordering::SeqCst)).await;

  assert!(matches!(pipe.stop().await, Err(ConduitError::Internal(_))));
  assert!(matches!(
    pipe.start(&CancellationToken::new()).await,
    Err(ConduitError::InvalidState(_))
  ));
  assert_eq!(pipe.state(), ActivityState::Stopped);
  assert!(pipe.take_reader().is_none());
  assert_eq!(probe.connects(), 1);
  Ok(())
}
