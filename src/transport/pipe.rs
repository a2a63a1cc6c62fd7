//! In-memory pipe: the bounded, interruptible channel behind every link
//!
//! A pipe is a single-producer/single-consumer channel of either stream
//! bytes (`MultiBuffer`) or UDP datagrams, sharing one state object between
//! a reader handle and a writer handle. Writes respect a configurable size
//! limit with an explicit overflow policy; reads drain everything pending in
//! one call. Close keeps buffered data readable, interrupt drops it.
//!
//! The two `Notify` signals are edge-triggered and coalescing: waiters arm
//! interest before re-checking state under the lock, so a wakeup between
//! check and await is never lost and spurious wakeups are harmless. State
//! transitions broadcast on both signals, which is what unblocks every
//! waiter at close or interrupt time.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::common::{Buffer, Error, MultiBuffer, Result};
use crate::session::FlowState;
use crate::transport::{LinkReader, LinkWriter};

/// Capacity of the datagram queue
pub const PACKET_QUEUE_SIZE: usize = 16;

/// Pipe construction options
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// Maximum buffered stream bytes; negative means unbounded
    pub limit: i32,
    /// Drop over-limit writes instead of blocking
    pub discard_overflow: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl PipeOptions {
    pub fn unbounded() -> Self {
        Self {
            limit: -1,
            discard_overflow: false,
        }
    }

    pub fn with_size_limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    pub fn discarding_overflow(mut self) -> Self {
        self.discard_overflow = true;
        self
    }

    /// Options threaded through the per-flow context.
    pub fn from_flow(ctx: &FlowState) -> Self {
        ctx.pipe_options
    }

    fn is_full(&self, current: usize) -> bool {
        self.limit >= 0 && current as i64 > self.limit as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Closed,
    Errored,
}

struct PipeInner {
    data: MultiBuffer,
    packets: VecDeque<(Buffer, SocketAddr)>,
    status: Status,
}

struct PipeState {
    inner: Mutex<PipeInner>,
    read_signal: Notify,
    write_signal: Notify,
    option: PipeOptions,
}

enum WriteOutcome {
    Done,
    /// Merged past existing data; producer should yield so the consumer can
    /// drain before the next write lands.
    SlowDown,
    Full,
    Closed,
}

impl PipeState {
    fn try_read(&self) -> Result<Option<MultiBuffer>> {
        let mut inner = self.inner.lock();
        match inner.status {
            Status::Errored => Err(Error::ClosedPipe),
            Status::Closed if inner.data.is_empty() => Err(Error::EndOfStream),
            _ => {
                if inner.data.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(&mut inner.data)))
                }
            }
        }
    }

    fn try_read_packet(&self) -> Result<Option<(Buffer, SocketAddr)>> {
        let mut inner = self.inner.lock();
        match inner.status {
            Status::Errored => Err(Error::ClosedPipe),
            Status::Closed if inner.packets.is_empty() => Err(Error::EndOfStream),
            _ => Ok(inner.packets.pop_front()),
        }
    }

    /// Attempt a stream write. Takes the payload out of `pending` only when
    /// it is actually merged in; a full pipe leaves it for the retry.
    fn try_write(&self, pending: &mut Option<MultiBuffer>) -> WriteOutcome {
        let mut inner = self.inner.lock();
        if inner.status != Status::Open {
            return WriteOutcome::Closed;
        }
        if self.option.is_full(inner.data.len()) {
            return WriteOutcome::Full;
        }
        let mb = pending.take().expect("write retried after completion");
        if inner.data.is_empty() {
            inner.data = mb;
            WriteOutcome::Done
        } else {
            inner.data.append(mb);
            WriteOutcome::SlowDown
        }
    }

    fn try_write_packet(&self, pending: &mut Option<(Buffer, SocketAddr)>) -> WriteOutcome {
        let mut inner = self.inner.lock();
        if inner.status != Status::Open {
            return WriteOutcome::Closed;
        }
        if inner.packets.len() >= PACKET_QUEUE_SIZE {
            return WriteOutcome::Full;
        }
        let packet = pending.take().expect("write retried after completion");
        inner.packets.push_back(packet);
        WriteOutcome::Done
    }

    fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.status != Status::Open {
                return;
            }
            inner.status = Status::Closed;
        }
        self.read_signal.notify_waiters();
        self.write_signal.notify_waiters();
    }

    fn interrupt(&self) {
        {
            let mut inner = self.inner.lock();
            inner.data = MultiBuffer::new();
            inner.packets.clear();
            inner.status = Status::Errored;
        }
        self.read_signal.notify_waiters();
        self.write_signal.notify_waiters();
    }
}

/// Create a connected reader/writer pair over fresh pipe state.
pub fn new_pipe(option: PipeOptions) -> (PipeReader, PipeWriter) {
    let state = Arc::new(PipeState {
        inner: Mutex::new(PipeInner {
            data: MultiBuffer::new(),
            packets: VecDeque::new(),
            status: Status::Open,
        }),
        read_signal: Notify::new(),
        write_signal: Notify::new(),
        option,
    });
    (
        PipeReader {
            state: state.clone(),
        },
        PipeWriter { state },
    )
}

/// Reading endpoint of a pipe
#[derive(Clone)]
pub struct PipeReader {
    state: Arc<PipeState>,
}

impl PipeReader {
    pub async fn read_multi_buffer(&self) -> Result<MultiBuffer> {
        loop {
            let notified = self.state.read_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.try_read() {
                Ok(Some(mb)) => {
                    self.state.write_signal.notify_waiters();
                    return Ok(mb);
                }
                Ok(None) => {}
                Err(e) => {
                    self.state.write_signal.notify_waiters();
                    return Err(e);
                }
            }
            notified.await;
        }
    }

    pub async fn read_multi_buffer_timeout(&self, timeout: Duration) -> Result<MultiBuffer> {
        match tokio::time::timeout(timeout, self.read_multi_buffer()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ReadTimeout),
        }
    }

    pub async fn read_packet(&self) -> Result<(Buffer, SocketAddr)> {
        loop {
            let notified = self.state.read_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.try_read_packet() {
                Ok(Some(packet)) => {
                    self.state.write_signal.notify_waiters();
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.state.close();
    }

    pub fn interrupt(&self) {
        self.state.interrupt();
    }
}

/// Writing endpoint of a pipe
#[derive(Clone)]
pub struct PipeWriter {
    state: Arc<PipeState>,
}

impl PipeWriter {
    pub async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        if mb.is_empty() {
            return Ok(());
        }
        let mut pending = Some(mb);
        loop {
            let notified = self.state.write_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.try_write(&mut pending) {
                WriteOutcome::Done => {
                    self.state.read_signal.notify_waiters();
                    return Ok(());
                }
                WriteOutcome::SlowDown => {
                    self.state.read_signal.notify_waiters();
                    // Give the co-scheduled reader a chance to drain before
                    // the producer queues more.
                    tokio::task::yield_now().await;
                    return Ok(());
                }
                WriteOutcome::Full => {
                    if self.state.option.discard_overflow {
                        return Ok(());
                    }
                }
                WriteOutcome::Closed => {
                    self.state.read_signal.notify_waiters();
                    return Err(Error::ClosedPipe);
                }
            }
            notified.await;
        }
    }

    pub async fn write_packet(&self, payload: Buffer, dest: SocketAddr) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let mut pending = Some((payload, dest));
        loop {
            let notified = self.state.write_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.try_write_packet(&mut pending) {
                WriteOutcome::Done => {
                    self.state.read_signal.notify_waiters();
                    return Ok(());
                }
                WriteOutcome::Full => {
                    if self.state.option.discard_overflow {
                        return Ok(());
                    }
                }
                WriteOutcome::Closed => return Err(Error::ClosedPipe),
                WriteOutcome::SlowDown => unreachable!("packet writes never merge"),
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.state.close();
    }

    pub fn interrupt(&self) {
        self.state.interrupt();
    }
}

#[async_trait]
impl LinkReader for PipeReader {
    async fn read_multi_buffer(&self) -> Result<MultiBuffer> {
        PipeReader::read_multi_buffer(self).await
    }

    async fn read_multi_buffer_timeout(&self, timeout: Duration) -> Result<MultiBuffer> {
        PipeReader::read_multi_buffer_timeout(self, timeout).await
    }

    async fn read_packet(&self) -> Result<(Buffer, SocketAddr)> {
        PipeReader::read_packet(self).await
    }

    fn close(&self) {
        PipeReader::close(self);
    }

    fn interrupt(&self) {
        PipeReader::interrupt(self);
    }
}

#[async_trait]
impl LinkWriter for PipeWriter {
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        PipeWriter::write_multi_buffer(self, mb).await
    }

    async fn write_packet(&self, payload: Buffer, dest: SocketAddr) -> Result<()> {
        PipeWriter::write_packet(self, payload, dest).await
    }

    fn close(&self) {
        PipeWriter::close(self);
    }

    fn interrupt(&self) {
        PipeWriter::interrupt(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BUFFER_SIZE;

    #[tokio::test]
    async fn test_write_then_read_preserves_order() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded());

        writer.write_multi_buffer(MultiBuffer::from(&b"hello "[..])).await.unwrap();
        writer.write_multi_buffer(MultiBuffer::from(&b"world"[..])).await.unwrap();

        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(mb.to_vec(), b"hello world");
    }

    #[tokio::test]
    async fn test_read_blocks_until_write() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded());

        let read = tokio::spawn(async move { reader.read_multi_buffer().await });
        tokio::task::yield_now().await;
        writer.write_multi_buffer(MultiBuffer::from(&b"late"[..])).await.unwrap();

        let mb = read.await.unwrap().unwrap();
        assert_eq!(mb.to_vec(), b"late");
    }

    #[tokio::test]
    async fn test_backpressure_bounds_memory() {
        const LIMIT: usize = 32 * 1024;
        const TOTAL: usize = 100 * 1024;
        const CHUNK: usize = 4 * 1024;

        let (reader, writer) = new_pipe(PipeOptions::unbounded().with_size_limit(LIMIT as i32));

        let producer = tokio::spawn(async move {
            let payload = vec![0xABu8; CHUNK];
            for _ in 0..(TOTAL / CHUNK) {
                writer.write_multi_buffer(MultiBuffer::from(payload.as_slice())).await.unwrap();
            }
            writer.close();
        });

        let mut received = 0usize;
        loop {
            match reader.read_multi_buffer().await {
                Ok(mb) => {
                    // In-flight data never exceeds limit + one chunk.
                    assert!(mb.len() <= LIMIT + CHUNK);
                    received += mb.len();
                }
                Err(Error::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(received, TOTAL);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_overshooting_write_is_accepted() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded().with_size_limit(16));

        // One write far past the limit still lands in full.
        let big = vec![1u8; BUFFER_SIZE + 64];
        writer.write_multi_buffer(MultiBuffer::from(big.as_slice())).await.unwrap();
        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(mb.len(), big.len());
    }

    #[tokio::test]
    async fn test_discard_overflow_never_blocks() {
        let (reader, writer) = new_pipe(
            PipeOptions::unbounded().with_size_limit(8).discarding_overflow(),
        );

        writer.write_multi_buffer(MultiBuffer::from(&b"0123456789"[..])).await.unwrap();
        // Over the limit now; with no reader draining, these must not block.
        for _ in 0..100 {
            writer.write_multi_buffer(MultiBuffer::from(&b"dropped"[..])).await.unwrap();
        }

        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(mb.to_vec(), b"0123456789");
    }

    #[tokio::test]
    async fn test_close_drains_then_eof() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded());
        writer.write_multi_buffer(MultiBuffer::from(&b"tail"[..])).await.unwrap();
        writer.close();

        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(mb.to_vec(), b"tail");
        assert!(matches!(
            reader.read_multi_buffer().await,
            Err(Error::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (_reader, writer) = new_pipe(PipeOptions::unbounded());
        writer.close();
        assert!(matches!(
            writer.write_multi_buffer(MultiBuffer::from(&b"x"[..])).await,
            Err(Error::ClosedPipe)
        ));
    }

    #[tokio::test]
    async fn test_interrupt_rejects_both_sides() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded());
        writer.write_multi_buffer(MultiBuffer::from(&b"doomed"[..])).await.unwrap();
        reader.interrupt();

        assert!(matches!(
            reader.read_multi_buffer().await,
            Err(Error::ClosedPipe)
        ));
        assert!(matches!(
            writer.write_multi_buffer(MultiBuffer::from(&b"x"[..])).await,
            Err(Error::ClosedPipe)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_interrupt_upgrades() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded());
        writer.close();
        writer.close();
        assert!(matches!(
            reader.read_multi_buffer().await,
            Err(Error::EndOfStream)
        ));

        // Interrupting an already-closed pipe still transitions to errored.
        writer.interrupt();
        assert!(matches!(
            reader.read_multi_buffer().await,
            Err(Error::ClosedPipe)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded());
        let read = tokio::spawn(async move { reader.read_multi_buffer().await });
        tokio::task::yield_now().await;
        writer.close();
        assert!(matches!(read.await.unwrap(), Err(Error::EndOfStream)));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (reader, _writer) = new_pipe(PipeOptions::unbounded());
        let result = reader
            .read_multi_buffer_timeout(Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::ReadTimeout)));

        // A timeout does not alter pipe state; a later write still arrives.
        _writer.write_multi_buffer(MultiBuffer::from(&b"ok"[..])).await.unwrap();
        let mb = reader.read_multi_buffer().await.unwrap();
        assert_eq!(mb.to_vec(), b"ok");
    }

    #[tokio::test]
    async fn test_packet_roundtrip() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded());
        let addr: SocketAddr = "8.8.8.8:53".parse().unwrap();

        writer.write_packet(Buffer::from_bytes(b"query"), addr).await.unwrap();
        let (payload, from) = reader.read_packet().await.unwrap();
        assert_eq!(payload.bytes(), b"query");
        assert_eq!(from, addr);
    }

    #[tokio::test]
    async fn test_packet_overflow_discards() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded().discarding_overflow());
        let addr: SocketAddr = "8.8.8.8:53".parse().unwrap();

        for i in 0..(PACKET_QUEUE_SIZE + 4) {
            let payload = Buffer::from_bytes(&[i as u8]);
            writer.write_packet(payload, addr).await.unwrap();
        }

        let mut seen = 0;
        while let Ok(Some(_)) = reader.state.try_read_packet() {
            seen += 1;
        }
        assert_eq!(seen, PACKET_QUEUE_SIZE);
    }

    #[tokio::test]
    async fn test_packet_queue_closed_drains_then_eof() {
        let (reader, writer) = new_pipe(PipeOptions::unbounded());
        let addr: SocketAddr = "1.1.1.1:53".parse().unwrap();
        writer.write_packet(Buffer::from_bytes(b"a"), addr).await.unwrap();
        writer.close();

        assert!(reader.read_packet().await.is_ok());
        assert!(matches!(reader.read_packet().await, Err(Error::EndOfStream)));
    }
}
