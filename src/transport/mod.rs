//! Transport layer: links, pipes and the UDP session multiplexer
//!
//! A `Link` is one direction of a flow: a matched (reader, writer) pair
//! whose endpoints share a single pipe state. Links always come in pairs
//! (the uplink carries client-to-remote bytes, the downlink the reverse),
//! and the dispatcher hands one side to the inbound proxy and the other to
//! the selected outbound handler.

pub mod conn;
pub mod pipe;
pub mod udp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Buffer, MultiBuffer, Result};

/// Reading end of a link
#[async_trait]
pub trait LinkReader: Send + Sync {
    /// Take all currently buffered stream bytes, waiting if none are
    /// pending. Returns `Error::EndOfStream` once the pipe is closed and
    /// drained, `Error::ClosedPipe` after an interrupt.
    async fn read_multi_buffer(&self) -> Result<MultiBuffer>;

    /// As `read_multi_buffer`, but gives up with `Error::ReadTimeout` after
    /// `timeout`.
    async fn read_multi_buffer_timeout(&self, timeout: Duration) -> Result<MultiBuffer>;

    /// Dequeue one datagram.
    async fn read_packet(&self) -> Result<(Buffer, SocketAddr)>;

    /// Close the shared pipe; buffered data remains readable.
    fn close(&self);

    /// Abort the shared pipe, dropping buffered data.
    fn interrupt(&self);
}

/// Writing end of a link
#[async_trait]
pub trait LinkWriter: Send + Sync {
    /// Append stream bytes, honoring the pipe's size limit and overflow
    /// policy.
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()>;

    /// Enqueue one datagram addressed to `dest`.
    async fn write_packet(&self, payload: Buffer, dest: SocketAddr) -> Result<()>;

    /// Close the shared pipe; buffered data remains readable.
    fn close(&self);

    /// Abort the shared pipe, dropping buffered data.
    fn interrupt(&self);
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique link id. Links are keyed by id in the session
/// tracker; the id of a pair's outbound side identifies the flow.
pub fn alloc_link_id() -> u64 {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// One direction of a flow between an inbound and an outbound handler
pub struct Link {
    pub id: u64,
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

impl Link {
    pub fn new(reader: Box<dyn LinkReader>, writer: Box<dyn LinkWriter>) -> Self {
        Self::with_id(alloc_link_id(), reader, writer)
    }

    pub fn with_id(id: u64, reader: Box<dyn LinkReader>, writer: Box<dyn LinkWriter>) -> Self {
        Self { id, reader, writer }
    }

    /// Tear the link down hard: no more writes land, buffered reads are
    /// dropped.
    pub fn shutdown(&self) {
        self.writer.close();
        self.reader.interrupt();
    }
}
