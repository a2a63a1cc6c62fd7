//! Pass-through stat writers
//!
//! Writers wrap writers: each variant forwards every operation to the inner
//! link writer and observes byte counts on the way through. The wrapping is
//! decided once per flow by the dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::common::{Buffer, MultiBuffer, Result};
use crate::session::TrafficSession;
use crate::transport::LinkWriter;

use super::metrics::Counter;

/// Counts uplink bytes on a traffic session. DNS queries (packets to UDP
/// port 53) additionally stamp `"<qtype>:<domain>"` into the session's
/// extra metadata; a packet that fails to parse is passed through untouched.
pub struct InboundSizeWriter {
    session: Arc<TrafficSession>,
    writer: Box<dyn LinkWriter>,
}

impl InboundSizeWriter {
    pub fn new(session: Arc<TrafficSession>, writer: Box<dyn LinkWriter>) -> Self {
        Self { session, writer }
    }
}

#[async_trait]
impl LinkWriter for InboundSizeWriter {
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        self.session.add_upload_bytes(mb.len() as i64);
        self.writer.write_multi_buffer(mb).await
    }

    async fn write_packet(&self, payload: Buffer, dest: SocketAddr) -> Result<()> {
        self.session.add_upload_bytes(payload.len() as i64);
        if dest.port() == 53 {
            if let Some((qtype, domain)) = parse_dns_query(payload.bytes()) {
                self.session.set_extra(format!("{}:{}", qtype, domain));
            }
        }
        self.writer.write_packet(payload, dest).await
    }

    fn close(&self) {
        self.writer.close();
    }

    fn interrupt(&self) {
        self.writer.interrupt();
    }
}

/// Counts downlink bytes on a traffic session
pub struct OutboundSizeWriter {
    session: Arc<TrafficSession>,
    writer: Box<dyn LinkWriter>,
}

impl OutboundSizeWriter {
    pub fn new(session: Arc<TrafficSession>, writer: Box<dyn LinkWriter>) -> Self {
        Self { session, writer }
    }
}

#[async_trait]
impl LinkWriter for OutboundSizeWriter {
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        self.session.add_download_bytes(mb.len() as i64);
        self.writer.write_multi_buffer(mb).await
    }

    async fn write_packet(&self, payload: Buffer, dest: SocketAddr) -> Result<()> {
        self.session.add_download_bytes(payload.len() as i64);
        self.writer.write_packet(payload, dest).await
    }

    fn close(&self) {
        self.writer.close();
    }

    fn interrupt(&self) {
        self.writer.interrupt();
    }
}

/// Adds byte counts to a named stats counter
pub struct SizeStatWriter {
    counter: Counter,
    writer: Box<dyn LinkWriter>,
}

impl SizeStatWriter {
    pub fn new(counter: Counter, writer: Box<dyn LinkWriter>) -> Self {
        Self { counter, writer }
    }
}

#[async_trait]
impl LinkWriter for SizeStatWriter {
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        self.counter.add(mb.len() as i64);
        self.writer.write_multi_buffer(mb).await
    }

    async fn write_packet(&self, payload: Buffer, dest: SocketAddr) -> Result<()> {
        self.counter.add(payload.len() as i64);
        self.writer.write_packet(payload, dest).await
    }

    fn close(&self) {
        self.writer.close();
    }

    fn interrupt(&self) {
        self.writer.interrupt();
    }
}

/// Extract `(qtype, domain)` from a raw DNS query message.
fn parse_dns_query(data: &[u8]) -> Option<(String, String)> {
    let message = Message::from_vec(data).ok()?;
    let query = message.queries().first()?;
    let domain = query.name().to_utf8();
    let domain = domain.strip_suffix('.').unwrap_or(&domain);
    Some((query.query_type().to_string(), domain.to_string()))
}
