//! Dispatcher - Core Execution Flow
//!
//! The dispatcher is the heart of the engine. Per flow it builds a pipe
//! pair, attaches stat-counting writers, optionally sniffs the first bytes
//! to reclassify the destination, asks the router for a route and hands the
//! outbound side to the selected handler:
//!
//! ```text
//! inbound proxy → dispatch(dest) → [sniff] → route → handler.dispatch
//! ```
//!
//! The inbound side of the link pair returns to the caller synchronously;
//! routing and the handler run on their own task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{Address, Buffer, Destination, Error, MultiBuffer, Network, Result};
use crate::outbound::{OutboundHandler, OutboundManager};
use crate::router::{Router, RoutingDispatcher};
use crate::session::{FlowState, Outbound, ProxyLogSink, SessionTracker, TrafficSession};
use crate::sniff::{SniffResult, SniffVerdict, Sniffer};
use crate::transport::pipe::{new_pipe, PipeOptions, PipeReader};
use crate::transport::{alloc_link_id, Link, LinkReader, LinkWriter};

use super::metrics::{
    MetricsStats, StatsManager, DISPATCH_FLOWS_ACTIVE, DISPATCH_FLOWS_TOTAL,
    HANDLER_MISSING_TOTAL, SNIFF_OVERRIDES_TOTAL,
};
use super::policy::{PolicyManager, StaticPolicy};
use super::stats::{InboundSizeWriter, OutboundSizeWriter, SizeStatWriter};

/// Uplink buffer bound for TCP flows (32KB)
const TCP_UPLINK_LIMIT: i32 = 32 * 1024;

/// Reader wrapper that lets the sniffer peek at stream bytes without
/// consuming them: peeked bytes are retained in a cache and replayed on the
/// first ordinary read, so the downstream handler sees an unmodified
/// stream.
pub struct CachedReader {
    reader: PipeReader,
    cache: Mutex<MultiBuffer>,
}

impl CachedReader {
    pub fn new(reader: PipeReader) -> Self {
        Self {
            reader,
            cache: Mutex::new(MultiBuffer::new()),
        }
    }

    /// Pull whatever arrives within `timeout` into the cache, then copy up
    /// to one buffer of cached bytes into `scratch` for inspection.
    pub async fn cache(&self, scratch: &mut Buffer, timeout: Duration) {
        if let Ok(mb) = self.reader.read_multi_buffer_timeout(timeout).await {
            self.cache.lock().append(mb);
        }
        scratch.fill_from(&self.cache.lock());
    }

    fn take_cached(&self) -> Option<MultiBuffer> {
        let mut cache = self.cache.lock();
        if cache.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *cache))
        }
    }
}

#[async_trait]
impl LinkReader for CachedReader {
    async fn read_multi_buffer(&self) -> Result<MultiBuffer> {
        match self.take_cached() {
            Some(mb) => Ok(mb),
            None => self.reader.read_multi_buffer().await,
        }
    }

    async fn read_multi_buffer_timeout(&self, timeout: Duration) -> Result<MultiBuffer> {
        match self.take_cached() {
            Some(mb) => Ok(mb),
            None => self.reader.read_multi_buffer_timeout(timeout).await,
        }
    }

    async fn read_packet(&self) -> Result<(Buffer, std::net::SocketAddr)> {
        // Cached readers only wrap TCP-style flows.
        Err(Error::EndOfStream)
    }

    fn close(&self) {
        self.reader.close();
    }

    fn interrupt(&self) {
        *self.cache.lock() = MultiBuffer::new();
        self.reader.interrupt();
    }
}

/// Everything a routing task needs after `dispatch` returns
struct RouteEnv {
    outbounds: Arc<dyn OutboundManager>,
    router: Option<Arc<dyn Router>>,
    tracker: Arc<SessionTracker>,
    record_sink: Option<Arc<ProxyLogSink>>,
}

/// Dispatcher wires inbound flows to outbound handlers.
pub struct Dispatcher {
    outbounds: Arc<dyn OutboundManager>,
    router: Option<Arc<dyn Router>>,
    policy: Arc<dyn PolicyManager>,
    stats: Arc<dyn StatsManager>,
    tracker: Arc<SessionTracker>,
    record_sink: Option<Arc<ProxyLogSink>>,
}

impl Dispatcher {
    pub fn new(outbounds: Arc<dyn OutboundManager>) -> Self {
        Self {
            outbounds,
            router: None,
            policy: Arc::new(StaticPolicy::default()),
            stats: Arc::new(MetricsStats::new()),
            tracker: Arc::new(SessionTracker::new()),
            record_sink: None,
        }
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyManager>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsManager>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_record_sink(mut self, sink: Arc<ProxyLogSink>) -> Self {
        self.record_sink = Some(sink);
        self
    }

    pub fn start(&self) {
        self.tracker.start();
    }

    pub fn close(&self) {
        self.tracker.stop();
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    fn route_env(&self) -> RouteEnv {
        RouteEnv {
            outbounds: self.outbounds.clone(),
            router: self.router.clone(),
            tracker: self.tracker.clone(),
            record_sink: self.record_sink.clone(),
        }
    }

    /// Dispatch a new flow towards `destination`.
    ///
    /// Returns the inbound side of a fresh link pair synchronously; routing
    /// and the selected handler run asynchronously on the outbound side.
    /// Passing an invalid destination is a programmer error.
    pub async fn dispatch(&self, mut ctx: FlowState, destination: Destination) -> Result<Link> {
        assert!(
            destination.is_valid(),
            "dispatcher: invalid destination {}",
            destination
        );

        DISPATCH_FLOWS_TOTAL.inc();
        DISPATCH_FLOWS_ACTIVE.inc();

        match ctx.outbound.as_mut() {
            Some(outbound) => outbound.target = destination.clone(),
            None => ctx.outbound = Some(Outbound::new(destination.clone())),
        }

        let opt = PipeOptions::from_flow(&ctx);
        let (uplink_reader, uplink_writer, downlink_reader, downlink_writer) =
            if destination.network == Network::Udp {
                // Dropping a datagram beats back-pressuring its source.
                let (ur, uw) = new_pipe(opt.discarding_overflow());
                let (dr, dw) = new_pipe(opt);
                (ur, uw, dr, dw)
            } else {
                let (ur, uw) = new_pipe(opt.with_size_limit(TCP_UPLINK_LIMIT));
                let (dr, dw) = new_pipe(opt);
                (ur, uw, dr, dw)
            };

        let outbound_id = alloc_link_id();
        let mut inbound_writer: Box<dyn LinkWriter> = Box::new(uplink_writer);
        let mut outbound_writer: Box<dyn LinkWriter> = Box::new(downlink_writer);

        if let Some(content) = ctx.content.as_ref() {
            let session = Arc::new(TrafficSession::from_content(content));
            self.tracker.add_session(outbound_id, session.clone());
            inbound_writer = Box::new(InboundSizeWriter::new(session.clone(), inbound_writer));
            outbound_writer = Box::new(OutboundSizeWriter::new(session.clone(), outbound_writer));
            ctx.traffic = Some(session);
        }

        if let Some(user) = ctx.inbound.as_ref().and_then(|i| i.user.clone()) {
            if !user.email.is_empty() {
                let policy = self.policy.for_level(user.level);
                if policy.stats.user_uplink {
                    let name = format!("user>>>{}>>>traffic>>>uplink", user.email);
                    let counter = self.stats.get_or_register_counter(&name);
                    inbound_writer = Box::new(SizeStatWriter::new(counter, inbound_writer));
                }
                if policy.stats.user_downlink {
                    let name = format!("user>>>{}>>>traffic>>>downlink", user.email);
                    let counter = self.stats.get_or_register_counter(&name);
                    outbound_writer = Box::new(SizeStatWriter::new(counter, outbound_writer));
                }
            }
        }

        let inbound_link = Link::new(Box::new(downlink_reader), inbound_writer);

        if ctx.content.is_none() {
            ctx.content = Some(Default::default());
        }
        let sniffing_enabled = ctx
            .content
            .as_ref()
            .map(|c| c.sniffing.enabled)
            .unwrap_or(false);

        let env = self.route_env();
        if destination.network != Network::Tcp || !sniffing_enabled {
            let link = Link::with_id(outbound_id, Box::new(uplink_reader), outbound_writer);
            tokio::spawn(routed_dispatch(env, ctx, link, destination));
        } else {
            tokio::spawn(async move {
                let cached = CachedReader::new(uplink_reader);
                let mut destination = destination;
                match sniff(&cached).await {
                    Ok(result) => {
                        let content = ctx.content.as_mut().expect("content installed above");
                        content.protocol = result.protocol.clone();
                        let do_override = should_override(
                            &result,
                            &content.sniffing.override_destination_for_protocol,
                        );
                        if do_override && !result.domain.is_empty() {
                            debug!("sniffed domain: {}", result.domain);
                            SNIFF_OVERRIDES_TOTAL.inc();
                            destination.address = Address::parse(&result.domain);
                            if let Some(outbound) = ctx.outbound.as_mut() {
                                outbound.target = destination.clone();
                            }
                            if let Some(record) = ctx.record.as_ref() {
                                record.set_target(destination.to_string());
                            }
                            if let Some(session) = ctx.traffic.as_ref() {
                                session.set_remote_addr(destination.net_addr());
                            }
                        }
                    }
                    Err(e) => debug!("sniffing ended without a verdict: {}", e),
                }
                let link = Link::with_id(outbound_id, Box::new(cached), outbound_writer);
                routed_dispatch(env, ctx, link, destination).await;
            });
        }

        Ok(inbound_link)
    }
}

#[async_trait]
impl RoutingDispatcher for Dispatcher {
    async fn dispatch(&self, ctx: FlowState, destination: Destination) -> Result<Link> {
        Dispatcher::dispatch(self, ctx, destination).await
    }
}

fn should_override(result: &SniffResult, domain_override: &[String]) -> bool {
    domain_override
        .iter()
        .any(|prefix| result.protocol.starts_with(prefix.as_str()))
}

/// Iterative sniff with a bounded attempt budget: one patient read, one
/// quick follow-up, then give up. Failure only means the destination
/// override is skipped; dispatch always continues.
async fn sniff(reader: &CachedReader) -> Result<SniffResult> {
    let mut payload = Buffer::new();
    let mut sniffer = Sniffer::new();

    for attempt in 1..=2u32 {
        let timeout = if attempt == 1 {
            Duration::from_millis(300)
        } else {
            Duration::from_millis(5)
        };
        reader.cache(&mut payload, timeout).await;
        if !payload.is_empty() {
            match sniffer.sniff(payload.bytes()) {
                SniffVerdict::Ready(result) => return Ok(result),
                SniffVerdict::NeedMore => {}
                SniffVerdict::Failed => return Err(Error::UnknownContent),
            }
        }
        if payload.is_full() {
            return Err(Error::UnknownContent);
        }
    }
    Err(Error::SniffingTimeout)
}

async fn routed_dispatch(env: RouteEnv, mut ctx: FlowState, link: Link, destination: Destination) {
    let mut handler: Option<Arc<dyn OutboundHandler>> = None;
    if let Some(router) = env.router.as_ref() {
        match router.pick_route(&ctx) {
            Ok(tag) => {
                if let Some(found) = env.outbounds.get_handler(&tag) {
                    debug!("taking detour [{}] for [{}]", tag, destination);
                    handler = Some(found);
                } else {
                    warn!("non existing tag: {}", tag);
                }
            }
            Err(e) => debug!("default route for {}: {}", destination, e),
        }
    }

    let handler = match handler.or_else(|| env.outbounds.get_default_handler()) {
        Some(handler) => handler,
        None => {
            warn!("{}", Error::HandlerMissing(destination.to_string()));
            HANDLER_MISSING_TOTAL.inc();
            link.shutdown();
            env.tracker.remove_session(link.id);
            DISPATCH_FLOWS_ACTIVE.dec();
            return;
        }
    };

    if let Some(record) = ctx.record.as_ref() {
        record.set_tag(handler.tag());
    }
    if let Some(session) = ctx.traffic.as_ref() {
        session.set_outbound_tag(handler.tag());
    }
    if let Some(access) = ctx.access.as_mut() {
        access.outbound_tag = handler.tag().to_string();
        access.emit();
    }

    let link_id = link.id;
    handler.dispatch(&mut ctx, link).await;

    env.tracker.remove_session(link_id);
    DISPATCH_FLOWS_ACTIVE.dec();
    if let (Some(sink), Some(record)) = (env.record_sink.as_ref(), ctx.record.as_ref()) {
        sink.insert(record);
    }
}
