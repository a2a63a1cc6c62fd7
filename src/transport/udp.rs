//! UDP session multiplexer
//!
//! UDP is stateless on the wire but flows through the same link abstraction
//! as TCP. The mux groups datagrams by their inbound source address: the
//! first packet from a new source dispatches a link through the routing
//! dispatcher, later packets reuse it, and an inactivity timer tears the
//! entry down. A background task per entry pumps response packets from the
//! link into the response callback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::common::{ActivityTimer, Buffer, Destination, Done, Error, Network, Result};
use crate::router::RoutingDispatcher;
use crate::session::FlowState;
use crate::transport::{LinkReader, LinkWriter};

/// Default inactivity timeout for mux entries
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// A datagram delivered back to the inbound side
pub struct UdpPacket {
    pub payload: Buffer,
    pub source: Destination,
}

/// Invoked for every response packet read from an entry's link
pub type ResponseCallback = Arc<dyn Fn(&FlowState, UdpPacket) + Send + Sync>;

struct ConnEntry {
    reader: Arc<dyn LinkReader>,
    writer: Arc<dyn LinkWriter>,
    timer: ActivityTimer,
    cancel: Arc<Done>,
}

struct MuxInner {
    conns: RwLock<HashMap<Destination, Arc<ConnEntry>>>,
    /// Serializes entry creation so one source never dispatches two links.
    create_lock: tokio::sync::Mutex<()>,
    dispatcher: Arc<dyn RoutingDispatcher>,
    callback: ResponseCallback,
    idle_timeout: Duration,
}

impl MuxInner {
    fn remove_entry(&self, key: &Destination) {
        let entry = self.conns.write().remove(key);
        if let Some(entry) = entry {
            debug!("removing UDP session for {}", key);
            entry.cancel.close();
            entry.timer.stop();
            entry.reader.close();
            entry.writer.close();
        }
    }
}

/// Per-source UDP session table over a routing dispatcher
pub struct UdpMux {
    inner: Arc<MuxInner>,
}

impl UdpMux {
    pub fn new(dispatcher: Arc<dyn RoutingDispatcher>, callback: ResponseCallback) -> Self {
        Self::with_idle_timeout(dispatcher, callback, DEFAULT_IDLE_TIMEOUT)
    }

    /// As `new` with a custom inactivity timeout; `Outbound::timeout` on a
    /// flow still takes precedence per entry.
    pub fn with_idle_timeout(
        dispatcher: Arc<dyn RoutingDispatcher>,
        callback: ResponseCallback,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                conns: RwLock::new(HashMap::new()),
                create_lock: tokio::sync::Mutex::new(()),
                dispatcher,
                callback,
                idle_timeout,
            }),
        }
    }

    /// Route one datagram. Looks up or creates the entry for the packet's
    /// source and writes the payload to its link.
    pub async fn dispatch(&self, ctx: &FlowState, destination: Destination, payload: Buffer) {
        let Some(inbound) = ctx.inbound.as_ref() else {
            warn!("inbound not found");
            return;
        };

        let mut ctx = ctx.clone();
        if let Some(content) = ctx.content.as_mut() {
            content.remote_addr = destination.net_addr();
        }

        let key = if inbound.no_source {
            Destination::udp_any()
        } else {
            inbound.source.clone()
        };

        let entry = match self.entry_for(&ctx, key.clone(), &destination).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("failed to establish UDP session to {}: {}", destination, e);
                return;
            }
        };

        let dest_addr = destination
            .udp_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        if let Err(e) = entry.writer.write_packet(payload, dest_addr).await {
            debug!("failed to write UDP payload: {}", e);
            self.inner.remove_entry(&key);
        }
    }

    /// Drop the entry for `src`, closing both link endpoints.
    pub fn remove(&self, src: &Destination) {
        self.inner.remove_entry(src);
    }

    pub fn entry_count(&self) -> usize {
        self.inner.conns.read().len()
    }

    async fn entry_for(
        &self,
        ctx: &FlowState,
        key: Destination,
        dest: &Destination,
    ) -> Result<Arc<ConnEntry>> {
        if let Some(entry) = self.inner.conns.read().get(&key) {
            return Ok(entry.clone());
        }

        let _creating = self.inner.create_lock.lock().await;
        if let Some(entry) = self.inner.conns.read().get(&key) {
            return Ok(entry.clone());
        }

        debug!("establishing new connection from {} to {}", key, dest);

        let timeout = ctx
            .outbound
            .as_ref()
            .and_then(|o| o.timeout)
            .unwrap_or(self.inner.idle_timeout);

        let link = self.inner.dispatcher.dispatch(ctx.clone(), dest.clone()).await?;
        let reader: Arc<dyn LinkReader> = Arc::from(link.reader);
        let writer: Arc<dyn LinkWriter> = Arc::from(link.writer);

        let weak = Arc::downgrade(&self.inner);
        let timer_key = key.clone();
        let timer = ActivityTimer::new(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_entry(&timer_key);
            }
        });

        let entry = Arc::new(ConnEntry {
            reader,
            writer,
            timer,
            cancel: Arc::new(Done::new()),
        });
        self.inner.conns.write().insert(key.clone(), entry.clone());

        tokio::spawn(handle_input(
            Arc::downgrade(&self.inner),
            key,
            entry.clone(),
            ctx.clone(),
            dest.clone(),
        ));

        Ok(entry)
    }
}

/// Pump response packets from an entry's link into the callback until the
/// link ends or the entry is cancelled. Holds only a weak mux reference so
/// entry teardown never races with mux drop.
async fn handle_input(
    inner: Weak<MuxInner>,
    key: Destination,
    entry: Arc<ConnEntry>,
    ctx: FlowState,
    orig_dest: Destination,
) {
    let callback = match inner.upgrade() {
        Some(m) => m.callback.clone(),
        None => return,
    };

    loop {
        let result = tokio::select! {
            _ = entry.cancel.wait() => break,
            r = entry.reader.read_packet() => r,
        };
        match result {
            Ok((payload, addr)) => {
                entry.timer.update();
                // An unspecified source means the handler did not know one;
                // attribute the packet to the original destination.
                let source = if addr.ip().is_unspecified() && addr.port() == 0 {
                    orig_dest.clone()
                } else {
                    Destination::from_socket_addr(Network::Udp, addr)
                };
                callback(&ctx, UdpPacket { payload, source });
            }
            Err(e) => {
                if !e.is_end_of_stream() {
                    debug!("failed to handle UDP input: {}", e);
                }
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.remove_entry(&key);
    }
}

/// Packet-conn adapter over a mux: buffers inbound packets on a bounded
/// channel (overflow drops), sends outbound payloads through `dispatch`.
pub struct MuxConn {
    mux: UdpMux,
    rx: mpsc::Receiver<UdpPacket>,
    done: Arc<Done>,
    ctx: FlowState,
}

impl MuxConn {
    pub fn new(dispatcher: Arc<dyn RoutingDispatcher>, ctx: FlowState) -> Self {
        let (tx, rx) = mpsc::channel(super::pipe::PACKET_QUEUE_SIZE);
        let done = Arc::new(Done::new());

        let cb_done = done.clone();
        let callback: ResponseCallback = Arc::new(move |_ctx, packet| {
            if cb_done.is_closed() {
                return;
            }
            // A full channel drops the packet.
            let _ = tx.try_send(packet);
        });

        Self {
            mux: UdpMux::new(dispatcher, callback),
            rx,
            done,
            ctx,
        }
    }

    pub async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, Destination)> {
        tokio::select! {
            _ = self.done.wait() => Err(Error::EndOfStream),
            packet = self.rx.recv() => match packet {
                Some(packet) => {
                    let n = packet.payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet.payload.bytes()[..n]);
                    Ok((n, packet.source))
                }
                None => Err(Error::EndOfStream),
            },
        }
    }

    pub async fn send_to(&self, payload: &[u8], dest: Destination) -> Result<usize> {
        let buffer = Buffer::from_bytes(payload);
        let n = buffer.len();
        self.mux.dispatch(&self.ctx, dest, buffer).await;
        Ok(n)
    }

    pub fn close(&self) {
        self.done.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Inbound;
    use crate::transport::pipe::{new_pipe, PipeOptions};
    use crate::transport::Link;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Dispatcher standing in for the routing core: every link it hands out
    /// echoes received packets back, payload reversed.
    #[derive(Default)]
    struct EchoDispatcher {
        dispatched: Mutex<usize>,
    }

    #[async_trait]
    impl RoutingDispatcher for EchoDispatcher {
        async fn dispatch(&self, _ctx: FlowState, destination: Destination) -> Result<Link> {
            *self.dispatched.lock() += 1;

            let (up_r, up_w) = new_pipe(PipeOptions::unbounded().discarding_overflow());
            let (down_r, down_w) = new_pipe(PipeOptions::unbounded());

            let dest_addr = destination.udp_addr().unwrap();
            tokio::spawn(async move {
                while let Ok((payload, _addr)) = up_r.read_packet().await {
                    let mut reversed: Vec<u8> = payload.bytes().to_vec();
                    reversed.reverse();
                    if down_w
                        .write_packet(Buffer::from_bytes(&reversed), dest_addr)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                down_w.close();
            });

            Ok(Link::new(Box::new(down_r), Box::new(up_w)))
        }
    }

    fn udp_ctx(source_port: u16) -> FlowState {
        let source = Destination::udp("10.0.0.9", source_port);
        FlowState::new().with_inbound(Inbound::new(source, "udp-in"))
    }

    fn collecting_callback() -> (ResponseCallback, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ResponseCallback = Arc::new(move |_ctx, packet| {
            sink.lock().push(packet.payload.bytes().to_vec());
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn test_dispatch_creates_one_entry_per_source() {
        let dispatcher = Arc::new(EchoDispatcher::default());
        let (callback, _seen) = collecting_callback();
        let mux = UdpMux::new(dispatcher.clone(), callback);

        let ctx = udp_ctx(5000);
        let dest = Destination::udp("1.2.3.4", 53);
        mux.dispatch(&ctx, dest.clone(), Buffer::from_bytes(b"one")).await;
        mux.dispatch(&ctx, dest.clone(), Buffer::from_bytes(b"two")).await;

        assert_eq!(mux.entry_count(), 1);
        assert_eq!(*dispatcher.dispatched.lock(), 1);

        // A different source gets its own entry.
        mux.dispatch(&udp_ctx(5001), dest, Buffer::from_bytes(b"three")).await;
        assert_eq!(mux.entry_count(), 2);
        assert_eq!(*dispatcher.dispatched.lock(), 2);
    }

    #[tokio::test]
    async fn test_responses_reach_callback() {
        let dispatcher = Arc::new(EchoDispatcher::default());
        let (callback, seen) = collecting_callback();
        let mux = UdpMux::new(dispatcher, callback);

        mux.dispatch(
            &udp_ctx(6000),
            Destination::udp("1.2.3.4", 53),
            Buffer::from_bytes(b"abc"),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], b"cba");
    }

    #[tokio::test]
    async fn test_idle_expiry_removes_entry() {
        let dispatcher = Arc::new(EchoDispatcher::default());
        let (callback, _seen) = collecting_callback();
        let mux = UdpMux::with_idle_timeout(
            dispatcher.clone(),
            callback,
            Duration::from_millis(60),
        );

        let ctx = udp_ctx(7000);
        let dest = Destination::udp("1.2.3.4", 53);
        mux.dispatch(&ctx, dest.clone(), Buffer::from_bytes(b"ping")).await;
        assert_eq!(mux.entry_count(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(mux.entry_count(), 0);

        // A fresh datagram re-establishes the session.
        mux.dispatch(&ctx, dest, Buffer::from_bytes(b"ping")).await;
        assert_eq!(mux.entry_count(), 1);
        assert_eq!(*dispatcher.dispatched.lock(), 2);
    }

    #[tokio::test]
    async fn test_no_source_shares_one_entry() {
        let dispatcher = Arc::new(EchoDispatcher::default());
        let (callback, _seen) = collecting_callback();
        let mux = UdpMux::new(dispatcher.clone(), callback);

        let dest = Destination::udp("1.2.3.4", 53);
        for port in [8000u16, 8001, 8002] {
            let mut ctx = udp_ctx(port);
            ctx.inbound.as_mut().unwrap().no_source = true;
            mux.dispatch(&ctx, dest.clone(), Buffer::from_bytes(b"x")).await;
        }

        assert_eq!(mux.entry_count(), 1);
        assert_eq!(*dispatcher.dispatched.lock(), 1);
    }

    #[tokio::test]
    async fn test_remove_closes_endpoints() {
        let dispatcher = Arc::new(EchoDispatcher::default());
        let (callback, seen) = collecting_callback();
        let mux = UdpMux::new(dispatcher, callback);

        let ctx = udp_ctx(9000);
        let dest = Destination::udp("1.2.3.4", 53);
        mux.dispatch(&ctx, dest.clone(), Buffer::from_bytes(b"hi")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        mux.remove(&ctx.inbound.as_ref().unwrap().source);
        assert_eq!(mux.entry_count(), 0);

        let before = seen.lock().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // No further deliveries after removal.
        assert_eq!(seen.lock().len(), before);
    }

    #[tokio::test]
    async fn test_mux_conn_roundtrip() {
        let dispatcher = Arc::new(EchoDispatcher::default());
        let mut conn = MuxConn::new(dispatcher, udp_ctx(9500));

        let dest = Destination::udp("9.9.9.9", 53);
        let n = conn.send_to(b"ping", dest).await.unwrap();
        assert_eq!(n, 4);

        let mut buf = [0u8; 64];
        let (n, source) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"gnip");
        assert_eq!(source.port, 53);

        conn.close();
        assert!(matches!(
            conn.recv_from(&mut buf).await,
            Err(Error::EndOfStream)
        ));
    }
}
