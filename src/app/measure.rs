//! Active latency measurement through outbound handlers
//!
//! A probe builds an in-memory flow, hands its outbound side to the
//! candidate handler and measures how long one request/response round trip
//! takes through it. Probe failures are indistinguishable from slow
//! handlers on purpose: both report the full timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{Destination, Error, Result};
use crate::config::ProbeTarget;
use crate::outbound::OutboundHandler;
use crate::session::{FlowState, Outbound};
use crate::transport::conn::LinkConn;
use crate::transport::pipe::{new_pipe, PipeOptions};
use crate::transport::Link;

/// Measure one round trip to `target` through `handler`.
///
/// Writes `content` once, waits for the first response byte, and returns
/// the elapsed time. Any probe error and the overall deadline both collapse
/// to `timeout`; the result is always in `0..=timeout`.
pub async fn measure_latency(
    handler: Arc<dyn OutboundHandler>,
    target: &ProbeTarget,
    content: &str,
    timeout: Duration,
) -> Duration {
    let (uplink_reader, uplink_writer) = new_pipe(PipeOptions::unbounded());
    let (downlink_reader, downlink_writer) = new_pipe(PipeOptions::unbounded());

    let conn = LinkConn::new(downlink_reader.clone(), uplink_writer.clone());
    let outbound_link = Link::new(
        Box::new(uplink_reader.clone()),
        Box::new(downlink_writer.clone()),
    );

    let destination = Destination::tcp(target.host.as_str(), target.port);
    let mut ctx = FlowState::new().with_outbound(Outbound::new(destination));
    tokio::spawn(async move {
        handler.dispatch(&mut ctx, outbound_link).await;
    });

    let start = Instant::now();
    let latency = match tokio::time::timeout(timeout, probe(conn, target, content)).await {
        Ok(Ok(())) => start.elapsed().min(timeout),
        Ok(Err(e)) => {
            debug!("latency probe failed: {}", e);
            timeout
        }
        Err(_) => timeout,
    };

    downlink_writer.close();
    uplink_reader.interrupt();
    uplink_writer.close();
    downlink_reader.interrupt();

    latency
}

async fn probe(mut conn: LinkConn, target: &ProbeTarget, content: &str) -> Result<()> {
    if target.tls {
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|_| Error::Config(format!("invalid probe server name {:?}", target.host)))?;
        let mut stream = tls_connector().connect(server_name, conn).await?;
        stream.write_all(content.as_bytes()).await?;
        stream.flush().await?;
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
    } else {
        conn.write_all(content.as_bytes()).await?;
        conn.flush().await?;
        let mut byte = [0u8; 1];
        conn.read_exact(&mut byte).await?;
    }
    Ok(())
}

fn tls_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
