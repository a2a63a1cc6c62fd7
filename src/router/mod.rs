//! Routing layer
//!
//! The router maps a flow's metadata to an outbound tag. It performs no IO:
//! the dispatcher consults it once per flow and resolves the tag against the
//! outbound manager. Balancing strategies (random and latency-probing) live
//! in `balance`.

pub mod balance;

pub use balance::{BalancingStrategy, LatencySettings, LatencyStrategy, RandomStrategy, Server};

use async_trait::async_trait;

use crate::common::{Destination, Result};
use crate::session::FlowState;
use crate::transport::Link;

/// Route selection: flow metadata in, outbound tag out. No IO.
pub trait Router: Send + Sync {
    fn pick_route(&self, ctx: &FlowState) -> Result<String>;
}

/// The dispatch surface the core exposes to inbound proxies and the UDP
/// multiplexer: hand in a destination, get back the inbound side of a link
/// pair.
#[async_trait]
pub trait RoutingDispatcher: Send + Sync {
    async fn dispatch(&self, ctx: FlowState, destination: Destination) -> Result<Link>;
}

/// Router that always picks the same outbound
pub struct StaticRouter {
    outbound: String,
}

impl StaticRouter {
    pub fn new(outbound: impl Into<String>) -> Self {
        Self {
            outbound: outbound.into(),
        }
    }
}

impl Router for StaticRouter {
    fn pick_route(&self, _ctx: &FlowState) -> Result<String> {
        Ok(self.outbound.clone())
    }
}

impl Default for StaticRouter {
    fn default() -> Self {
        Self::new("direct")
    }
}
