//! Per-flow session metadata
//!
//! Everything the dispatcher and handlers need to know about one flow
//! travels in a `FlowState` passed through the call chain. The slots are
//! enumerated, not an open key/value bag: id, inbound, outbound, content,
//! record, traffic, plus the ambient pipe options and an optional access-log
//! message.

mod log;
mod record;
mod traffic;

pub use log::{AccessMessage, AccessStatus};
pub use record::{DbService, ProxyLogSink, ProxyRecord, RECORD_TYPE_DNS, RECORD_TYPE_FLOW};
pub use traffic::{SessionTracker, TrafficSession};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::common::{Address, Destination};
use crate::transport::pipe::PipeOptions;

/// Generate a flow id. High likely unique, never 0.
pub fn new_id() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u32 = rng.gen();
        if id != 0 {
            return id;
        }
    }
}

/// A user authenticated by the inbound proxy
#[derive(Debug, Clone)]
pub struct User {
    pub email: String,
    pub level: u32,
}

/// Metadata of the inbound side of a flow
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Source address of the inbound connection
    pub source: Destination,
    /// Gateway address
    pub gateway: Option<Destination>,
    /// Tag of the inbound proxy that handles the connection
    pub tag: String,
    /// User that authenticated for the inbound, if the protocol knows one
    pub user: Option<User>,
    /// Set when the inbound cannot attribute traffic to a source address
    pub no_source: bool,
}

impl Inbound {
    pub fn new(source: Destination, tag: impl Into<String>) -> Self {
        Self {
            source,
            gateway: None,
            tag: tag.into(),
            user: None,
            no_source: false,
        }
    }
}

/// Metadata of the outbound side of a flow
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Target address of the outbound connection
    pub target: Destination,
    /// Gateway address
    pub gateway: Option<Address>,
    /// Resolved IPs when the target is a domain address
    pub resolved_ips: Vec<IpAddr>,
    /// Idle timeout override for datagram flows
    pub timeout: Option<Duration>,
}

impl Outbound {
    pub fn new(target: Destination) -> Self {
        Self {
            target,
            gateway: None,
            resolved_ips: Vec::new(),
            timeout: None,
        }
    }
}

/// Request to sniff the first bytes of a flow
#[derive(Debug, Clone, Default)]
pub struct SniffingRequest {
    pub enabled: bool,
    /// Protocol name prefixes for which a sniffed domain replaces the
    /// destination address
    pub override_destination_for_protocol: Vec<String>,
}

/// Metadata of the connection content
#[derive(Debug, Clone, Default)]
pub struct Content {
    /// Protocol of the current content, possibly filled by the sniffer
    pub protocol: String,

    pub sniffing: SniffingRequest,

    pub attributes: HashMap<String, String>,

    pub application: Vec<String>,
    pub network: String,
    pub local_addr: String,
    pub remote_addr: String,
    pub extra: String,
    pub outbound_tag: String,
}

impl Content {
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Per-flow context threaded through dispatch
#[derive(Clone, Default)]
pub struct FlowState {
    pub id: u32,
    pub inbound: Option<Inbound>,
    pub outbound: Option<Outbound>,
    pub content: Option<Content>,
    pub record: Option<Arc<ProxyRecord>>,
    pub traffic: Option<Arc<TrafficSession>>,
    pub access: Option<AccessMessage>,
    /// Ambient pipe options applied to pipes built for this flow
    pub pipe_options: PipeOptions,
}

impl FlowState {
    pub fn new() -> Self {
        Self {
            id: new_id(),
            ..Default::default()
        }
    }

    pub fn with_inbound(mut self, inbound: Inbound) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub fn with_outbound(mut self, outbound: Outbound) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }
}
