//! Outbound handler traits and the handler registry
//!
//! An outbound handler owns the far side of a flow: it consumes the
//! outbound end of a link pair and pumps bytes to the outside world until
//! either side closes. The registry resolves tags to handlers and answers
//! selector patterns for the balancer.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::session::FlowState;
use crate::transport::Link;

/// An outbound proxy protocol implementation
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;

    /// Pump the link until either side closes. The handler owns the link
    /// from here on and is responsible for closing it.
    async fn dispatch(&self, ctx: &mut FlowState, link: Link);
}

/// Registry view consumed by the dispatcher and the balancer
pub trait OutboundManager: Send + Sync {
    fn get_handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>>;

    fn get_default_handler(&self) -> Option<Arc<dyn OutboundHandler>>;

    /// Resolve selector patterns to concrete tags. A pattern is either an
    /// exact tag or a prefix followed by `*`.
    fn select(&self, patterns: &[String]) -> Vec<String>;
}

/// Insertion-ordered handler registry; the first handler added is the
/// default.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn OutboundHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: Arc<dyn OutboundHandler>) {
        let mut handlers = self.handlers.write();
        // Re-adding a tag replaces the old handler in place.
        if let Some(existing) = handlers.iter_mut().find(|h| h.tag() == handler.tag()) {
            *existing = handler;
        } else {
            handlers.push(handler);
        }
    }

    pub fn tags(&self) -> Vec<String> {
        self.handlers
            .read()
            .iter()
            .map(|h| h.tag().to_string())
            .collect()
    }
}

impl OutboundManager for HandlerRegistry {
    fn get_handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers
            .read()
            .iter()
            .find(|h| h.tag() == tag)
            .cloned()
    }

    fn get_default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.read().first().cloned()
    }

    fn select(&self, patterns: &[String]) -> Vec<String> {
        let handlers = self.handlers.read();
        let mut tags = Vec::new();
        for handler in handlers.iter() {
            let tag = handler.tag();
            let matched = patterns.iter().any(|pattern| {
                match pattern.strip_suffix('*') {
                    Some(prefix) => tag.starts_with(prefix),
                    None => tag == pattern,
                }
            });
            if matched {
                tags.push(tag.to_string());
            }
        }
        tags
    }
}
