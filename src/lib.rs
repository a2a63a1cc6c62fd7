//! flowgate - dispatch core for a pluggable proxy/tunnel engine
//!
//! # Architecture
//!
//! ```text
//! inbound proxy → Dispatcher.dispatch(dest)
//!                     ↓ builds a pipe pair
//!                 [sniffer peeks via CachedReader]
//!                     ↓
//!                 Router.pick_route / balancer
//!                     ↓
//!                 OutboundHandler.dispatch(outbound link)
//! ```
//!
//! The crate owns the plumbing between an inbound proxy and an outbound
//! handler: the backpressured in-memory pipe, the dispatcher that sniffs,
//! routes and wires flows together, the UDP session multiplexer, and the
//! latency-probing outbound balancer. Proxy protocols, the routing rule
//! engine and sniffer state machines are collaborators behind traits.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Destination, buffers, signals, timers
//! ├── session/         # Per-flow context, traffic stats, flow records
//! ├── transport/       # Links, pipes, UDP mux
//! ├── outbound/        # Handler + manager traits, registry
//! ├── router/          # Router trait, balancing strategies
//! ├── sniff/           # Protocol sniffing
//! └── app/             # Dispatcher, stat writers, probes, metrics
//! ```

pub mod common;
pub mod error;

pub mod app;
pub mod config;
pub mod outbound;
pub mod router;
pub mod session;
pub mod sniff;
pub mod transport;

// Re-exports for convenience
pub use common::{Address, Buffer, Destination, MultiBuffer, Network};
pub use error::{Error, Result};

pub use app::Dispatcher;
pub use config::DispatchConfig;
pub use outbound::{HandlerRegistry, OutboundHandler, OutboundManager};
pub use router::{BalancingStrategy, LatencyStrategy, RandomStrategy, Router, RoutingDispatcher};
pub use session::FlowState;
pub use transport::udp::UdpMux;
pub use transport::{Link, LinkReader, LinkWriter};
