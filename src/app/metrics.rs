//! Prometheus-based metrics module
//!
//! All dispatch-level metrics live in one global registry and are exposed
//! via the /metrics endpoint in `stats_api`. Named per-user traffic
//! counters are backed by a labelled counter vector and handed out through
//! the `StatsManager` trait.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total flows handled by the dispatcher
    pub static ref DISPATCH_FLOWS_TOTAL: IntCounter = IntCounter::new(
        "flowgate_dispatch_flows_total",
        "Total number of flows handled by the dispatcher"
    ).unwrap();

    /// Currently active flows
    pub static ref DISPATCH_FLOWS_ACTIVE: IntGauge = IntGauge::new(
        "flowgate_dispatch_flows_active",
        "Number of currently active flows"
    ).unwrap();

    /// Flows whose destination was rewritten from a sniffed domain
    pub static ref SNIFF_OVERRIDES_TOTAL: IntCounter = IntCounter::new(
        "flowgate_sniff_overrides_total",
        "Flows whose destination was overridden by sniffing"
    ).unwrap();

    /// Flows torn down because no handler could be selected
    pub static ref HANDLER_MISSING_TOTAL: IntCounter = IntCounter::new(
        "flowgate_handler_missing_total",
        "Flows dropped because no outbound handler was available"
    ).unwrap();

    /// Named traffic counters (per-user uplink/downlink)
    pub static ref NAMED_COUNTERS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowgate_named_traffic_bytes_total", "Named traffic byte counters"),
        &["counter"]
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(DISPATCH_FLOWS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DISPATCH_FLOWS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SNIFF_OVERRIDES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(HANDLER_MISSING_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(NAMED_COUNTERS.clone())).ok();
}

/// A named byte counter handed out by the stats manager
#[derive(Clone)]
pub struct Counter {
    inner: IntCounter,
}

impl Counter {
    pub fn add(&self, n: i64) {
        if n > 0 {
            self.inner.inc_by(n as u64);
        }
    }

    pub fn value(&self) -> i64 {
        self.inner.get() as i64
    }
}

/// Registry of named counters
pub trait StatsManager: Send + Sync {
    /// Look up or create the counter registered under `name`.
    fn get_or_register_counter(&self, name: &str) -> Counter;
}

/// Prometheus-backed stats manager; counter names become label values on
/// one counter vector.
#[derive(Default)]
pub struct MetricsStats;

impl MetricsStats {
    pub fn new() -> Self {
        init_metrics();
        Self
    }
}

impl StatsManager for MetricsStats {
    fn get_or_register_counter(&self, name: &str) -> Counter {
        Counter {
            inner: NAMED_COUNTERS.with_label_values(&[name]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let stats = MetricsStats::new();
        let counter = stats.get_or_register_counter("user>>>t@example.com>>>traffic>>>uplink");
        let before = counter.value();
        counter.add(128);
        counter.add(-5);
        assert_eq!(counter.value(), before + 128);

        // Same name resolves to the same counter.
        let again = stats.get_or_register_counter("user>>>t@example.com>>>traffic>>>uplink");
        assert_eq!(again.value(), before + 128);
    }
}
