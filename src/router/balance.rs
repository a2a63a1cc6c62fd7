//! Outbound balancing strategies
//!
//! A balancer resolves a set of candidate outbound tags to one concrete
//! tag. `RandomStrategy` picks uniformly; `LatencyStrategy` actively probes
//! every candidate on an interval and sticks with the fastest, with a
//! tolerance band so near-ties do not cause oscillation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::app::measure::measure_latency;
use crate::config::ProbeTarget;
use crate::outbound::OutboundManager;

/// One measured candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub tag: String,
    pub latency: Duration,
}

/// Maps candidate tags to the tag traffic should use
pub trait BalancingStrategy: Send + Sync {
    fn pick_outbound(&self, tags: &[String]) -> String;
}

/// Uniform random pick
#[derive(Default)]
pub struct RandomStrategy;

impl BalancingStrategy for RandomStrategy {
    fn pick_outbound(&self, tags: &[String]) -> String {
        assert!(!tags.is_empty(), "no candidate outbound tags");
        tags[rand::thread_rng().gen_range(0..tags.len())].clone()
    }
}

/// Latency strategy knobs, validated at configuration load
#[derive(Debug, Clone)]
pub struct LatencySettings {
    pub total_measures: u32,
    pub interval: Duration,
    pub delay: Duration,
    pub timeout: Duration,
    pub tolerance: Duration,
    pub probe_target: ProbeTarget,
    pub probe_content: String,
}

impl Default for LatencySettings {
    fn default() -> Self {
        Self {
            total_measures: 2,
            interval: Duration::from_secs(120),
            delay: Duration::ZERO,
            timeout: Duration::from_secs(6),
            tolerance: Duration::from_millis(300),
            probe_target: ProbeTarget {
                tls: true,
                host: "www.google.com".to_string(),
                port: 443,
            },
            probe_content: "HEAD / HTTP/1.1\r\n\r\n".to_string(),
        }
    }
}

#[derive(Default)]
struct LatencyState {
    servers: Vec<Server>,
    selected: Option<Server>,
    last_measure: Option<Instant>,
}

struct LatencyInner {
    ohm: Arc<dyn OutboundManager>,
    selectors: Vec<String>,
    settings: LatencySettings,
    state: Mutex<LatencyState>,
}

/// Active-probing balancer with hysteresis.
///
/// Must be constructed inside a tokio runtime: construction schedules the
/// initial measurement round a few seconds out, and `pick_outbound` spawns
/// re-measurements once the interval has elapsed.
pub struct LatencyStrategy {
    inner: Arc<LatencyInner>,
}

impl LatencyStrategy {
    pub fn new(
        ohm: Arc<dyn OutboundManager>,
        selectors: Vec<String>,
        settings: LatencySettings,
    ) -> Self {
        let inner = Arc::new(LatencyInner {
            ohm,
            selectors,
            settings,
            state: Mutex::new(LatencyState::default()),
        });

        let task = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            debug!(
                "new latency balancer with totalMeasures {}, interval {:?}, delay {:?}, timeout {:?}, tolerance {:?}, probeTarget {}",
                task.settings.total_measures,
                task.settings.interval,
                task.settings.delay,
                task.settings.timeout,
                task.settings.tolerance,
                task.settings.probe_target,
            );
            measure_once(task).await;
        });

        Self { inner }
    }

    pub fn selected(&self) -> Option<Server> {
        self.inner.state.lock().selected.clone()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.inner.state.lock().servers.clone()
    }
}

impl BalancingStrategy for LatencyStrategy {
    fn pick_outbound(&self, tags: &[String]) -> String {
        assert!(!tags.is_empty(), "no candidate outbound tags");

        let mut state = self.inner.state.lock();
        let Some(selected) = state.selected.clone() else {
            // No measurement yet (or the selected tag vanished from the
            // last round): fall back to a uniform pick.
            return tags[rand::thread_rng().gen_range(0..tags.len())].clone();
        };

        let now = Instant::now();
        let due = state
            .last_measure
            .map_or(true, |last| now - last > self.inner.settings.interval);
        if due {
            state.last_measure = Some(now);
            tokio::spawn(measure_once(self.inner.clone()));
        }

        selected.tag
    }
}

async fn measure_once(inner: Arc<LatencyInner>) {
    let tags = inner.ohm.select(&inner.selectors);
    assert!(!tags.is_empty(), "balancer selectors resolved to no outbound tags");

    let mut servers = Vec::new();
    for tag in tags {
        let Some(handler) = inner.ohm.get_handler(&tag) else {
            warn!("non existing tag: {}", tag);
            continue;
        };
        let mut total_nanos: u128 = 0;
        for _ in 0..inner.settings.total_measures {
            debug!("measuring {}, target: {}", tag, inner.settings.probe_target);
            let latency = measure_latency(
                handler.clone(),
                &inner.settings.probe_target,
                &inner.settings.probe_content,
                inner.settings.timeout,
            )
            .await;
            total_nanos += latency.as_nanos();
            tokio::time::sleep(inner.settings.delay).await;
        }
        let avg = Duration::from_nanos((total_nanos / inner.settings.total_measures as u128) as u64);
        servers.push(Server { tag, latency: avg });
    }

    servers.sort_by_key(|s| s.latency);
    for server in &servers {
        debug!(
            "outbound: {}, target: {}, latency: {:?}",
            server.tag, inner.settings.probe_target, server.latency
        );
    }

    let mut state = inner.state.lock();
    state.selected = select_server(
        &state.selected,
        &state.servers,
        &servers,
        inner.settings.tolerance,
    );
    match &state.selected {
        Some(s) => debug!("selected outbound: {}, latency: {:?}", s.tag, s.latency),
        None => debug!("previously selected outbound absent from measurements"),
    }
    state.servers = servers;
}

/// Hysteretic selection: switch to the new best only when it beats the
/// currently selected candidate by more than `tolerance`. Returns `None`
/// when the selected tag vanished from the new round; callers fall back to
/// random until the next round publishes a selection.
fn select_server(
    selected: &Option<Server>,
    old: &[Server],
    new: &[Server],
    tolerance: Duration,
) -> Option<Server> {
    let Some(selected) = selected else {
        return new.first().cloned();
    };
    if old.is_empty() {
        return new.first().cloned();
    }
    if new.is_empty() {
        return Some(selected.clone());
    }

    let new_best = &new[0];
    for measured in new {
        if measured.tag == selected.tag {
            if new_best.latency < measured.latency.saturating_sub(tolerance) {
                return Some(new_best.clone());
            }
            return Some(measured.clone());
        }
    }
    None
}
