//! Dispatch configuration
//!
//! JSON-driven configuration for the routing and balancing behavior of the
//! dispatch core. Matcher fields on routing rules are carried as data for
//! the rule engine; validation here is structural. In particular, probe
//! targets are parsed at load time so a malformed target can never reach a
//! running balancer.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::router::LatencySettings;

/// How domain destinations are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainStrategy {
    /// Use the domain as is
    AsIs,
    /// Always resolve IP for domains
    UseIp,
    /// Resolve to IP if the domain doesn't match any rule
    IpIfNonMatch,
    /// Resolve to IP if any rule requires IP matching
    IpOnDemand,
}

impl Default for DomainStrategy {
    fn default() -> Self {
        DomainStrategy::AsIs
    }
}

/// Domain matcher type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainMatchType {
    /// Substring match
    Plain,
    /// Regular expression
    Regex,
    /// Root domain and subdomains
    Domain,
    /// Exact match
    Full,
}

impl Default for DomainMatchType {
    fn default() -> Self {
        DomainMatchType::Plain
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRule {
    #[serde(rename = "type", default)]
    pub match_type: DomainMatchType,
    pub value: String,
}

/// One routing rule: matchers plus a target, either a concrete outbound
/// tag or a balancer tag, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub balancing_tag: Option<String>,
    #[serde(default)]
    pub domain: Vec<DomainRule>,
    #[serde(default)]
    pub geoip: Vec<String>,
    #[serde(default)]
    pub ports: Option<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub source_geoip: Vec<String>,
    #[serde(default)]
    pub user_email: Vec<String>,
    #[serde(default)]
    pub inbound_tag: Vec<String>,
    #[serde(default)]
    pub protocol: Vec<String>,
    #[serde(default)]
    pub application: Vec<String>,
    #[serde(default)]
    pub attributes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancingStrategyKind {
    Random,
    Latency,
}

impl Default for BalancingStrategyKind {
    fn default() -> Self {
        BalancingStrategyKind::Random
    }
}

fn default_total_measures() -> u32 {
    2
}

fn default_interval_secs() -> u64 {
    120
}

fn default_timeout_secs() -> u64 {
    6
}

fn default_tolerance_ms() -> u64 {
    300
}

fn default_probe_target() -> String {
    "tls:www.google.com:443".to_string()
}

fn default_probe_content() -> String {
    "HEAD / HTTP/1.1\r\n\r\n".to_string()
}

/// Balancer configuration: selector patterns plus the probing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancingRule {
    pub tag: String,
    #[serde(default)]
    pub outbound_selector: Vec<String>,
    #[serde(default)]
    pub strategy: BalancingStrategyKind,
    #[serde(default = "default_total_measures")]
    pub total_measures: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
    #[serde(default = "default_probe_target")]
    pub probe_target: String,
    #[serde(default = "default_probe_content")]
    pub probe_content: String,
}

impl BalancingRule {
    /// Resolve into validated latency-strategy settings.
    pub fn latency_settings(&self) -> Result<LatencySettings> {
        Ok(LatencySettings {
            total_measures: self.total_measures.max(1),
            interval: Duration::from_secs(self.interval_secs),
            delay: Duration::from_millis(self.delay_ms),
            timeout: Duration::from_secs(self.timeout_secs),
            tolerance: Duration::from_millis(self.tolerance_ms),
            probe_target: self.probe_target.parse()?,
            probe_content: self.probe_content.clone(),
        })
    }
}

/// A validated latency probe target: `tcp:host:port` or `tls:host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl FromStr for ProbeTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(Error::Config(format!(
                "invalid probe target {:?}: expected proto:host:port",
                s
            )));
        }
        let tls = match parts[0] {
            "tcp" => false,
            "tls" => true,
            other => {
                return Err(Error::Config(format!(
                    "invalid probe target protocol {:?}: expected tcp or tls",
                    other
                )))
            }
        };
        if parts[1].is_empty() {
            return Err(Error::Config(format!("invalid probe target {:?}: empty host", s)));
        }
        let port: u16 = parts[2]
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::Config(format!("invalid probe target port {:?}", parts[2])))?;
        Ok(Self {
            tls,
            host: parts[1].to_string(),
            port,
        })
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = if self.tls { "tls" } else { "tcp" };
        write!(f, "{}:{}:{}", proto, self.host, self.port)
    }
}

/// Top-level dispatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub domain_strategy: DomainStrategy,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(default)]
    pub balancing_rules: Vec<BalancingRule>,
}

impl DispatchConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            match (&rule.tag, &rule.balancing_tag) {
                (Some(_), Some(_)) => {
                    return Err(Error::Config(
                        "routing rule carries both tag and balancing_tag".to_string(),
                    ))
                }
                (None, None) => {
                    return Err(Error::Config(
                        "routing rule carries neither tag nor balancing_tag".to_string(),
                    ))
                }
                _ => {}
            }
        }
        for rule in &self.balancing_rules {
            if rule.strategy == BalancingStrategyKind::Latency {
                if rule.outbound_selector.is_empty() {
                    return Err(Error::Config(format!(
                        "balancer {:?} has no outbound selectors",
                        rule.tag
                    )));
                }
                rule.probe_target.parse::<ProbeTarget>()?;
            }
        }
        Ok(())
    }
}
