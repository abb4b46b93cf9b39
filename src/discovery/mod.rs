//! Network discovery of printers, independent of any adapter.
//!
//! A [`Discovery`] runs its strategies one after another under a single
//! deadline. A failing strategy is logged and skipped; one not yet started
//! when the deadline passes never runs. Results are merged by (host, port).

pub mod broadcast;
pub mod mdns;
pub mod signatures;
pub mod subnet;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::DiscoveryConfig;
use crate::types::PrinterKind;

use broadcast::BroadcastScan;
use mdns::MdnsBrowse;
use subnet::{HttpProbe, ProbeTransport, SubnetScan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Mdns,
    Broadcast,
    Subnet,
    Probe,
}

/// A candidate printer found on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub host: String,
    pub port: u16,
    pub kind: PrinterKind,
    pub name: Option<String>,
    pub version: Option<String>,
    /// False when only an open port was seen.
    pub api_available: bool,
    pub method: DiscoveryMethod,
    pub discovered_at: DateTime<Utc>,
}

/// Failure inside one strategy. Never escapes a scan.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("strategy unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn discover(&self, deadline: Instant) -> Result<Vec<DiscoveredDevice>, DiscoveryError>;
}

/// Merges records sharing (host, port).
///
/// A record with `api_available` replaces one without; otherwise the first
/// one seen is kept. Output keeps first-seen order.
pub fn dedup(devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    let mut index: HashMap<(String, u16), usize> = HashMap::new();
    let mut merged: Vec<DiscoveredDevice> = Vec::with_capacity(devices.len());
    for device in devices {
        let key = (device.host.clone(), device.port);
        match index.get(&key) {
            Some(&slot) => {
                if device.api_available && !merged[slot].api_available {
                    merged[slot] = device;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(device);
            }
        }
    }
    merged
}

pub struct Discovery {
    strategies: Vec<Box<dyn DiscoveryStrategy>>,
    transport: Arc<dyn ProbeTransport>,
    timeout: Duration,
}

impl Discovery {
    pub fn new(timeout: Duration, transport: Arc<dyn ProbeTransport>) -> Self {
        Self {
            strategies: Vec::new(),
            transport,
            timeout,
        }
    }

    /// Engine with the strategies `config` enables, in order mDNS,
    /// broadcast, subnet.
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);
        let window = Duration::from_secs(config.timeout_secs);
        let transport: Arc<dyn ProbeTransport> = Arc::new(HttpProbe::new(probe_timeout));
        let mut discovery = Self::new(window, transport.clone());
        if config.mdns {
            discovery = discovery.with_strategy(MdnsBrowse::new(window.min(Duration::from_secs(3))));
        }
        if config.broadcast {
            discovery = discovery.with_strategy(BroadcastScan::new(window.min(Duration::from_secs(2))));
        }
        if config.subnet_scan {
            discovery = discovery.with_strategy(SubnetScan::new(
                transport,
                config.subnet.clone(),
                config.max_concurrency,
            ));
        }
        discovery
    }

    pub fn with_strategy(mut self, strategy: impl DiscoveryStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Runs every strategy and returns the merged candidates.
    pub async fn scan(&self) -> Vec<DiscoveredDevice> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut found = Vec::new();

        for strategy in &self.strategies {
            if Instant::now() >= deadline {
                tracing::info!("Discovery deadline passed, skipping {}", strategy.name());
                continue;
            }
            match tokio::time::timeout_at(deadline, strategy.discover(deadline)).await {
                Ok(Ok(devices)) => {
                    tracing::debug!("{} found {} device(s)", strategy.name(), devices.len());
                    found.extend(devices);
                }
                Ok(Err(e)) => tracing::warn!("Discovery strategy {} failed: {}", strategy.name(), e),
                Err(_) => tracing::warn!("Discovery strategy {} ran past the deadline", strategy.name()),
            }
        }

        let merged = dedup(found);
        tracing::info!("Discovery found {} device(s) in {:?}", merged.len(), started.elapsed());
        merged
    }

    /// Checks one explicit host against every known signature.
    pub async fn probe_host(&self, host: &str) -> Vec<DiscoveredDevice> {
        let host = host.trim();
        match tokio::time::timeout(self.timeout, subnet::probe_host(self.transport.as_ref(), host)).await {
            Ok(devices) => dedup(devices),
            Err(_) => {
                tracing::warn!("Probing {} timed out", host);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(host: &str, port: u16, api_available: bool, method: DiscoveryMethod) -> DiscoveredDevice {
        DiscoveredDevice {
            host: host.to_string(),
            port,
            kind: PrinterKind::Sdcp,
            name: None,
            version: None,
            api_available,
            method,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn api_available_wins() {
        let merged = dedup(vec![
            device("10.0.0.5", 3030, false, DiscoveryMethod::Probe),
            device("10.0.0.5", 3030, true, DiscoveryMethod::Broadcast),
        ]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].api_available);
        assert_eq!(merged[0].method, DiscoveryMethod::Broadcast);
    }

    #[test]
    fn ties_keep_first_seen() {
        let merged = dedup(vec![
            device("10.0.0.5", 80, true, DiscoveryMethod::Mdns),
            device("10.0.0.5", 80, true, DiscoveryMethod::Subnet),
            device("10.0.0.6", 80, true, DiscoveryMethod::Subnet),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].method, DiscoveryMethod::Mdns);
        assert_eq!(merged[1].host, "10.0.0.6");
    }

    #[test]
    fn strategy_order_follows_config() {
        let config = DiscoveryConfig {
            broadcast: false,
            ..DiscoveryConfig::default()
        };
        let discovery = Discovery::from_config(&config);
        assert_eq!(discovery.strategy_names(), vec!["mdns", "subnet"]);
    }
}
