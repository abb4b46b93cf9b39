// src/discovery/mdns.rs - Service-advertisement browsing
//
// Backed by mdns-sd through the default `mdns` feature. Without it, or when
// the daemon cannot start, the strategy finds nothing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DiscoveredDevice, DiscoveryError, DiscoveryStrategy};
use crate::types::PrinterKind;

/// Service types browsed, with the firmware each implies.
pub const SERVICE_TYPES: &[(&str, PrinterKind)] = &[
    ("_octoprint._tcp.local.", PrinterKind::OctoPrint),
    ("_moonraker._tcp.local.", PrinterKind::Moonraker),
    ("_prusa-link._tcp.local.", PrinterKind::PrusaLink),
];

pub struct MdnsBrowse {
    window: Duration,
}

impl MdnsBrowse {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

#[async_trait]
impl DiscoveryStrategy for MdnsBrowse {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn discover(&self, deadline: Instant) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let until = deadline.min(Instant::now() + self.window);
        Ok(browse(until).await)
    }
}

#[cfg(feature = "mdns")]
async fn browse(until: Instant) -> Vec<DiscoveredDevice> {
    use chrono::Utc;
    use mdns_sd::{ServiceDaemon, ServiceEvent};

    use super::DiscoveryMethod;

    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::warn!("mDNS unavailable, skipping: {}", e);
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for (service, kind) in SERVICE_TYPES {
        let receiver = match daemon.browse(service) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::debug!("Cannot browse {}: {}", service, e);
                continue;
            }
        };
        // at most two seconds per service type, within the window
        let per_service = until.min(Instant::now() + Duration::from_secs(2));
        while let Ok(Ok(event)) = tokio::time::timeout_at(per_service, receiver.recv_async()).await {
            if let ServiceEvent::ServiceResolved(info) = event {
                let Some(addr) = info.get_addresses().iter().find(|a| a.is_ipv4()).copied() else {
                    continue;
                };
                let name = info
                    .get_fullname()
                    .split('.')
                    .next()
                    .filter(|n| !n.is_empty())
                    .map(str::to_string);
                found.push(DiscoveredDevice {
                    host: addr.to_string(),
                    port: info.get_port(),
                    kind: *kind,
                    name,
                    version: info.get_property_val_str("version").map(str::to_string),
                    api_available: true,
                    method: DiscoveryMethod::Mdns,
                    discovered_at: Utc::now(),
                });
            }
        }
        let _ = daemon.stop_browse(service);
    }

    if let Err(e) = daemon.shutdown() {
        tracing::debug!("mDNS daemon shutdown failed: {}", e);
    }
    found
}

#[cfg(not(feature = "mdns"))]
async fn browse(_until: Instant) -> Vec<DiscoveredDevice> {
    tracing::debug!("Built without the mdns feature; service browsing skipped");
    Vec::new()
}
