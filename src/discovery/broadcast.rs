// src/discovery/broadcast.rs - UDP fire-and-collect discovery
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::{DiscoveredDevice, DiscoveryError, DiscoveryMethod, DiscoveryStrategy};
use crate::config::default_port;
use crate::types::PrinterKind;

/// Datagram SDCP printers answer with their identity.
pub const PROBE: &[u8] = b"M99999";
pub const PROBE_PORT: u16 = 3000;

pub struct BroadcastScan {
    target: SocketAddr,
    window: Duration,
}

impl BroadcastScan {
    pub fn new(window: Duration) -> Self {
        Self::with_target(SocketAddr::from(([255, 255, 255, 255], PROBE_PORT)), window)
    }

    /// Sends the probe to `target` instead of the broadcast address.
    pub fn with_target(target: SocketAddr, window: Duration) -> Self {
        Self { target, window }
    }
}

/// Builds a device from one JSON reply; `from` is the sender's address.
pub fn parse_reply(body: &Value, from: SocketAddr) -> DiscoveredDevice {
    let data = if body["Data"].is_object() { &body["Data"] } else { body };
    let text = |key: &str| data[key].as_str().filter(|s| !s.is_empty()).map(str::to_string);
    let attributes = &data["Attributes"];
    let nested = |key: &str| attributes[key].as_str().filter(|s| !s.is_empty()).map(str::to_string);

    DiscoveredDevice {
        host: text("MainboardIP")
            .or_else(|| nested("MainboardIP"))
            .unwrap_or_else(|| from.ip().to_string()),
        port: default_port(PrinterKind::Sdcp),
        kind: PrinterKind::Sdcp,
        name: text("Name")
            .or_else(|| text("MachineName"))
            .or_else(|| nested("Name")),
        version: text("FirmwareVersion").or_else(|| nested("FirmwareVersion")),
        api_available: true,
        method: DiscoveryMethod::Broadcast,
        discovered_at: Utc::now(),
    }
}

#[async_trait]
impl DiscoveryStrategy for BroadcastScan {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn discover(&self, deadline: Instant) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        socket.send_to(PROBE, self.target).await?;
        tracing::debug!("Sent discovery probe to {}", self.target);

        let until = deadline.min(Instant::now() + self.window);
        let mut found = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = match tokio::time::timeout_at(until, socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    tracing::debug!("Broadcast receive failed: {}", e);
                    break;
                }
                Err(_) => break,
            };
            match serde_json::from_slice::<Value>(&buf[..len]) {
                Ok(body) => {
                    let device = parse_reply(&body, from);
                    tracing::info!("{} answered the discovery probe as {}", from, device.host);
                    found.push(device);
                }
                Err(_) => tracing::debug!("Ignoring non-JSON reply from {}", from),
            }
        }
        Ok(found)
    }
}
