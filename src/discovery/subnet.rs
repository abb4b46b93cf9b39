// src/discovery/subnet.rs - Local /24 detection, subnet sweep and point probe
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::time::Instant;

use super::signatures::{http_signatures, Check, Signature, SIGNATURES};
use super::{DiscoveredDevice, DiscoveryError, DiscoveryMethod, DiscoveryStrategy};

/// How probes reach the network. Swappable so sweeps can run against mocks.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// JSON body of `GET http://host:port/path`, or `None` on any failure.
    async fn get_json(&self, host: &str, port: u16, path: &str) -> Option<Value>;

    async fn tcp_open(&self, host: &str, port: u16) -> bool;
}

/// Default transport over `reqwest` and tokio TCP.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }
}

#[async_trait]
impl ProbeTransport for HttpProbe {
    async fn get_json(&self, host: &str, port: u16, path: &str) -> Option<Value> {
        let url = format!("http://{}:{}{}", host, port, path);
        let response = self.client.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<Value>().await.ok()
    }

    async fn tcp_open(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

/// Local address the OS would use to reach `target`. Sends nothing.
pub fn local_ip_toward(target: &str) -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

fn prefix_of(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{}.{}.{}", a, b, c)
}

/// First three octets of the local /24, e.g. `"192.168.1"`.
///
/// Resolves the host name first; when that only yields loopback, asks the
/// OS which interface routes outward.
pub async fn detect_local_subnet() -> Option<String> {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());

    if let Some(hostname) = hostname {
        if let Ok(addrs) = tokio::net::lookup_host((hostname.as_str(), 0)).await {
            let mut outward = addrs.filter_map(|a| match a.ip() {
                IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
                _ => None,
            });
            if let Some(ip) = outward.next() {
                return Some(prefix_of(ip));
            }
        }
    }

    match local_ip_toward("8.8.8.8:80") {
        Ok(IpAddr::V4(v4)) if !v4.is_loopback() => Some(prefix_of(v4)),
        Ok(other) => {
            tracing::debug!("Outward address {} is not a usable IPv4 address", other);
            None
        }
        Err(e) => {
            tracing::debug!("Could not determine outward interface: {}", e);
            None
        }
    }
}

/// Runs one signature against one host.
pub async fn probe_signature(
    transport: &dyn ProbeTransport,
    host: &str,
    signature: &Signature,
    method: DiscoveryMethod,
) -> Option<DiscoveredDevice> {
    let (identity, api_available) = match signature.check {
        Check::Http { path, matches } => {
            let body = transport.get_json(host, signature.port, path).await?;
            (matches(&body)?, true)
        }
        Check::Tcp => {
            if !transport.tcp_open(host, signature.port).await {
                return None;
            }
            (Default::default(), false)
        }
    };
    tracing::debug!("{} looks like {} on port {}", host, signature.kind, signature.port);
    Some(DiscoveredDevice {
        host: host.to_string(),
        port: signature.port,
        kind: signature.kind,
        name: identity.name,
        version: identity.version,
        api_available,
        method,
        discovered_at: Utc::now(),
    })
}

/// Point probe: every signature, including TCP-only ones, against `host`.
pub async fn probe_host(transport: &dyn ProbeTransport, host: &str) -> Vec<DiscoveredDevice> {
    let probes = SIGNATURES
        .iter()
        .map(|signature| probe_signature(transport, host, signature, DiscoveryMethod::Probe));
    futures::future::join_all(probes).await.into_iter().flatten().collect()
}

/// Sweeps `prefix.1` through `prefix.254` with the HTTP signatures.
pub struct SubnetScan {
    transport: Arc<dyn ProbeTransport>,
    subnet: Option<String>,
    max_concurrency: usize,
}

impl SubnetScan {
    pub fn new(transport: Arc<dyn ProbeTransport>, subnet: Option<String>, max_concurrency: usize) -> Self {
        Self {
            transport,
            subnet,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub async fn sweep(&self, prefix: &str, deadline: Instant) -> Vec<DiscoveredDevice> {
        let targets: Vec<(String, &'static Signature)> = (1..=254u8)
            .flat_map(|octet| {
                let host = format!("{}.{}", prefix, octet);
                http_signatures().map(move |signature| (host.clone(), signature))
            })
            .collect();
        tracing::info!("Probing {} endpoints on {}.0/24", targets.len(), prefix);

        let transport = self.transport.as_ref();
        let mut found = Vec::new();
        let mut results = stream::iter(targets)
            .map(|(host, signature)| async move {
                probe_signature(transport, &host, signature, DiscoveryMethod::Subnet).await
            })
            .buffer_unordered(self.max_concurrency)
            .boxed();

        loop {
            match tokio::time::timeout_at(deadline, results.next()).await {
                Ok(Some(Some(device))) => found.push(device),
                Ok(Some(None)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("Subnet sweep of {}.0/24 hit the deadline", prefix);
                    break;
                }
            }
        }
        found
    }
}

#[async_trait]
impl DiscoveryStrategy for SubnetScan {
    fn name(&self) -> &'static str {
        "subnet"
    }

    async fn discover(&self, deadline: Instant) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let prefix = match &self.subnet {
            Some(prefix) => prefix.trim_end_matches('.').to_string(),
            None => detect_local_subnet()
                .await
                .ok_or_else(|| DiscoveryError::Unavailable("could not detect the local subnet".to_string()))?,
        };
        Ok(self.sweep(&prefix, deadline).await)
    }
}
