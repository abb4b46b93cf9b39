//! # Printer Link Configuration
//!
//! Connection settings for printers and for network discovery, loaded from TOML.
//!
//! ```toml
//! [[printers]]
//! name = "voron"
//! kind = "moonraker"
//! host = "10.0.0.10"
//!
//! [[printers]]
//! name = "mk4"
//! kind = "prusalink"
//! host = "10.0.0.22"
//! api_key = "abc123"
//!
//! [printers.retry]
//! max_attempts = 5
//!
//! [discovery]
//! subnet = "10.0.0"
//! timeout_secs = 15
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::PrinterKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid printer '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printers: Vec<PrinterConfig>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for printer in &self.printers {
            printer.validate()?;
        }
        Ok(())
    }

    pub fn printer(&self, name: &str) -> Option<&PrinterConfig> {
        self.printers.iter().find(|p| p.name == name)
    }
}

/// Connection settings for one printer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    pub name: String,
    pub kind: PrinterKind,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Overrides the snapshot URL the adapter would otherwise derive.
    #[serde(default)]
    pub webcam_url: Option<String>,
    /// SDCP mainboard id; learned from the first frame when absent.
    #[serde(default)]
    pub mainboard_id: Option<String>,
    /// Host the printer should use to reach this machine for pull uploads.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

impl PrinterConfig {
    pub fn new(name: &str, kind: PrinterKind, host: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            host: host.to_string(),
            port: None,
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryConfig::default(),
            webcam_url: None,
            mainboard_id: None,
            advertise_host: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("host cannot be empty"));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs must be positive"));
        }
        if matches!(self.kind, PrinterKind::Bambu | PrinterKind::Unknown) {
            return Err(invalid("no adapter exists for this printer kind"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `http://host:port` with the firmware's default port filled in.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            return match self.port {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
        }
        format!("http://{}:{}", host, self.port.unwrap_or_else(|| default_port(self.kind)))
    }
}

pub fn default_port(kind: PrinterKind) -> u16 {
    match kind {
        PrinterKind::Moonraker => 7125,
        PrinterKind::Sdcp => 3030,
        PrinterKind::Bambu => 8883,
        PrinterKind::OctoPrint | PrinterKind::PrusaLink | PrinterKind::Unknown => 80,
    }
}

/// Retry settings for the REST bindings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// First three octets of the /24 to scan; detected when absent.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default = "default_true")]
    pub mdns: bool,
    #[serde(default = "default_true")]
    pub broadcast: bool,
    #[serde(default = "default_true")]
    pub subnet_scan: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_discovery_timeout_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            subnet: None,
            mdns: true,
            broadcast: true,
            subnet_scan: true,
        }
    }
}

fn default_request_timeout_secs() -> u64 { 10 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_discovery_timeout_secs() -> u64 { 10 }
fn default_probe_timeout_ms() -> u64 { 800 }
fn default_max_concurrency() -> usize { 64 }
fn default_true() -> bool { true }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
