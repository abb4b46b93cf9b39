//! SDCP binding: JSON frames over a persistent WebSocket.
//!
//! The printer only talks through `ws://host:3030/websocket`. Replies are
//! matched to requests by `RequestID`; status broadcasts land in a cache that
//! [`PrinterAdapter::get_state`] reads from. Uploads are reverse-pulled: the
//! adapter serves the file over HTTP and tells the printer where to fetch it.

pub mod backoff;
pub mod connection;
pub mod frames;
pub mod pull_server;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use serde_json::{json, Value};

use crate::adapter::{check_upload_source, remote_name_for, PrinterAdapter};
use crate::config::{default_port, PrinterConfig};
use crate::discovery::subnet::local_ip_toward;
use crate::error::{AdapterError, ErrorKind};
use crate::types::{
    basename, dedup_files, Capabilities, Capability, CommandResult, DeviceState, JobProgress,
    PrinterKind, RemoteFile, UploadResult,
};

use backoff::ConnectionBackoff;
use connection::SdcpConnection;
use frames::{
    CMD_DELETE_FILES, CMD_ENABLE_VIDEO, CMD_LIST_FILES, CMD_PAUSE, CMD_RESUME,
    CMD_START_PRINT, CMD_STOP, CMD_UPLOAD_URL,
};
use pull_server::{md5_hex, PullServer};

const FIRMWARE: &str = "SDCP";

/// Tunables for one SDCP adapter.
#[derive(Debug, Clone)]
pub struct SdcpOptions {
    pub port: u16,
    pub command_timeout: Duration,
    pub status_wait: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub status_freshness: Duration,
    pub pull_timeout: Duration,
    pub connect_timeout: Duration,
    pub mainboard_id: Option<String>,
    pub advertise_host: Option<String>,
}

impl Default for SdcpOptions {
    fn default() -> Self {
        Self {
            port: default_port(PrinterKind::Sdcp),
            command_timeout: Duration::from_secs(10),
            status_wait: Duration::from_secs(3),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            status_freshness: Duration::from_secs(30),
            pull_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            mainboard_id: None,
            advertise_host: None,
        }
    }
}

pub struct SdcpAdapter {
    name: String,
    host: String,
    options: SdcpOptions,
    capabilities: Capabilities,
    connection: SdcpConnection,
}

impl SdcpAdapter {
    pub fn new(name: &str, host: &str, options: SdcpOptions) -> Self {
        let connection = SdcpConnection::new(
            host,
            options.port,
            options.mainboard_id.clone(),
            ConnectionBackoff::new(options.backoff_base, options.backoff_cap),
            options.connect_timeout,
            options.command_timeout,
            options.status_wait,
        );
        Self {
            name: name.to_string(),
            host: host.to_string(),
            options,
            capabilities: Capabilities::new(true, false, false, true, &["gcode", "ctb", "goo"]),
            connection,
        }
    }

    pub fn from_config(config: &PrinterConfig) -> Self {
        let options = SdcpOptions {
            port: config.port.unwrap_or_else(|| default_port(PrinterKind::Sdcp)),
            command_timeout: config.request_timeout(),
            mainboard_id: config.mainboard_id.clone(),
            advertise_host: config.advertise_host.clone(),
            ..SdcpOptions::default()
        };
        Self::new(&config.name, &config.host, options)
    }

    pub fn connection(&self) -> &SdcpConnection {
        &self.connection
    }

    /// Latest status payload: refreshed when possible, cached otherwise.
    async fn status_payload(&self) -> Option<Value> {
        if let Err(e) = self.connection.refresh_status(self.options.status_wait).await {
            tracing::debug!("{}: status refresh failed: {}", self.name, e);
        }
        self.connection
            .cached("Status", self.options.status_freshness)
            .await
    }

    async fn checked(&self, cmd: u32, data: Value, done: &str) -> Result<CommandResult, AdapterError> {
        self.connection.send_checked(cmd, data).await?;
        tracing::info!("{}: {}", self.name, done);
        Ok(CommandResult::ok(done))
    }

    /// Tells the printer where to fetch the file and waits for it to do so.
    async fn offer_upload(&self, server: &PullServer, request: Value, url: &str, advertise: &str) -> Result<(), AdapterError> {
        self.connection.send_checked(CMD_UPLOAD_URL, request).await?;
        if server.wait_for_pull(self.options.pull_timeout).await {
            return Ok(());
        }
        Err(AdapterError::new(
            ErrorKind::Timeout,
            format!(
                "{} accepted the upload but never fetched {} within {:?}. Check that the printer can reach {}",
                self.name, url, self.options.pull_timeout, advertise
            ),
        ))
    }

    fn advertise_host(&self) -> Result<String, AdapterError> {
        if let Some(host) = &self.options.advertise_host {
            return Ok(host.clone());
        }
        let target = format!("{}:{}", self.host, self.options.port);
        local_ip_toward(&target).map(|ip| ip.to_string()).map_err(|e| {
            AdapterError::connectivity(format!(
                "Could not determine which local address {} can reach; set advertise_host",
                self.host
            ))
            .with_source(e)
        })
    }
}

/// Printer-side path for a caller-supplied file identifier.
fn device_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/local/{}", path)
    }
}

fn parse_file_list(data: &Value) -> Vec<RemoteFile> {
    let Some(entries) = data["FileList"].as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|entry| entry["type"].as_i64() != Some(0))
        .filter_map(|entry| {
            let path = entry["name"].as_str()?;
            Some(RemoteFile {
                name: basename(path).to_string(),
                path: path.to_string(),
                size: entry["FileSize"].as_u64().or_else(|| entry["size"].as_u64()),
                modified: None,
            })
        })
        .collect()
}

#[async_trait]
impl PrinterAdapter for SdcpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PrinterKind {
        PrinterKind::Sdcp
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Never raises: a stale or missing cache reports OFFLINE.
    async fn get_state(&self) -> Result<DeviceState, AdapterError> {
        Ok(match self.status_payload().await {
            Some(status) => frames::parse_status(&status),
            None => DeviceState::offline(),
        })
    }

    async fn get_job(&self) -> Result<JobProgress, AdapterError> {
        Ok(match self.status_payload().await {
            Some(status) => frames::parse_job(&status),
            None => JobProgress::empty(),
        })
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>, AdapterError> {
        let data = self
            .connection
            .send_checked(CMD_LIST_FILES, json!({"Url": "/local"}))
            .await?;
        Ok(dedup_files(parse_file_list(&data)))
    }

    async fn upload_file(&self, local: &Path, remote_name: Option<&str>) -> Result<UploadResult, AdapterError> {
        self.capabilities.require(Capability::Upload, FIRMWARE)?;
        check_upload_source(local, &self.capabilities, FIRMWARE)?;
        let remote = remote_name_for(local, remote_name)?;
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| AdapterError::validation(format!("Failed to read {}: {}", local.display(), e)).with_source(e))?;
        let size = data.len();
        let md5 = md5_hex(&data);

        // fail fast on cooldown before opening a listener
        self.connection.ensure_connected().await?;
        let advertise = self.advertise_host()?;
        let server = PullServer::start(&remote, Bytes::from(data)).await?;
        let url = match server.url_for(&advertise) {
            Ok(url) => url,
            Err(e) => {
                server.shutdown().await;
                return Err(e);
            }
        };
        tracing::info!("{}: offering {} ({} bytes) at {}", self.name, remote, size, url);

        let request = json!({
            "Check": 0,
            "CleanCache": 1,
            "Compress": 0,
            "FileSize": size,
            "Filename": remote,
            "MD5": md5,
            "URL": url,
        });
        let outcome = self.offer_upload(&server, request, &url, &advertise).await;
        server.shutdown().await;
        outcome?;

        Ok(UploadResult {
            success: true,
            message: format!("{} fetched {} ({} bytes)", self.name, remote, size),
            remote_path: Some(device_path(&remote)),
        })
    }

    async fn delete_file(&self, path: &str) -> Result<CommandResult, AdapterError> {
        let target = device_path(path);
        self.checked(
            CMD_DELETE_FILES,
            json!({"FileList": [target], "FolderList": []}),
            &format!("Deleted {}", target),
        )
        .await
    }

    async fn start_print(&self, path: &str) -> Result<CommandResult, AdapterError> {
        self.checked(
            CMD_START_PRINT,
            json!({"Filename": path, "StartLayer": 0}),
            &format!("Started {}", path),
        )
        .await
    }

    async fn pause_print(&self) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::Pause, FIRMWARE)?;
        self.checked(CMD_PAUSE, json!({}), "Print paused").await
    }

    async fn resume_print(&self) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::Pause, FIRMWARE)?;
        self.checked(CMD_RESUME, json!({}), "Print resumed").await
    }

    async fn cancel_print(&self) -> Result<CommandResult, AdapterError> {
        self.checked(CMD_STOP, json!({}), "Print cancelled").await
    }

    async fn emergency_stop(&self) -> Result<CommandResult, AdapterError> {
        self.connection.send(CMD_STOP, json!({})).await?;
        tracing::warn!("{}: emergency stop sent", self.name);
        Ok(CommandResult::ok("Stop sent without waiting for acknowledgement"))
    }

    async fn set_tool_temp(&self, _target: f64, _tool: u8) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::TemperatureControl, FIRMWARE)?;
        Err(AdapterError::unsupported(FIRMWARE, "temperature control"))
    }

    async fn set_bed_temp(&self, _target: f64) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::TemperatureControl, FIRMWARE)?;
        Err(AdapterError::unsupported(FIRMWARE, "temperature control"))
    }

    async fn send_raw_commands(&self, _commands: &[String]) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::RawCommands, FIRMWARE)?;
        Err(AdapterError::unsupported(FIRMWARE, "raw G-code commands"))
    }

    /// SDCP offers a video stream but no still frames.
    async fn get_snapshot(&self) -> Result<Option<Vec<u8>>, AdapterError> {
        Ok(None)
    }

    async fn get_stream_url(&self) -> Result<Option<String>, AdapterError> {
        let data = self
            .connection
            .send_checked(CMD_ENABLE_VIDEO, json!({"Enable": 1}))
            .await?;
        Ok(data["VideoUrl"].as_str().filter(|u| !u.is_empty()).map(|u| {
            if u.contains("://") {
                u.to_string()
            } else {
                format!("http://{}", u)
            }
        }))
    }

    async fn disconnect(&self) {
        self.connection.disconnect().await;
    }
}
