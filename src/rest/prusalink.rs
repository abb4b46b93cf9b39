// src/rest/prusalink.rs - PrusaLink v1 REST binding
use std::path::Path;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde_json::Value;

use crate::adapter::{check_upload_source, remote_name_for, PrinterAdapter};
use crate::config::PrinterConfig;
use crate::error::{AdapterError, ErrorKind};
use crate::rest::storage::{resolve_remote_path, with_storage_fallback};
use crate::rest::{as_f64, as_secs, RestClient, StatusHints};
use crate::types::{
    dedup_files, Capabilities, Capability, CommandResult, DeviceState, JobProgress, PrinterKind,
    PrinterStatus, RemoteFile, UploadResult,
};

const FIRMWARE: &str = "PrusaLink";

/// Storage roots in preference order.
pub const STORAGE_ROOTS: [&str; 2] = ["usb", "local"];

static HINTS: StatusHints = StatusHints {
    unauthorized: "Check the API key shown in the printer's Settings > Network > PrusaLink menu",
    forbidden: "PrusaLink refused access to this storage; check that the USB drive is inserted",
    not_found: "The file is not on the printer; list files to see the stored names",
    conflict: "The printer is busy or has no active job for this request",
};

pub struct PrusaLinkAdapter {
    name: String,
    client: RestClient,
    capabilities: Capabilities,
}

impl PrusaLinkAdapter {
    pub fn new(name: &str, client: RestClient) -> Self {
        Self {
            name: name.to_string(),
            client,
            capabilities: Capabilities::new(true, false, false, true, &["gcode", "bgcode"]),
        }
    }

    pub fn from_config(config: &PrinterConfig) -> Result<Self, AdapterError> {
        let client = RestClient::from_config(config, FIRMWARE, &HINTS)?;
        Ok(Self::new(&config.name, client))
    }

    async fn active_job_id(&self) -> Result<u64, AdapterError> {
        let status = self.client.get_json("/api/v1/status").await?;
        status["job"]["id"].as_u64().ok_or_else(|| {
            AdapterError::new(
                ErrorKind::Conflict,
                format!("{} has no active job. Start a print before controlling it", self.name),
            )
        })
    }

    async fn job_command(&self, method: Method, suffix: &str, done: &str) -> Result<CommandResult, AdapterError> {
        let id = self.active_job_id().await?;
        self.client
            .send(method, &format!("/api/v1/job/{}{}", id, suffix))
            .await?;
        tracing::info!("{}: {} (job {})", self.name, done, id);
        Ok(CommandResult::ok(done))
    }

    /// Runs `method` on a stored file, resolving display names first.
    ///
    /// A resolved `/root/name` path targets that root alone; a bare name goes
    /// through the storage-root fallback.
    async fn file_request(&self, method: Method, input: &str, operation: &str) -> Result<String, AdapterError> {
        let files = match self.list_files().await {
            Ok(files) => files,
            Err(e) => {
                tracing::debug!("{}: listing for name resolution failed: {}", self.name, e);
                Vec::new()
            }
        };
        let resolved = resolve_remote_path(&files, input)?;

        if let Some((root, name)) = split_root(&resolved) {
            let url = self.client.file_url(&format!("/api/v1/files/{}", root), name)?;
            self.client
                .send(method, &url)
                .await
                .map_err(|e| e.context(format!("{} on storage '{}' failed", operation, root)))?;
            return Ok(format!("/{}/{}", root, name));
        }

        let name = resolved.trim_start_matches('/').to_string();
        let (root, ()) = with_storage_fallback(&STORAGE_ROOTS, operation, |root| {
            let url = self.client.file_url(&format!("/api/v1/files/{}", root), &name);
            let method = method.clone();
            async move { self.client.send(method, &url?).await.map(|_| ()) }
        })
        .await?;
        Ok(format!("/{}/{}", root, name))
    }
}

/// Splits `/usb/NAME.BGC` into a known root and the remainder.
fn split_root(path: &str) -> Option<(&'static str, &str)> {
    let trimmed = path.trim_start_matches('/');
    let (head, rest) = trimmed.split_once('/')?;
    STORAGE_ROOTS
        .iter()
        .find(|root| **root == head)
        .map(|root| (*root, rest))
}

fn map_state(state: &str) -> PrinterStatus {
    match state.to_ascii_uppercase().as_str() {
        "IDLE" | "READY" | "FINISHED" | "STOPPED" => PrinterStatus::Idle,
        "BUSY" => PrinterStatus::Busy,
        "PRINTING" => PrinterStatus::Printing,
        "PAUSED" => PrinterStatus::Paused,
        "ERROR" | "ATTENTION" => PrinterStatus::Error,
        _ => PrinterStatus::Unknown,
    }
}

/// Builds a [`DeviceState`] from `GET /api/v1/status`.
pub fn parse_status(body: &Value) -> DeviceState {
    let printer = &body["printer"];
    DeviceState {
        connected: true,
        state: printer["state"].as_str().map(map_state).unwrap_or(PrinterStatus::Unknown),
        tool_temp_actual: as_f64(&printer["temp_nozzle"]),
        tool_temp_target: as_f64(&printer["target_nozzle"]),
        bed_temp_actual: as_f64(&printer["temp_bed"]),
        bed_temp_target: as_f64(&printer["target_bed"]),
        chamber_temp_actual: None,
        chamber_temp_target: None,
    }
}

fn parse_job(body: &Value) -> JobProgress {
    if body.is_null() {
        return JobProgress::empty();
    }
    let mut job = JobProgress::empty().with_completion(as_f64(&body["progress"]));
    let file = &body["file"];
    job.file_name = file["display_name"]
        .as_str()
        .or_else(|| file["name"].as_str())
        .map(str::to_string);
    job.print_time_secs = as_secs(&body["time_printing"]);
    job.print_time_left_secs = as_secs(&body["time_remaining"]);
    job
}

fn collect_children(storage: &str, prefix: &str, children: &Value, out: &mut Vec<RemoteFile>) {
    let Some(entries) = children.as_array() else {
        return;
    };
    for entry in entries {
        let Some(name) = entry["name"].as_str() else {
            continue;
        };
        if entry["type"].as_str() == Some("FOLDER") {
            collect_children(storage, &format!("{}{}/", prefix, name), &entry["children"], out);
            continue;
        }
        out.push(RemoteFile {
            name: entry["display_name"].as_str().unwrap_or(name).to_string(),
            path: format!("/{}/{}{}", storage, prefix, name),
            size: entry["size"].as_u64(),
            modified: entry["m_timestamp"]
                .as_i64()
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        });
    }
}

pub fn parse_files(storage: &str, body: &Value) -> Vec<RemoteFile> {
    let mut files = Vec::new();
    collect_children(storage, "", &body["children"], &mut files);
    files
}

#[async_trait]
impl PrinterAdapter for PrusaLinkAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PrinterKind {
        PrinterKind::PrusaLink
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn get_state(&self) -> Result<DeviceState, AdapterError> {
        match self.client.get_json("/api/v1/status").await {
            Ok(body) => Ok(parse_status(&body)),
            Err(e) if e.is_connectivity() => {
                tracing::warn!("{}: state unavailable, reporting OFFLINE: {}", self.name, e);
                Ok(DeviceState::offline())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_job(&self) -> Result<JobProgress, AdapterError> {
        match self.client.get_json("/api/v1/job").await {
            Ok(body) => Ok(parse_job(&body)),
            Err(e) if e.is_connectivity() => {
                tracing::warn!("{}: job unavailable: {}", self.name, e);
                Ok(JobProgress::empty())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>, AdapterError> {
        let mut files = Vec::new();
        for root in STORAGE_ROOTS {
            match self.client.get_json(&format!("/api/v1/files/{}", root)).await {
                Ok(body) => files.extend(parse_files(root, &body)),
                // an absent USB drive answers 404
                Err(e) if matches!(e.kind(), ErrorKind::NotFound) || e.status() == Some(403) => {
                    tracing::debug!("{}: storage '{}' not listed: {}", self.name, root, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dedup_files(files))
    }

    async fn upload_file(&self, local: &Path, remote_name: Option<&str>) -> Result<UploadResult, AdapterError> {
        self.capabilities.require(Capability::Upload, FIRMWARE)?;
        check_upload_source(local, &self.capabilities, FIRMWARE)?;
        let remote = remote_name_for(local, remote_name)?;
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| AdapterError::validation(format!("Failed to read {}: {}", local.display(), e)).with_source(e))?;
        let data = &data;

        let (root, ()) = with_storage_fallback(&STORAGE_ROOTS, "upload", |root| {
            let url = self.client.file_url(&format!("/api/v1/files/{}", root), &remote);
            async move {
                self.client
                    .execute(Method::PUT, &url?, |rb| {
                        rb.header("Print-After-Upload", "?0")
                            .header("Overwrite", "?1")
                            .header(CONTENT_TYPE, "application/octet-stream")
                            .body(data.clone())
                    })
                    .await
                    .map(|_| ())
            }
        })
        .await?;

        let remote_path = format!("/{}/{}", root, remote);
        tracing::info!("{}: uploaded {} to {}", self.name, local.display(), remote_path);
        Ok(UploadResult {
            success: true,
            message: format!("Uploaded {} to storage '{}'", remote, root),
            remote_path: Some(remote_path),
        })
    }

    async fn delete_file(&self, path: &str) -> Result<CommandResult, AdapterError> {
        let deleted = self.file_request(Method::DELETE, path, "delete").await?;
        Ok(CommandResult::ok(format!("Deleted {}", deleted)))
    }

    async fn start_print(&self, path: &str) -> Result<CommandResult, AdapterError> {
        let started = self.file_request(Method::POST, path, "start print").await?;
        tracing::info!("{}: started {}", self.name, started);
        Ok(CommandResult::ok(format!("Started {}", started)))
    }

    async fn pause_print(&self) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::Pause, FIRMWARE)?;
        self.job_command(Method::PUT, "/pause", "Print paused").await
    }

    async fn resume_print(&self) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::Pause, FIRMWARE)?;
        self.job_command(Method::PUT, "/resume", "Print resumed").await
    }

    async fn cancel_print(&self) -> Result<CommandResult, AdapterError> {
        self.job_command(Method::DELETE, "", "Print cancelled").await
    }

    /// PrusaLink exposes no emergency stop; the active job is stopped instead.
    async fn emergency_stop(&self) -> Result<CommandResult, AdapterError> {
        tracing::warn!("{}: no emergency stop endpoint, stopping the active job", self.name);
        self.job_command(Method::DELETE, "", "Active job stopped").await
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

    async fn get_snapshot(&self) -> Result<Option<Vec<u8>>, AdapterError> {
        match self.client.send(Method::GET, "/api/v1/cameras/snap").await {
            Ok(response) if !response.body.is_empty() => Ok(Some(response.body)),
            Ok(_) => Ok(None),
            Err(e) if e.is_connectivity() || e.kind() == ErrorKind::NotFound => {
                tracing::debug!("{}: no snapshot: {}", self.name, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_stream_url(&self) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }
}
