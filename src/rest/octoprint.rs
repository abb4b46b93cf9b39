// src/rest/octoprint.rs - OctoPrint REST binding
use std::path::Path;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::{json, Value};

use crate::adapter::{check_temperature, check_upload_source, remote_name_for, PrinterAdapter};
use crate::config::PrinterConfig;
use crate::error::{AdapterError, ErrorKind};
use crate::rest::{as_f64, as_secs, RestClient, StatusHints};
use crate::types::{
    dedup_files, Capabilities, Capability, CommandResult, DeviceState, JobProgress, PrinterKind,
    PrinterStatus, RemoteFile, UploadResult,
};

const FIRMWARE: &str = "OctoPrint";

static HINTS: StatusHints = StatusHints {
    unauthorized: "Check the API key under OctoPrint Settings > Application Keys",
    forbidden: "The API key lacks the required permission; check the user's role in OctoPrint Access Control",
    not_found: "Check the file path in OctoPrint's local storage",
    conflict: "OctoPrint is not connected to the printer or is busy; connect it from the OctoPrint UI first",
};

pub struct OctoPrintAdapter {
    name: String,
    client: RestClient,
    capabilities: Capabilities,
    webcam_url: Option<String>,
}

impl OctoPrintAdapter {
    pub fn new(name: &str, client: RestClient, webcam_url: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            client,
            capabilities: Capabilities::new(true, true, true, true, &["gcode", "gco", "g"]),
            webcam_url,
        }
    }

    pub fn from_config(config: &PrinterConfig) -> Result<Self, AdapterError> {
        let client = RestClient::from_config(config, FIRMWARE, &HINTS)?;
        Ok(Self::new(&config.name, client, config.webcam_url.clone()))
    }

    async fn post_command(&self, path: &str, body: Value, done: &str) -> Result<CommandResult, AdapterError> {
        self.client.post_json(path, &body).await?;
        tracing::info!("{}: {}", self.name, done);
        Ok(CommandResult::ok(done))
    }

    fn snapshot_url(&self) -> String {
        match &self.webcam_url {
            Some(url) if url.starts_with("http") => url.clone(),
            Some(path) => self.client.url(path),
            None => self.client.url("/webcam/?action=snapshot"),
        }
    }
}

/// Maps `/api/printer` state flags to the common status.
pub fn parse_state(body: &Value) -> PrinterStatus {
    let flags = &body["state"]["flags"];
    let flag = |name: &str| flags[name].as_bool().unwrap_or(false);
    if flags.is_null() {
        return PrinterStatus::Unknown;
    }
    if flag("error") || (flag("closedOrError") && !flag("operational")) {
        PrinterStatus::Error
    } else if flag("cancelling") {
        PrinterStatus::Cancelling
    } else if flag("paused") || flag("pausing") {
        PrinterStatus::Paused
    } else if flag("printing") {
        PrinterStatus::Printing
    } else if flag("ready") || flag("operational") {
        PrinterStatus::Idle
    } else {
        PrinterStatus::Unknown
    }
}

/// Builds a [`DeviceState`] from an `/api/printer` body.
pub fn parse_printer(body: &Value) -> DeviceState {
    let temps = &body["temperature"];
    let tool = ["tool0", "tool"]
        .iter()
        .map(|k| &temps[*k])
        .find(|v| !v.is_null())
        .unwrap_or(&Value::Null);
    DeviceState {
        connected: true,
        state: parse_state(body),
        tool_temp_actual: as_f64(&tool["actual"]),
        tool_temp_target: as_f64(&tool["target"]),
        bed_temp_actual: as_f64(&temps["bed"]["actual"]),
        bed_temp_target: as_f64(&temps["bed"]["target"]),
        chamber_temp_actual: as_f64(&temps["chamber"]["actual"]),
        chamber_temp_target: as_f64(&temps["chamber"]["target"]),
    }
}

fn parse_job(body: &Value) -> JobProgress {
    let file = &body["job"]["file"];
    let file_name = file["display"]
        .as_str()
        .or_else(|| file["name"].as_str())
        .map(str::to_string);
    let progress = &body["progress"];
    let mut job = JobProgress::empty().with_completion(as_f64(&progress["completion"]));
    job.file_name = file_name;
    job.print_time_secs = as_secs(&progress["printTime"]);
    job.print_time_left_secs = as_secs(&progress["printTimeLeft"]);
    job
}

fn collect_files(entries: &Value, out: &mut Vec<RemoteFile>) {
    let Some(entries) = entries.as_array() else {
        return;
    };
    for entry in entries {
        if entry["type"].as_str() == Some("folder") {
            collect_files(&entry["children"], out);
            continue;
        }
        let Some(path) = entry["path"].as_str().or_else(|| entry["name"].as_str()) else {
            continue;
        };
        out.push(RemoteFile {
            name: entry["display"]
                .as_str()
                .or_else(|| entry["name"].as_str())
                .unwrap_or(path)
                .to_string(),
            path: path.to_string(),
            size: entry["size"].as_u64(),
            modified: entry["date"].as_i64().and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        });
    }
}

#[async_trait]
impl PrinterAdapter for OctoPrintAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PrinterKind {
        PrinterKind::OctoPrint
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn get_state(&self) -> Result<DeviceState, AdapterError> {
        match self.client.get_json("/api/printer").await {
            Ok(body) => Ok(parse_printer(&body)),
            Err(e) if e.is_connectivity() => {
                tracing::warn!("{}: state unavailable, reporting OFFLINE: {}", self.name, e);
                Ok(DeviceState::offline())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_job(&self) -> Result<JobProgress, AdapterError> {
        match self.client.get_json("/api/job").await {
            Ok(body) => Ok(parse_job(&body)),
            Err(e) if e.is_connectivity() => {
                tracing::warn!("{}: job unavailable: {}", self.name, e);
                Ok(JobProgress::empty())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>, AdapterError> {
        let body = self.client.get_json("/api/files?recursive=true").await?;
        let mut files = Vec::new();
        collect_files(&body["files"], &mut files);
        Ok(dedup_files(files))
    }

    async fn upload_file(&self, local: &Path, remote_name: Option<&str>) -> Result<UploadResult, AdapterError> {
        self.capabilities.require(Capability::Upload, FIRMWARE)?;
        check_upload_source(local, &self.capabilities, FIRMWARE)?;
        let remote = remote_name_for(local, remote_name)?;
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| AdapterError::validation(format!("Failed to read {}: {}", local.display(), e)).with_source(e))?;

        let response = self
            .client
            .execute(Method::POST, "/api/files/local", |rb| {
                let part = Part::bytes(data.clone()).file_name(remote.clone());
                rb.multipart(Form::new().part("file", part))
            })
            .await?;
        let body = response.json_value().unwrap_or(Value::Null);
        let path = body["files"]["local"]["path"].as_str().unwrap_or(&remote).to_string();
        tracing::info!("{}: uploaded {} as {}", self.name, local.display(), path);
        Ok(UploadResult {
            success: true,
            message: format!("Uploaded {} to local/{}", remote, path),
            remote_path: Some(path),
        })
    }

    async fn delete_file(&self, path: &str) -> Result<CommandResult, AdapterError> {
        let path = path.trim_start_matches('/');
        let url = self.client.file_url("/api/files/local", path)?;
        self.client.send(Method::DELETE, &url).await?;
        Ok(CommandResult::ok(format!("Deleted {}", path)))
    }

    async fn start_print(&self, path: &str) -> Result<CommandResult, AdapterError> {
        let path = path.trim_start_matches('/');
        self.post_command(
            &self.client.file_url("/api/files/local", path)?,
            json!({"command": "select", "print": true}),
            &format!("Started {}", path),
        )
        .await
    }

    async fn pause_print(&self) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::Pause, FIRMWARE)?;
        self.post_command("/api/job", json!({"command": "pause", "action": "pause"}), "Print paused")
            .await
    }

    async fn resume_print(&self) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::Pause, FIRMWARE)?;
        self.post_command("/api/job", json!({"command": "pause", "action": "resume"}), "Print resumed")
            .await
    }

    async fn cancel_print(&self) -> Result<CommandResult, AdapterError> {
        self.post_command("/api/job", json!({"command": "cancel"}), "Print cancelled")
            .await
    }

    async fn emergency_stop(&self) -> Result<CommandResult, AdapterError> {
        self.post_command(
            "/api/printer/command",
            json!({"commands": ["M112"]}),
            "Emergency stop sent",
        )
        .await
    }

    async fn set_tool_temp(&self, target: f64, tool: u8) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::TemperatureControl, FIRMWARE)?;
        check_temperature(target)?;
        let key = format!("tool{}", tool);
        let mut targets = serde_json::Map::new();
        targets.insert(key.clone(), json!(target));
        self.post_command(
            "/api/printer/tool",
            json!({"command": "target", "targets": targets}),
            &format!("{} target set to {}°C", key, target),
        )
        .await
    }

    async fn set_bed_temp(&self, target: f64) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::TemperatureControl, FIRMWARE)?;
        check_temperature(target)?;
        self.post_command(
            "/api/printer/bed",
            json!({"command": "target", "target": target}),
            &format!("Bed target set to {}°C", target),
        )
        .await
    }

    async fn send_raw_commands(&self, commands: &[String]) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::RawCommands, FIRMWARE)?;
        if commands.is_empty() {
            return Err(AdapterError::validation("No commands to send"));
        }
        self.post_command(
            "/api/printer/command",
            json!({ "commands": commands }),
            &format!("Sent {} command(s)", commands.len()),
        )
        .await
    }

    async fn get_snapshot(&self) -> Result<Option<Vec<u8>>, AdapterError> {
        let url = self.snapshot_url();
        match self.client.send(Method::GET, &url).await {
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
        Ok(Some(self.client.url("/webcam/?action=stream")))
    }
}
