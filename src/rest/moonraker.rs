// src/rest/moonraker.rs - Moonraker (Klipper) REST binding
use std::path::Path;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::Value;

use crate::adapter::{check_temperature, check_upload_source, remote_name_for, PrinterAdapter};
use crate::config::PrinterConfig;
use crate::error::{AdapterError, ErrorKind};
use crate::rest::{as_f64, as_secs, RestClient, StatusHints};
use crate::types::{
    dedup_files, Capabilities, Capability, CommandResult, DeviceState, JobProgress, PrinterKind,
    PrinterStatus, RemoteFile, UploadResult,
};

const FIRMWARE: &str = "Moonraker";

const STATUS_QUERY: &str =
    "/printer/objects/query?webhooks&print_stats&extruder&heater_bed&virtual_sdcard&display_status";

static HINTS: StatusHints = StatusHints {
    unauthorized: "Moonraker requires authorization; set api_key or add this host to trusted_clients in moonraker.conf",
    forbidden: "Moonraker refused the request; check [authorization] trusted_clients in moonraker.conf",
    not_found: "Check the file path under the gcodes root",
    conflict: "Klipper is busy with another job; wait for it to finish or cancel it",
};

pub struct MoonrakerAdapter {
    name: String,
    client: RestClient,
    capabilities: Capabilities,
    webcam_url: Option<String>,
}

impl MoonrakerAdapter {
    pub fn new(name: &str, client: RestClient, webcam_url: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            client,
            capabilities: Capabilities::new(true, true, true, true, &["gcode", "g", "gco"]),
            webcam_url,
        }
    }

    pub fn from_config(config: &PrinterConfig) -> Result<Self, AdapterError> {
        let client = RestClient::from_config(config, FIRMWARE, &HINTS)?;
        Ok(Self::new(&config.name, client, config.webcam_url.clone()))
    }

    async fn post(&self, path: &str, done: &str) -> Result<CommandResult, AdapterError> {
        self.client.send(Method::POST, path).await?;
        tracing::info!("{}: {}", self.name, done);
        Ok(CommandResult::ok(done))
    }

    async fn run_script(&self, script: &str, done: &str) -> Result<CommandResult, AdapterError> {
        self.client
            .execute(Method::POST, "/printer/gcode/script", |rb| rb.query(&[("script", script)]))
            .await?;
        tracing::info!("{}: {}", self.name, done);
        Ok(CommandResult::ok(done))
    }

    /// Fallback when the object query is refused: Klippy itself may be down.
    /// A Klippy that claims to be ready says nothing about the print, so
    /// that reads as UNKNOWN.
    async fn klippy_state(&self) -> Option<PrinterStatus> {
        let info = self.client.get_json("/server/info").await.ok()?;
        let state = info["result"]["klippy_state"].as_str()?;
        Some(map_webhooks_state(state).unwrap_or(PrinterStatus::Unknown))
    }
}

fn map_webhooks_state(state: &str) -> Option<PrinterStatus> {
    match state {
        "shutdown" | "error" => Some(PrinterStatus::Error),
        "startup" => Some(PrinterStatus::Busy),
        "disconnected" => Some(PrinterStatus::Offline),
        _ => None,
    }
}

fn map_print_stats(state: &str) -> PrinterStatus {
    match state {
        "printing" => PrinterStatus::Printing,
        "paused" => PrinterStatus::Paused,
        "standby" | "complete" | "cancelled" => PrinterStatus::Idle,
        "error" => PrinterStatus::Error,
        _ => PrinterStatus::Unknown,
    }
}

/// Builds a [`DeviceState`] from an objects query result.
pub fn parse_status(body: &Value) -> DeviceState {
    let status = &body["result"]["status"];
    let webhooks = status["webhooks"]["state"].as_str().and_then(map_webhooks_state);
    let state = match webhooks {
        Some(state) => state,
        None => status["print_stats"]["state"]
            .as_str()
            .map(map_print_stats)
            .unwrap_or(PrinterStatus::Unknown),
    };
    DeviceState {
        connected: true,
        state,
        tool_temp_actual: as_f64(&status["extruder"]["temperature"]),
        tool_temp_target: as_f64(&status["extruder"]["target"]),
        bed_temp_actual: as_f64(&status["heater_bed"]["temperature"]),
        bed_temp_target: as_f64(&status["heater_bed"]["target"]),
        chamber_temp_actual: None,
        chamber_temp_target: None,
    }
}

fn parse_job(body: &Value) -> JobProgress {
    let status = &body["result"]["status"];
    let stats = &status["print_stats"];
    let fraction = as_f64(&status["virtual_sdcard"]["progress"])
        .or_else(|| as_f64(&status["display_status"]["progress"]));
    let elapsed = as_f64(&stats["print_duration"]);

    let mut job = JobProgress::empty().with_completion(fraction.map(|f| f * 100.0));
    job.file_name = stats["filename"].as_str().filter(|f| !f.is_empty()).map(str::to_string);
    job.print_time_secs = as_secs(&stats["print_duration"]);
    job.print_time_left_secs = match (elapsed, fraction) {
        (Some(elapsed), Some(fraction)) if fraction > 0.0 && fraction <= 1.0 => {
            Some((elapsed / fraction - elapsed).max(0.0).round() as u64)
        }
        _ => None,
    };
    job
}

fn parse_files(body: &Value) -> Vec<RemoteFile> {
    let Some(entries) = body["result"].as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let path = entry["path"].as_str().or_else(|| entry["filename"].as_str())?;
            Some(RemoteFile {
                name: path.to_string(),
                path: path.to_string(),
                size: entry["size"].as_u64(),
                modified: as_f64(&entry["modified"])
                    .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single()),
            })
        })
        .collect()
}

#[async_trait]
impl PrinterAdapter for MoonrakerAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PrinterKind {
        PrinterKind::Moonraker
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn get_state(&self) -> Result<DeviceState, AdapterError> {
        match self.client.get_json(STATUS_QUERY).await {
            Ok(body) => Ok(parse_status(&body)),
            Err(e) if e.is_connectivity() => {
                tracing::warn!("{}: state unavailable, reporting OFFLINE: {}", self.name, e);
                Ok(DeviceState::offline())
            }
            Err(e) if e.kind() == ErrorKind::Unavailable => match self.klippy_state().await {
                Some(state) => Ok(DeviceState {
                    connected: true,
                    state,
                    ..Default::default()
                }),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn get_job(&self) -> Result<JobProgress, AdapterError> {
        match self.client.get_json(STATUS_QUERY).await {
            Ok(body) => Ok(parse_job(&body)),
            Err(e) if e.is_connectivity() => {
                tracing::warn!("{}: job unavailable: {}", self.name, e);
                Ok(JobProgress::empty())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>, AdapterError> {
        let body = self.client.get_json("/server/files/list?root=gcodes").await?;
        Ok(dedup_files(parse_files(&body)))
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
            .execute(Method::POST, "/server/files/upload", |rb| {
                let part = Part::bytes(data.clone()).file_name(remote.clone());
                rb.multipart(Form::new().text("root", "gcodes").part("file", part))
            })
            .await?;
        let body = response.json_value().unwrap_or(Value::Null);
        let path = body["result"]["item"]["path"]
            .as_str()
            .or_else(|| body["result"].as_str())
            .unwrap_or(&remote)
            .to_string();
        tracing::info!("{}: uploaded {} as {}", self.name, local.display(), path);
        Ok(UploadResult {
            success: true,
            message: format!("Uploaded {} to gcodes/{}", remote, path),
            remote_path: Some(path),
        })
    }

    async fn delete_file(&self, path: &str) -> Result<CommandResult, AdapterError> {
        let path = path.trim_start_matches('/').trim_start_matches("gcodes/");
        let url = self.client.file_url("/server/files/gcodes", path)?;
        self.client.send(Method::DELETE, &url).await?;
        Ok(CommandResult::ok(format!("Deleted {}", path)))
    }

    async fn start_print(&self, path: &str) -> Result<CommandResult, AdapterError> {
        let path = path.trim_start_matches('/').trim_start_matches("gcodes/");
        self.client
            .execute(Method::POST, "/printer/print/start", |rb| rb.query(&[("filename", path)]))
            .await?;
        tracing::info!("{}: started {}", self.name, path);
        Ok(CommandResult::ok(format!("Started {}", path)))
    }

    async fn pause_print(&self) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::Pause, FIRMWARE)?;
        self.post("/printer/print/pause", "Print paused").await
    }

    async fn resume_print(&self) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::Pause, FIRMWARE)?;
        self.post("/printer/print/resume", "Print resumed").await
    }

    async fn cancel_print(&self) -> Result<CommandResult, AdapterError> {
        self.post("/printer/print/cancel", "Print cancelled").await
    }

    async fn emergency_stop(&self) -> Result<CommandResult, AdapterError> {
        self.post("/printer/emergency_stop", "Emergency stop sent").await
    }

    async fn set_tool_temp(&self, target: f64, tool: u8) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::TemperatureControl, FIRMWARE)?;
        check_temperature(target)?;
        let heater = if tool == 0 {
            "extruder".to_string()
        } else {
            format!("extruder{}", tool)
        };
        self.run_script(
            &format!("SET_HEATER_TEMPERATURE HEATER={} TARGET={}", heater, target),
            &format!("{} target set to {}°C", heater, target),
        )
        .await
    }

    async fn set_bed_temp(&self, target: f64) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::TemperatureControl, FIRMWARE)?;
        check_temperature(target)?;
        self.run_script(
            &format!("SET_HEATER_TEMPERATURE HEATER=heater_bed TARGET={}", target),
            &format!("Bed target set to {}°C", target),
        )
        .await
    }

    async fn send_raw_commands(&self, commands: &[String]) -> Result<CommandResult, AdapterError> {
        self.capabilities.require(Capability::RawCommands, FIRMWARE)?;
        if commands.is_empty() {
            return Err(AdapterError::validation("No commands to send"));
        }
        self.run_script(&commands.join("\n"), &format!("Sent {} command(s)", commands.len()))
            .await
    }

    async fn get_snapshot(&self) -> Result<Option<Vec<u8>>, AdapterError> {
        let url = match &self.webcam_url {
            Some(url) => self.client.url(url),
            None => self.client.url("/webcam/?action=snapshot"),
        };
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
