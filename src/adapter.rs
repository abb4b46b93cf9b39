//! The contract every printer binding implements.
//!
//! Orchestration code only ever talks to a [`PrinterAdapter`]. Retries,
//! backoff and reconnects stay inside the binding; a caller sees one result
//! per call.

use std::path::Path;

use async_trait::async_trait;

use crate::config::PrinterConfig;
use crate::error::{AdapterError, ErrorKind};
use crate::rest::moonraker::MoonrakerAdapter;
use crate::rest::octoprint::OctoPrintAdapter;
use crate::rest::prusalink::PrusaLinkAdapter;
use crate::sdcp::SdcpAdapter;
use crate::types::{
    Capabilities, CommandResult, DeviceState, JobProgress, PrinterKind, RemoteFile, UploadResult,
};

#[async_trait]
pub trait PrinterAdapter: Send + Sync {
    /// Instance name, used in log lines and error messages.
    fn name(&self) -> &str;

    fn kind(&self) -> PrinterKind;

    fn capabilities(&self) -> &Capabilities;

    /// Current state. Degrades to OFFLINE when the printer is unreachable;
    /// raises for authentication, not-found and conflict failures.
    async fn get_state(&self) -> Result<DeviceState, AdapterError>;

    /// Active job progress. Empty when idle or unreachable.
    async fn get_job(&self) -> Result<JobProgress, AdapterError>;

    async fn list_files(&self) -> Result<Vec<RemoteFile>, AdapterError>;

    /// Uploads `local` under `remote_name` (defaults to the local file name).
    ///
    /// # Errors
    ///
    /// `ErrorKind::FileNotFound` when `local` does not exist, before any
    /// network traffic.
    async fn upload_file(
        &self,
        local: &Path,
        remote_name: Option<&str>,
    ) -> Result<UploadResult, AdapterError>;

    async fn delete_file(&self, path: &str) -> Result<CommandResult, AdapterError>;

    async fn start_print(&self, path: &str) -> Result<CommandResult, AdapterError>;

    async fn pause_print(&self) -> Result<CommandResult, AdapterError>;

    async fn resume_print(&self) -> Result<CommandResult, AdapterError>;

    async fn cancel_print(&self) -> Result<CommandResult, AdapterError>;

    async fn emergency_stop(&self) -> Result<CommandResult, AdapterError>;

    async fn set_tool_temp(&self, target: f64, tool: u8) -> Result<CommandResult, AdapterError>;

    async fn set_bed_temp(&self, target: f64) -> Result<CommandResult, AdapterError>;

    async fn send_raw_commands(&self, commands: &[String]) -> Result<CommandResult, AdapterError>;

    /// One camera frame as raw image bytes, or `None` without a camera.
    async fn get_snapshot(&self) -> Result<Option<Vec<u8>>, AdapterError>;

    async fn get_stream_url(&self) -> Result<Option<String>, AdapterError>;

    /// Drops any persistent connection. REST bindings hold none.
    async fn disconnect(&self) {}
}

/// Checks an upload's local preconditions shared by every binding.
pub(crate) fn check_upload_source(
    local: &Path,
    capabilities: &Capabilities,
    firmware: &str,
) -> Result<(), AdapterError> {
    if !local.is_file() {
        return Err(AdapterError::file_not_found(local));
    }
    if !capabilities.accepts_file(local) {
        let mut accepted: Vec<&str> = capabilities.extensions().iter().map(String::as_str).collect();
        accepted.sort_unstable();
        return Err(AdapterError::validation(format!(
            "{} does not accept '{}'; expected one of: {}",
            firmware,
            local.display(),
            accepted.join(", ")
        )));
    }
    Ok(())
}

/// Remote file name for an upload: the caller's choice or the local name.
pub(crate) fn remote_name_for(local: &Path, remote_name: Option<&str>) -> Result<String, AdapterError> {
    match remote_name {
        Some(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
        Some(_) => Err(AdapterError::validation("Remote file name cannot be empty")),
        None => local
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| AdapterError::validation(format!("Cannot derive a file name from {}", local.display()))),
    }
}

pub(crate) fn check_temperature(target: f64) -> Result<(), AdapterError> {
    if !target.is_finite() || !(0.0..=500.0).contains(&target) {
        return Err(AdapterError::validation(format!(
            "Temperature target {} is outside 0-500°C",
            target
        )));
    }
    Ok(())
}

/// Builds the binding matching `config.kind`.
pub fn connect_adapter(config: &PrinterConfig) -> Result<Box<dyn PrinterAdapter>, AdapterError> {
    config
        .validate()
        .map_err(|e| AdapterError::new(ErrorKind::Validation, e.to_string()))?;
    tracing::info!("Creating {} adapter '{}' for {}", config.kind, config.name, config.host);
    let adapter: Box<dyn PrinterAdapter> = match config.kind {
        PrinterKind::OctoPrint => Box::new(OctoPrintAdapter::from_config(config)?),
        PrinterKind::Moonraker => Box::new(MoonrakerAdapter::from_config(config)?),
        PrinterKind::PrusaLink => Box::new(PrusaLinkAdapter::from_config(config)?),
        PrinterKind::Sdcp => Box::new(SdcpAdapter::from_config(config)),
        PrinterKind::Bambu | PrinterKind::Unknown => {
            return Err(AdapterError::unsupported(&config.kind.to_string(), "remote control"));
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_upload_file_is_file_not_found() {
        let caps = Capabilities::new(true, true, true, true, &["gcode"]);
        let err = check_upload_source(Path::new("/nonexistent/part.gcode"), &caps, "Test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }

    #[test]
    fn wrong_extension_is_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part.stl");
        std::fs::write(&path, b"solid").unwrap();
        let caps = Capabilities::new(true, true, true, true, &["gcode"]);
        let err = check_upload_source(&path, &caps, "Test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("gcode"));
    }

    #[test]
    fn remote_name_defaults_to_local() {
        let name = remote_name_for(Path::new("/tmp/benchy.gcode"), None).unwrap();
        assert_eq!(name, "benchy.gcode");
        assert!(remote_name_for(Path::new("/tmp/benchy.gcode"), Some("  ")).is_err());
    }

    #[test]
    fn factory_refuses_bambu() {
        let config = PrinterConfig::new("x1", PrinterKind::Bambu, "10.0.0.5");
        assert!(connect_adapter(&config).is_err());
    }

    #[tokio::test]
    async fn factory_builds_matching_binding() {
        let config = PrinterConfig::new("voron", PrinterKind::Moonraker, "10.0.0.10");
        let adapter = connect_adapter(&config).unwrap();
        assert_eq!(adapter.kind(), PrinterKind::Moonraker);
        assert_eq!(adapter.name(), "voron");
    }
}
