// src/types.rs - Value model shared by every adapter
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

/// Protocol family of a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterKind {
    OctoPrint,
    Moonraker,
    PrusaLink,
    Sdcp,
    /// Reachable on its MQTT port only; no adapter in this crate.
    Bambu,
    Unknown,
}

impl fmt::Display for PrinterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OctoPrint => write!(f, "OctoPrint"),
            Self::Moonraker => write!(f, "Moonraker"),
            Self::PrusaLink => write!(f, "PrusaLink"),
            Self::Sdcp => write!(f, "SDCP"),
            Self::Bambu => write!(f, "Bambu"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Operation groups a binding may disclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Upload,
    TemperatureControl,
    RawCommands,
    Pause,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "file upload"),
            Self::TemperatureControl => write!(f, "temperature control"),
            Self::RawCommands => write!(f, "raw G-code commands"),
            Self::Pause => write!(f, "pause/resume"),
        }
    }
}

/// What an adapter instance can do. Fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    can_upload: bool,
    can_set_temperature: bool,
    can_send_commands: bool,
    can_pause: bool,
    extensions: HashSet<String>,
}

impl Capabilities {
    pub fn new(
        can_upload: bool,
        can_set_temperature: bool,
        can_send_commands: bool,
        can_pause: bool,
        extensions: &[&str],
    ) -> Self {
        Self {
            can_upload,
            can_set_temperature,
            can_send_commands,
            can_pause,
            extensions: extensions.iter().map(|e| e.trim_start_matches('.').to_ascii_lowercase()).collect(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Upload => self.can_upload,
            Capability::TemperatureControl => self.can_set_temperature,
            Capability::RawCommands => self.can_send_commands,
            Capability::Pause => self.can_pause,
        }
    }

    pub fn extensions(&self) -> &HashSet<String> {
        &self.extensions
    }

    pub fn accepts_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Fails with `Unsupported` when the capability is disclaimed.
    pub fn require(&self, capability: Capability, firmware: &str) -> Result<(), AdapterError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(AdapterError::unsupported(firmware, &capability.to_string()))
        }
    }
}

/// Common printer state, mapped from each firmware's own vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrinterStatus {
    Idle,
    Busy,
    Printing,
    Paused,
    Error,
    Cancelling,
    Offline,
    #[default]
    Unknown,
}

impl fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "IDLE",
            Self::Busy => "BUSY",
            Self::Printing => "PRINTING",
            Self::Paused => "PAUSED",
            Self::Error => "ERROR",
            Self::Cancelling => "CANCELLING",
            Self::Offline => "OFFLINE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(text)
    }
}

/// Snapshot of a printer's state, computed fresh per call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub connected: bool,
    pub state: PrinterStatus,
    pub tool_temp_actual: Option<f64>,
    pub tool_temp_target: Option<f64>,
    pub bed_temp_actual: Option<f64>,
    pub bed_temp_target: Option<f64>,
    pub chamber_temp_actual: Option<f64>,
    pub chamber_temp_target: Option<f64>,
}

impl DeviceState {
    pub fn offline() -> Self {
        Self {
            connected: false,
            state: PrinterStatus::Offline,
            ..Default::default()
        }
    }
}

/// Progress of the active job. All fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub file_name: Option<String>,
    completion: Option<f64>,
    pub print_time_secs: Option<u64>,
    pub print_time_left_secs: Option<u64>,
}

impl JobProgress {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sets the completion percentage, clamped to [0, 100]. NaN is dropped.
    pub fn with_completion(mut self, percent: Option<f64>) -> Self {
        self.completion = percent.filter(|p| !p.is_nan()).map(|p| p.clamp(0.0, 100.0));
        self
    }

    pub fn completion(&self) -> Option<f64> {
        self.completion
    }

    pub fn is_empty(&self) -> bool {
        self.file_name.is_none()
            && self.completion.is_none()
            && self.print_time_secs.is_none()
            && self.print_time_left_secs.is_none()
    }
}

/// A file stored on the printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Human readable name, possibly longer than the wire path.
    pub name: String,
    /// Protocol-addressable path.
    pub path: String,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteFile {
    /// Last path component of `path`.
    pub fn basename(&self) -> &str {
        basename(&self.path)
    }
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Drops later entries whose path matches an earlier one, ignoring case.
pub fn dedup_files(files: Vec<RemoteFile>) -> Vec<RemoteFile> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|f| seen.insert(f.path.to_lowercase()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub message: String,
    /// Remote path the file was stored under.
    pub remote_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_is_clamped() {
        assert_eq!(JobProgress::empty().with_completion(Some(140.0)).completion(), Some(100.0));
        assert_eq!(JobProgress::empty().with_completion(Some(-3.0)).completion(), Some(0.0));
        assert_eq!(JobProgress::empty().with_completion(Some(f64::NAN)).completion(), None);
    }

    #[test]
    fn capabilities_gate_operations() {
        let caps = Capabilities::new(true, false, true, true, &["gcode", ".BGCODE"]);
        assert!(caps.require(Capability::Upload, "Test").is_ok());
        let err = caps.require(Capability::TemperatureControl, "Test").unwrap_err();
        assert!(err.to_string().contains("temperature control"));
        assert!(caps.accepts_file(Path::new("/tmp/part.bgcode")));
        assert!(!caps.accepts_file(Path::new("/tmp/part.stl")));
    }

    #[test]
    fn files_dedup_case_insensitive() {
        let file = |path: &str| RemoteFile {
            name: path.to_string(),
            path: path.to_string(),
            size: None,
            modified: None,
        };
        let files = dedup_files(vec![file("usb/A.gcode"), file("USB/a.GCODE"), file("usb/b.gcode")]);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "usb/A.gcode");
    }
}
