// src/sdcp/frames.rs - SDCP wire frames, command codes and state table
use chrono::Utc;
use serde_json::{json, Value};

use crate::rest::{as_f64, as_secs};
use crate::types::{DeviceState, JobProgress, PrinterStatus};

pub const CMD_STATUS: u32 = 0;
pub const CMD_ATTRIBUTES: u32 = 1;
pub const CMD_START_PRINT: u32 = 128;
pub const CMD_PAUSE: u32 = 129;
pub const CMD_STOP: u32 = 130;
pub const CMD_RESUME: u32 = 131;
pub const CMD_UPLOAD_URL: u32 = 256;
pub const CMD_LIST_FILES: u32 = 258;
pub const CMD_DELETE_FILES: u32 = 259;
pub const CMD_ENABLE_VIDEO: u32 = 386;

/// Builds an outbound request frame.
pub fn request_frame(cmd: u32, data: Value, request_id: &str, mainboard_id: &str) -> Value {
    json!({
        "Id": request_id,
        "Data": {
            "Cmd": cmd,
            "Data": data,
            "RequestID": request_id,
            "MainboardID": mainboard_id,
            "TimeStamp": Utc::now().timestamp(),
            "From": 0
        },
        "Topic": format!("sdcp/request/{}", mainboard_id)
    })
}

/// What an inbound frame is, from the receive loop's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a request, carrying its `Data` object.
    Reply { request_id: String, data: Value },
    /// Unsolicited broadcast keyed by its top-level type.
    Broadcast { key: &'static str, payload: Value },
    Other,
}

pub const BROADCAST_KEYS: [&str; 2] = ["Status", "Attributes"];

pub fn classify(frame: &Value) -> Inbound {
    if let Some(request_id) = frame["Data"]["RequestID"].as_str() {
        return Inbound::Reply {
            request_id: request_id.to_string(),
            data: frame["Data"].clone(),
        };
    }
    for key in BROADCAST_KEYS {
        if frame[key].is_object() {
            return Inbound::Broadcast {
                key,
                payload: frame[key].clone(),
            };
        }
    }
    Inbound::Other
}

/// Originator id echoed by the device, if the frame carries one.
pub fn mainboard_id(frame: &Value) -> Option<&str> {
    frame["MainboardID"]
        .as_str()
        .or_else(|| frame["Data"]["MainboardID"].as_str())
        .or_else(|| frame["Attributes"]["MainboardID"].as_str())
        .filter(|id| !id.is_empty())
}

/// Acknowledgement code of a reply's `Data`; absent means success.
pub fn ack_code(reply: &Value) -> i64 {
    reply["Data"]["Ack"].as_i64().unwrap_or(0)
}

/// Maps `PrintInfo.Status` to the common state. Unlisted codes are UNKNOWN.
pub fn map_print_status(code: i64) -> PrinterStatus {
    match code {
        0 => PrinterStatus::Idle,
        1 => PrinterStatus::Busy,
        2..=4 => PrinterStatus::Printing,
        5 | 6 => PrinterStatus::Paused,
        7 => PrinterStatus::Cancelling,
        8 | 9 => PrinterStatus::Idle,
        10 => PrinterStatus::Busy,
        13 => PrinterStatus::Printing,
        16 | 20 => PrinterStatus::Busy,
        _ => PrinterStatus::Unknown,
    }
}

fn machine_status(status: &Value) -> Option<i64> {
    match &status["CurrentStatus"] {
        Value::Array(codes) => codes.first().and_then(Value::as_i64),
        other => other.as_i64(),
    }
}

/// Derives the printer state from a `Status` broadcast payload.
pub fn parse_status(status: &Value) -> DeviceState {
    let print_code = status["PrintInfo"]["Status"].as_i64();
    let state = match (machine_status(status), print_code) {
        (Some(0), _) => PrinterStatus::Idle,
        (Some(1) | None, Some(code)) => map_print_status(code),
        (Some(1) | None, None) => PrinterStatus::Unknown,
        (Some(_), _) => PrinterStatus::Busy,
    };
    DeviceState {
        connected: true,
        state,
        tool_temp_actual: as_f64(&status["TempOfNozzle"]),
        tool_temp_target: as_f64(&status["TempTargetNozzle"]),
        bed_temp_actual: as_f64(&status["TempOfHotbed"]),
        bed_temp_target: as_f64(&status["TempTargetHotbed"]),
        chamber_temp_actual: as_f64(&status["TempOfBox"]),
        chamber_temp_target: as_f64(&status["TempTargetBox"]),
    }
}

/// Job progress from a `Status` payload. Ticks are seconds.
pub fn parse_job(status: &Value) -> JobProgress {
    let info = &status["PrintInfo"];
    if !info.is_object() {
        return JobProgress::empty();
    }
    let idle = matches!(info["Status"].as_i64(), Some(0) | None);
    let file_name = info["Filename"].as_str().filter(|f| !f.is_empty());
    if idle && file_name.is_none() {
        return JobProgress::empty();
    }

    let mut job = JobProgress::empty().with_completion(as_f64(&info["Progress"]));
    job.file_name = file_name.map(str::to_string);
    job.print_time_secs = as_secs(&info["CurrentTicks"]);
    job.print_time_left_secs = match (as_secs(&info["TotalTicks"]), job.print_time_secs) {
        (Some(total), Some(current)) => Some(total.saturating_sub(current)),
        _ => None,
    };
    job
}
