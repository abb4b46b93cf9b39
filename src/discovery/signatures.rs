// src/discovery/signatures.rs - Known (port, endpoint) fingerprints per firmware
use serde_json::Value;

use crate::types::PrinterKind;

/// Name and version hints pulled from a matching reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum Check {
    /// A JSON reply at `path` that `matches` accepts.
    Http {
        path: &'static str,
        matches: fn(&Value) -> Option<Identity>,
    },
    /// An open TCP port. Weaker evidence; no API is confirmed.
    Tcp,
}

#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub kind: PrinterKind,
    pub port: u16,
    pub check: Check,
}

impl Signature {
    pub fn is_http(&self) -> bool {
        matches!(self.check, Check::Http { .. })
    }
}

fn text(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

fn moonraker(body: &Value) -> Option<Identity> {
    let result = &body["result"];
    if result["klippy_state"].is_null() && result["moonraker_version"].is_null() {
        return None;
    }
    Some(Identity {
        name: None,
        version: text(&result["moonraker_version"]),
    })
}

fn octoprint(body: &Value) -> Option<Identity> {
    let label = body["text"].as_str()?;
    if !label.contains("OctoPrint") {
        return None;
    }
    Some(Identity {
        name: None,
        version: text(&body["server"]),
    })
}

fn prusalink(body: &Value) -> Option<Identity> {
    let label = body["text"].as_str()?;
    if !label.contains("PrusaLink") {
        return None;
    }
    Some(Identity {
        name: text(&body["hostname"]),
        version: text(&body["server"]),
    })
}

pub const SIGNATURES: &[Signature] = &[
    Signature {
        kind: PrinterKind::Moonraker,
        port: 7125,
        check: Check::Http {
            path: "/server/info",
            matches: moonraker,
        },
    },
    Signature {
        kind: PrinterKind::OctoPrint,
        port: 80,
        check: Check::Http {
            path: "/api/version",
            matches: octoprint,
        },
    },
    Signature {
        kind: PrinterKind::OctoPrint,
        port: 5000,
        check: Check::Http {
            path: "/api/version",
            matches: octoprint,
        },
    },
    Signature {
        kind: PrinterKind::PrusaLink,
        port: 80,
        check: Check::Http {
            path: "/api/version",
            matches: prusalink,
        },
    },
    Signature {
        kind: PrinterKind::Sdcp,
        port: 3030,
        check: Check::Tcp,
    },
    Signature {
        kind: PrinterKind::Bambu,
        port: 8883,
        check: Check::Tcp,
    },
];

pub fn http_signatures() -> impl Iterator<Item = &'static Signature> {
    SIGNATURES.iter().filter(|s| s.is_http())
}
