// src/error.rs - The single error type surfaced by every printer adapter
use std::fmt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Broad classification of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad local input (wrong extension, empty command list, ambiguous name).
    Validation,
    /// The local file handed to an upload does not exist.
    FileNotFound,
    /// The binding's capabilities disclaim the requested operation.
    Unsupported,
    /// Connection refused, reset, DNS failure or socket closed.
    Connectivity,
    /// The transport gave up waiting.
    Timeout,
    /// 401/403: the printer rejected the credentials.
    Authentication,
    /// 404: endpoint, file or job does not exist.
    NotFound,
    /// 409 or an equivalent firmware state conflict.
    Conflict,
    /// 502/503/504 persisted through every retry attempt.
    Unavailable,
    /// Unexpected status code or undecodable payload.
    Protocol,
    /// Connection attempts are suppressed by the backoff window.
    Cooldown,
    /// A checked command received no correlated reply in time.
    NoResponse,
    /// A checked command was answered with a non-zero acknowledgement.
    CommandRejected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Validation => "validation",
            Self::FileNotFound => "file not found",
            Self::Unsupported => "unsupported",
            Self::Connectivity => "connectivity",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
            Self::Protocol => "protocol",
            Self::Cooldown => "cooldown",
            Self::NoResponse => "no response",
            Self::CommandRejected => "command rejected",
        };
        f.write_str(text)
    }
}

/// Error raised by every adapter operation.
///
/// The message is written for the operator: it says what failed and what to
/// check. `status` holds the HTTP status when one was received.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AdapterError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    #[source]
    source: Option<BoxError>,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            source: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// True for failures that only mean "the printer could not be reached".
    ///
    /// Polling reads degrade to OFFLINE or empty results on these instead of
    /// raising.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Connectivity | ErrorKind::Timeout | ErrorKind::Cooldown | ErrorKind::NoResponse
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn file_not_found(path: &Path) -> Self {
        Self::new(
            ErrorKind::FileNotFound,
            format!("Local file not found: {}. Check the path before uploading.", path.display()),
        )
    }

    pub fn unsupported(firmware: &str, operation: &str) -> Self {
        Self::new(
            ErrorKind::Unsupported,
            format!("{} does not support {}; the firmware exposes no endpoint for it", firmware, operation),
        )
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connectivity, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn cooldown(host: &str, remaining: Duration) -> Self {
        Self::new(
            ErrorKind::Cooldown,
            format!(
                "Connection to {} is cooling down after repeated failures; next attempt allowed in {:.1}s",
                host,
                remaining.as_secs_f64()
            ),
        )
    }

    pub fn no_response(command: u32, timeout: Duration) -> Self {
        Self::new(
            ErrorKind::NoResponse,
            format!("Command {} got no response within {:.1}s", command, timeout.as_secs_f64()),
        )
    }

    pub fn rejected(command: u32, ack: i64) -> Self {
        Self::new(
            ErrorKind::CommandRejected,
            format!("Command {} failed with ack code {}", command, ack),
        )
    }

    /// Prefix the message with context while keeping kind, status and cause.
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", context, self.message);
        self
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::protocol(format!("Malformed JSON from printer: {}", err)).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn connectivity_kinds_degrade() {
        assert!(AdapterError::connectivity("refused").is_connectivity());
        assert!(AdapterError::no_response(0, Duration::from_secs(1)).is_connectivity());
        assert!(AdapterError::cooldown("printer", Duration::from_secs(3)).is_connectivity());
        assert!(!AdapterError::new(ErrorKind::Authentication, "bad key").is_connectivity());
        assert!(!AdapterError::new(ErrorKind::Unavailable, "503").is_connectivity());
    }

    #[test]
    fn rejected_names_ack_code() {
        let err = AdapterError::rejected(128, 3);
        assert_eq!(err.kind(), ErrorKind::CommandRejected);
        assert!(err.to_string().contains("ack code 3"));
    }

    #[test]
    fn context_keeps_status_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = AdapterError::connectivity("printer unreachable")
            .with_status(502)
            .with_source(io)
            .context("list files");
        assert_eq!(err.status(), Some(502));
        assert_eq!(err.message(), "list files: printer unreachable");
        assert!(err.source().is_some());
    }
}
