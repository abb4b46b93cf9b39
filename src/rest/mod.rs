//! Shared request algorithm for the HTTP firmwares.
//!
//! Every call goes through [`RestClient::execute`]:
//!
//! - 2xx returns the body.
//! - 502/503/504 and network faults are retried with exponential backoff
//!   (`base_delay * 2^attempt`) up to the policy's attempt ceiling.
//! - Any other status is raised at once with a remediation hint.

pub mod moonraker;
pub mod octoprint;
pub mod prusalink;
pub mod storage;

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::config::{PrinterConfig, RetryConfig};
use crate::error::{AdapterError, ErrorKind};

/// Attempt ceiling and base delay for retried requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` below 1 is raised to 1.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }
}

pub fn is_transient(status: StatusCode) -> bool {
    matches!(status.as_u16(), 502 | 503 | 504)
}

/// Firmware-specific remediation text for terminal statuses.
#[derive(Debug)]
pub struct StatusHints {
    pub unauthorized: &'static str,
    pub forbidden: &'static str,
    pub not_found: &'static str,
    pub conflict: &'static str,
}

pub const DEFAULT_HINTS: StatusHints = StatusHints {
    unauthorized: "Check the API key configured for this printer",
    forbidden: "Check that the API key is allowed to perform this operation",
    not_found: "Check the file path and that the firmware exposes this endpoint",
    conflict: "Check that the printer is connected and not busy with another job",
};

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl RestResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AdapterError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Decoded body; an empty body (204 and friends) is `Value::Null`.
    pub fn json_value(&self) -> Result<Value, AdapterError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        self.json()
    }
}

/// HTTP client bound to one printer, applying the retry policy per call.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    // for hosts other than the printer; carries no API key
    anonymous: reqwest::Client,
    base_url: String,
    firmware: &'static str,
    retry: RetryPolicy,
    hints: &'static StatusHints,
}

impl RestClient {
    pub fn new(
        base_url: &str,
        firmware: &'static str,
        api_key: Option<&str>,
        timeout: Duration,
        retry: RetryPolicy,
        hints: &'static StatusHints,
    ) -> Result<Self, AdapterError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(key)
                .map_err(|e| AdapterError::validation(format!("API key is not a valid header value: {}", e)))?;
            headers.insert(HeaderName::from_static("x-api-key"), value);
        }
        let build_error = |e: reqwest::Error| {
            AdapterError::protocol(format!("Failed to build HTTP client: {}", e)).with_source(e)
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(build_error)?;
        let anonymous = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(build_error)?;
        Ok(Self {
            http,
            anonymous,
            base_url: base_url.trim_end_matches('/').to_string(),
            firmware,
            retry,
            hints,
        })
    }

    pub fn from_config(
        config: &PrinterConfig,
        firmware: &'static str,
        hints: &'static StatusHints,
    ) -> Result<Self, AdapterError> {
        Self::new(
            &config.base_url(),
            firmware,
            config.api_key.as_deref(),
            config.request_timeout(),
            RetryPolicy::from(&config.retry),
            hints,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn firmware(&self) -> &'static str {
        self.firmware
    }

    /// Absolute URL for `path`; absolute inputs are returned unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// The credentialed client for the printer's own origin, the anonymous
    /// one for anything else (an external webcam, say).
    fn client_for(&self, url: &str) -> &reqwest::Client {
        let origin = |u: &str| Url::parse(u).ok().map(|u| u.origin());
        match (origin(url), origin(&self.base_url)) {
            (Some(target), Some(printer)) if target == printer => &self.http,
            _ => &self.anonymous,
        }
    }

    /// Absolute URL for `prefix` followed by the segments of a remote file
    /// path. Each segment is percent-encoded, so `#`, `?` and spaces stay part
    /// of the file name.
    pub fn file_url(&self, prefix: &str, file: &str) -> Result<String, AdapterError> {
        let segments: Vec<&str> = file.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(AdapterError::validation(format!("No remote file given for {}", prefix)));
        }
        let mut url = Url::parse(&self.url(prefix))
            .map_err(|e| AdapterError::validation(format!("Invalid URL for {}: {}", prefix, e)))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::validation(format!("{} cannot carry a file path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.to_string())
    }

    /// Issues one logical request. `customize` is applied to a fresh
    /// builder on every attempt, so bodies are rebuilt for each retry.
    pub async fn execute<F>(&self, method: Method, path: &str, customize: F) -> Result<RestResponse, AdapterError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let url = self.url(path);
        let http = self.client_for(&url);
        let attempts = self.retry.max_attempts();
        let mut last_error: Option<AdapterError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry.delay_for(attempt - 1);
                tracing::warn!(
                    "{} {} {} failed (attempt {}/{}), retrying in {:?}",
                    self.firmware,
                    method,
                    path,
                    attempt,
                    attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            tracing::debug!("{} -> {} {}", self.firmware, method, url);
            let response = match customize(http.request(method.clone(), &url)).send().await {
                Ok(response) => response,
                Err(err) => {
                    last_error = Some(self.transport_error(&method, path, err));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                match response.bytes().await {
                    Ok(body) => {
                        return Ok(RestResponse {
                            status,
                            body: body.to_vec(),
                        });
                    }
                    Err(err) => {
                        last_error = Some(self.transport_error(&method, path, err));
                        continue;
                    }
                }
            }

            let body = response.text().await.unwrap_or_default();
            if is_transient(status) {
                last_error = Some(
                    AdapterError::new(
                        ErrorKind::Unavailable,
                        format!(
                            "{} {} {} kept returning {}{}. The printer host is overloaded or restarting; try again shortly",
                            self.firmware,
                            method,
                            path,
                            status.as_u16(),
                            summarize(&body)
                        ),
                    )
                    .with_status(status.as_u16()),
                );
                continue;
            }
            return Err(self.classify(status, &method, path, &body));
        }

        Err(last_error.unwrap_or_else(|| {
            AdapterError::connectivity(format!("{} {} {} was never attempted", self.firmware, method, path))
        }))
    }

    pub async fn get_json(&self, path: &str) -> Result<Value, AdapterError> {
        self.execute(Method::GET, path, |rb| rb).await?.json_value()
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<RestResponse, AdapterError> {
        self.execute(Method::POST, path, |rb| rb.json(body)).await
    }

    pub async fn send(&self, method: Method, path: &str) -> Result<RestResponse, AdapterError> {
        self.execute(method, path, |rb| rb).await
    }

    fn classify(&self, status: StatusCode, method: &Method, path: &str, body: &str) -> AdapterError {
        let code = status.as_u16();
        let (kind, hint) = match code {
            401 => (ErrorKind::Authentication, self.hints.unauthorized),
            403 => (ErrorKind::Authentication, self.hints.forbidden),
            404 => (ErrorKind::NotFound, self.hints.not_found),
            409 => (ErrorKind::Conflict, self.hints.conflict),
            _ => (ErrorKind::Protocol, "Check the firmware version and its logs"),
        };
        AdapterError::new(
            kind,
            format!(
                "{} {} {} returned {}{}. {}",
                self.firmware,
                method,
                path,
                code,
                summarize(body),
                hint
            ),
        )
        .with_status(code)
    }

    fn transport_error(&self, method: &Method, path: &str, err: reqwest::Error) -> AdapterError {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Connectivity
        };
        AdapterError::new(
            kind,
            format!(
                "{} {} {} could not reach {}. Check that the printer is powered on and on the network",
                self.firmware, method, path, self.base_url
            ),
        )
        .with_source(err)
    }
}

/// Short body excerpt for error messages.
fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let excerpt: String = trimmed.chars().take(160).collect();
    format!(" ({})", excerpt)
}

/// Reads a number that may arrive as a JSON number or string.
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_secs(value: &Value) -> Option<u64> {
    as_f64(value).filter(|v| *v >= 0.0).map(|v| v.round() as u64)
}
