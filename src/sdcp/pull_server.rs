//! Short-lived HTTP listener the printer downloads an upload from.
//!
//! The listener lives exactly as long as its [`PullServer`] guard; dropping
//! the guard starts a graceful shutdown, so any transfer already in flight
//! still completes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use md5::{Digest, Md5};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use url::Url;

use crate::error::AdapterError;

/// The file being served and who is waiting for it.
pub struct PullState {
    file_name: String,
    data: Bytes,
    pulls: AtomicUsize,
    pulled: Notify,
}

impl PullState {
    pub fn new(file_name: &str, data: Bytes) -> Self {
        Self {
            file_name: file_name.to_string(),
            data,
            pulls: AtomicUsize::new(0),
            pulled: Notify::new(),
        }
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

/// Router serving `GET /{file_name}`; anything else is 404.
pub fn pull_router(state: Arc<PullState>) -> Router {
    Router::new()
        .route("/{file}", get(serve_file))
        .with_state(state)
}

async fn serve_file(Path(file): Path<String>, State(state): State<Arc<PullState>>) -> Response {
    if file != state.file_name {
        tracing::debug!("Pull request for unknown file '{}'", file);
        return StatusCode::NOT_FOUND.into_response();
    }
    state.pulls.fetch_add(1, Ordering::SeqCst);
    state.pulled.notify_one();
    tracing::info!("Printer is pulling '{}' ({} bytes)", file, state.data.len());
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        state.data.clone(),
    )
        .into_response()
}

/// Hex MD5 of `data`, as the upload command expects.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// A running listener. Shuts down when dropped.
pub struct PullServer {
    address: SocketAddr,
    state: Arc<PullState>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PullServer {
    /// Binds an ephemeral port on all interfaces and starts serving.
    pub async fn start(file_name: &str, data: Bytes) -> Result<Self, AdapterError> {
        let listener = TcpListener::bind("0.0.0.0:0").await.map_err(|e| {
            AdapterError::connectivity(format!("Could not open a local port to serve '{}': {}", file_name, e)).with_source(e)
        })?;
        let address = listener.local_addr().map_err(|e| {
            AdapterError::connectivity(format!("Local listener has no address: {}", e)).with_source(e)
        })?;

        let state = Arc::new(PullState::new(file_name, data));
        let app = pull_router(state.clone());
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = server.await {
                tracing::warn!("Pull server exited with error: {}", e);
            }
        });
        tracing::debug!("Serving '{}' on port {}", file_name, address.port());

        Ok(Self {
            address,
            state,
            shutdown,
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn pulls(&self) -> usize {
        self.state.pulls()
    }

    /// URL the printer should fetch, with `host` as the advertised address.
    pub fn url_for(&self, host: &str) -> Result<String, AdapterError> {
        let mut url = Url::parse(&format!("http://{}:{}/", host, self.port()))
            .map_err(|e| AdapterError::validation(format!("Invalid advertise host '{}': {}", host, e)))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::validation(format!("Advertise host '{}' cannot carry a path", host)))?
            .push(&self.state.file_name);
        Ok(url.to_string())
    }

    /// Waits until the file has been requested at least once.
    pub async fn wait_for_pull(&self, timeout: Duration) -> bool {
        if self.pulls() > 0 {
            return true;
        }
        tokio::time::timeout(timeout, self.state.pulled.notified()).await.is_ok() || self.pulls() > 0
    }

    /// Stops accepting connections and waits for in-flight transfers.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(30), task).await.is_err() {
                tracing::warn!("Pull server on port {} still busy after 30s, abandoning it", self.address.port());
            }
        }
    }
}

impl Drop for PullServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if self.task.is_some() {
            tracing::debug!("Pull server on port {} shutting down", self.address.port());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_matches_known_digest() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn url_escapes_file_name() {
        let server = PullServer::start("my part.gcode", Bytes::from_static(b"G28")).await.unwrap();
        let url = server.url_for("192.168.1.20").unwrap();
        assert_eq!(url, format!("http://192.168.1.20:{}/my%20part.gcode", server.port()));
        server.shutdown().await;
    }
}
