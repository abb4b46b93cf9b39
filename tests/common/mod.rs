// Shared helpers for the integration tests: in-process mock printers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use printer_link::rest::{RestClient, RetryPolicy, StatusHints, DEFAULT_HINTS};
use tokio::net::TcpListener;

pub fn init_logging() {
    printer_link::logging::init(tracing::Level::DEBUG);
}

/// Serves `app` on an ephemeral loopback port.
pub async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Client with millisecond backoff so retry tests stay fast.
pub fn fast_client(addr: SocketAddr, firmware: &'static str) -> RestClient {
    client_with_hints(addr, firmware, &DEFAULT_HINTS)
}

pub fn client_with_hints(addr: SocketAddr, firmware: &'static str, hints: &'static StatusHints) -> RestClient {
    RestClient::new(
        &format!("http://{}", addr),
        firmware,
        Some("test-key"),
        Duration::from_secs(2),
        RetryPolicy::new(3, Duration::from_millis(10)),
        hints,
    )
    .unwrap()
}

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    /// Increments and returns the new count.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
