// src/sdcp/connection.rs - Persistent SDCP WebSocket link
//
// One background task owns the socket. Callers hand it frames through an
// mpsc channel and wait on oneshot receivers registered in the pending table;
// the task routes each reply to its waiter and stores broadcasts in the
// status cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::backoff::ConnectionBackoff;
use super::frames::{self, Inbound};
use crate::error::{AdapterError, ErrorKind};

/// A broadcast payload and when it arrived.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub payload: Value,
    pub received: Instant,
}

/// State shared between callers and the receive loop, under one lock.
#[derive(Debug)]
struct Shared {
    pending: HashMap<String, oneshot::Sender<Value>>,
    cache: HashMap<&'static str, CachedFrame>,
    mainboard_id: Option<String>,
    backoff: ConnectionBackoff,
}

struct Link {
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.outbound.is_closed()
    }
}

pub struct SdcpConnection {
    url: String,
    host: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    identify_wait: Duration,
    shared: Arc<Mutex<Shared>>,
    broadcast: Arc<Notify>,
    link: Mutex<Option<Link>>,
}

impl SdcpConnection {
    pub fn new(
        host: &str,
        port: u16,
        mainboard_id: Option<String>,
        backoff: ConnectionBackoff,
        connect_timeout: Duration,
        command_timeout: Duration,
        identify_wait: Duration,
    ) -> Self {
        Self {
            url: format!("ws://{}:{}/websocket", host, port),
            host: host.to_string(),
            connect_timeout,
            command_timeout,
            identify_wait,
            shared: Arc::new(Mutex::new(Shared {
                pending: HashMap::new(),
                cache: HashMap::new(),
                mainboard_id,
                backoff,
            })),
            broadcast: Arc::new(Notify::new()),
            link: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn mainboard_id(&self) -> Option<String> {
        self.shared.lock().await.mainboard_id.clone()
    }

    pub async fn backoff(&self) -> ConnectionBackoff {
        self.shared.lock().await.backoff.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.as_ref().map(Link::is_alive).unwrap_or(false)
    }

    /// Returns the live link's sender, connecting first if needed.
    ///
    /// While cooling down this fails with `Cooldown` without touching the
    /// network. The link lock is held across the connect, so an instance
    /// never opens two sockets. A fresh link to a printer whose mainboard id
    /// is unknown asks for its attributes before any command goes out.
    pub async fn ensure_connected(&self) -> Result<mpsc::UnboundedSender<String>, AdapterError> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref() {
            if existing.is_alive() {
                return Ok(existing.outbound.clone());
            }
            tracing::info!("SDCP link to {} dropped, reconnecting", self.host);
            *link = None;
        }

        {
            let shared = self.shared.lock().await;
            if let Some(remaining) = shared.backoff.remaining(Instant::now()) {
                return Err(AdapterError::cooldown(&self.host, remaining));
            }
        }

        tracing::debug!("Connecting to {}", self.url);
        let attempt = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(self.url.as_str())).await;
        let socket = match attempt {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(e)) => {
                let err = self.record_connect_failure().await;
                return Err(AdapterError::connectivity(format!(
                    "Could not open {}. Check that the printer is on and its network service is enabled{}",
                    self.url, err
                ))
                .with_source(e));
            }
            Err(_) => {
                let err = self.record_connect_failure().await;
                return Err(AdapterError::new(
                    ErrorKind::Timeout,
                    format!("Connecting to {} timed out after {:?}{}", self.url, self.connect_timeout, err),
                ));
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(receive_loop(
            socket,
            outbound_rx,
            self.shared.clone(),
            self.broadcast.clone(),
            self.host.clone(),
        ));
        tracing::info!("Connected to SDCP printer at {}", self.url);
        *link = Some(Link {
            outbound: outbound.clone(),
            task,
        });
        if self.mainboard_id().await.is_none() {
            self.identify(&outbound).await;
        }
        Ok(outbound)
    }

    /// Sends the attributes request and waits up to `identify_wait` for a
    /// frame carrying the mainboard id.
    async fn identify(&self, outbound: &mpsc::UnboundedSender<String>) {
        let request_id = Uuid::new_v4().simple().to_string();
        let frame = frames::request_frame(frames::CMD_ATTRIBUTES, serde_json::json!({}), &request_id, "");
        if outbound.send(frame.to_string()).is_err() {
            return;
        }
        let deadline = tokio::time::Instant::now() + self.identify_wait;
        loop {
            let notified = self.broadcast.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.mainboard_id().await.is_some() {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::debug!("{} did not report a mainboard id within {:?}", self.host, self.identify_wait);
                return;
            }
        }
    }

    async fn record_connect_failure(&self) -> String {
        let mut shared = self.shared.lock().await;
        shared.backoff.record_failure(Instant::now());
        let attempts = shared.backoff.attempts();
        let delay = shared.backoff.delay();
        tracing::warn!("SDCP connect to {} failed ({} in a row), cooling down {:?}", self.host, attempts, delay);
        format!(" (attempt {}, next try in {:?})", attempts, delay)
    }

    async fn frame(&self, cmd: u32, data: Value, request_id: &str) -> String {
        let mainboard = self.mainboard_id().await.unwrap_or_default();
        frames::request_frame(cmd, data, request_id, &mainboard).to_string()
    }

    /// Sends `cmd` without waiting for a reply.
    pub async fn send(&self, cmd: u32, data: Value) -> Result<(), AdapterError> {
        let outbound = self.ensure_connected().await?;
        let request_id = Uuid::new_v4().simple().to_string();
        let frame = self.frame(cmd, data, &request_id).await;
        tracing::debug!("SDCP -> {} cmd {}", self.host, cmd);
        outbound
            .send(frame)
            .map_err(|_| AdapterError::connectivity(format!("Connection to {} closed before command {} was sent", self.host, cmd)))
    }

    /// Sends `cmd` and waits for its correlated reply.
    ///
    /// Returns the reply's inner `Data` object. A missing reply raises
    /// `NoResponse`; a non-zero `Ack` raises `CommandRejected`.
    pub async fn send_checked(&self, cmd: u32, data: Value) -> Result<Value, AdapterError> {
        let outbound = self.ensure_connected().await?;
        let request_id = Uuid::new_v4().simple().to_string();
        let frame = self.frame(cmd, data, &request_id).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.lock().await.pending.insert(request_id.clone(), reply_tx);

        tracing::debug!("SDCP -> {} cmd {} ({})", self.host, cmd, request_id);
        if outbound.send(frame).is_err() {
            self.shared.lock().await.pending.remove(&request_id);
            return Err(AdapterError::connectivity(format!(
                "Connection to {} closed before command {} was sent",
                self.host, cmd
            )));
        }

        match tokio::time::timeout(self.command_timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                let ack = frames::ack_code(&reply);
                if ack != 0 {
                    return Err(AdapterError::rejected(cmd, ack));
                }
                Ok(reply["Data"].clone())
            }
            Ok(Err(_)) => Err(AdapterError::connectivity(format!(
                "Connection to {} closed while waiting for command {}",
                self.host, cmd
            ))),
            Err(_) => {
                self.shared.lock().await.pending.remove(&request_id);
                Err(AdapterError::no_response(cmd, self.command_timeout))
            }
        }
    }

    /// Asks for a status broadcast and waits up to `wait` for any broadcast.
    pub async fn refresh_status(&self, wait: Duration) -> Result<(), AdapterError> {
        let notified = self.broadcast.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.send(frames::CMD_STATUS, serde_json::json!({})).await?;
        if tokio::time::timeout(wait, notified).await.is_err() {
            tracing::debug!("No status broadcast from {} within {:?}", self.host, wait);
        }
        Ok(())
    }

    /// Cached broadcast payload of type `key`, if younger than `max_age`.
    pub async fn cached(&self, key: &str, max_age: Duration) -> Option<Value> {
        let shared = self.shared.lock().await;
        shared
            .cache
            .get(key)
            .filter(|frame| frame.received.elapsed() < max_age)
            .map(|frame| frame.payload.clone())
    }

    pub async fn disconnect(&self) {
        if let Some(link) = self.link.lock().await.take() {
            // dropping the sender makes the loop close the socket
            drop(link.outbound);
            if tokio::time::timeout(Duration::from_secs(2), link.task).await.is_err() {
                tracing::warn!("SDCP receive loop for {} did not stop in time", self.host);
            }
            tracing::info!("Disconnected from {}", self.host);
        }
    }
}

impl Drop for SdcpConnection {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.task.abort();
        }
    }
}

async fn receive_loop<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shared: Arc<Mutex<Shared>>,
    broadcast: Arc<Notify>,
    host: String,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        tracing::warn!("SDCP write to {} failed: {}", host, e);
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_frame(&shared, &broadcast, &host, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("SDCP printer {} closed the connection", host);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("SDCP read from {} failed: {}", host, e);
                    break;
                }
            },
        }
    }

    // wake every waiter; their receivers observe the closed channel
    shared.lock().await.pending.clear();
}

async fn handle_frame(shared: &Mutex<Shared>, broadcast: &Notify, host: &str, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("Ignoring malformed frame from {}: {}", host, e);
            return;
        }
    };

    let mut guard = shared.lock().await;
    let mut identified = false;
    if guard.mainboard_id.is_none() {
        if let Some(id) = frames::mainboard_id(&frame) {
            tracing::info!("SDCP printer {} identified as mainboard {}", host, id);
            guard.mainboard_id = Some(id.to_string());
            identified = true;
        }
    }

    match frames::classify(&frame) {
        Inbound::Reply { request_id, data } => {
            guard.backoff.reset();
            match guard.pending.remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(data);
                }
                None => tracing::debug!("Late or unknown reply {} from {}", request_id, host),
            }
            drop(guard);
            if identified {
                broadcast.notify_waiters();
            }
        }
        Inbound::Broadcast { key, payload } => {
            guard.backoff.reset();
            guard.cache.insert(
                key,
                CachedFrame {
                    payload,
                    received: Instant::now(),
                },
            );
            drop(guard);
            broadcast.notify_waiters();
        }
        Inbound::Other => tracing::trace!("Unhandled frame from {}", host),
    }
}
