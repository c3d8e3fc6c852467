//! JSON-RPC over a persistent server-sent-event channel.
//!
//! One long-lived `GET {base_url}/events` response carries every reply from
//! the server as `data: <json>` events. Requests go out as independent
//! `POST {base_url}/message` calls. A background reader routes each reply to
//! the pending request with the same id, so any number of callers can share
//! one connection without cross-delivering results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{next_request_id, RpcChannel};
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout for both the event channel and message posts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Path of the long-lived event channel.
const EVENTS_PATH: &str = "/events";

/// Path requests are posted to.
const MESSAGE_PATH: &str = "/message";

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

// ─── StreamTransport ─────────────────────────────────────────────────────────

/// Shared, multiplexed JSON-RPC connection to one stream-backed server.
pub struct StreamTransport {
    server_name: String,
    base_url: String,
    http: HttpClient,
    headers: HashMap<String, String>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl StreamTransport {
    /// Open the event channel and start the reader task.
    pub async fn connect(
        server_name: &str,
        base_url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::TransportError {
                server: server_name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let mut req = http
            .get(format!("{base_url}{EVENTS_PATH}"))
            .header("Accept", "text/event-stream");
        for (key, value) in headers {
            req = req.header(key, value);
        }

        let response = req.send().await.map_err(|e| McpError::TransportError {
            server: server_name.to_string(),
            reason: format!("event channel connect failed: {e}"),
        })?;

        if !response.status().is_success() {
            return Err(McpError::TransportError {
                server: server_name.to_string(),
                reason: format!("event channel returned HTTP {}", response.status()),
            });
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(reader_loop(
            server_name.to_string(),
            response,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        tracing::info!(server = server_name, base_url = %base_url, "stream channel opened");

        Ok(Self {
            server_name: server_name.to_string(),
            base_url,
            http,
            headers: headers.clone(),
            pending,
            closed,
            reader,
        })
    }

    /// Whether the event channel has ended. A closed transport must be replaced.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Send a request and wait for the reply routed back by the reader.
    ///
    /// Cancel-safe: dropping the future unregisters the pending slot.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.closed_err());
        }

        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        let _slot = PendingSlot::register(&self.pending, id, tx);

        // The reader flips `closed` before draining, so a slot registered
        // after the drain is caught here.
        if self.is_closed() {
            return Err(self.closed_err());
        }

        let req = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&req)
            .map_err(|e| self.transport_err(format!("failed to serialize request: {e}")))?;
        self.post(&body).await?;

        rx.await.map_err(|_| self.closed_err())
    }

    /// Send a notification (no reply expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.post(&notification).await
    }

    async fn post(&self, body: &serde_json::Value) -> Result<(), McpError> {
        let mut req = self
            .http
            .post(format!("{}{MESSAGE_PATH}", self.base_url))
            .json(body);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }

        let response = req
            .send()
            .await
            .map_err(|e| self.transport_err(format!("message post failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.transport_err(format!("message post returned HTTP {status}: {text}")));
        }
        Ok(())
    }

    fn closed_err(&self) -> McpError {
        McpError::ConnectionClosed {
            server: self.server_name.clone(),
        }
    }

    fn transport_err(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl RpcChannel for StreamTransport {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        StreamTransport::request(self, method, params).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        StreamTransport::notify(self, method, params).await
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a pending entry when the waiting request finishes or is dropped.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl<'a> PendingSlot<'a> {
    fn register(pending: &'a PendingMap, id: u64, tx: oneshot::Sender<JsonRpcResponse>) -> Self {
        if let Ok(mut map) = pending.lock() {
            map.insert(id, tx);
        }
        Self { pending, id }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&self.id);
        }
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Read SSE events until the channel ends, dispatching replies by id.
async fn reader_loop(
    server_name: String,
    response: reqwest::Response,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    let mut bytes = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        for data in drain_events(&server_name, &mut buffer) {
            dispatch(&server_name, &pending, &data);
        }

        match bytes.next().await {
            // 0x0D never occurs inside a multi-byte UTF-8 sequence.
            Some(Ok(chunk)) => buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r')),
            Some(Err(e)) => {
                tracing::warn!(server = %server_name, error = %e, "stream channel read error");
                break;
            }
            None => break,
        }
    }

    closed.store(true, Ordering::SeqCst);
    let dropped = pending.lock().map(|mut p| p.drain().count()).unwrap_or(0);
    tracing::warn!(
        server = %server_name,
        dropped_requests = dropped,
        "stream channel closed"
    );
}

fn dispatch(server_name: &str, pending: &PendingMap, data: &str) {
    let response = match serde_json::from_str::<JsonRpcResponse>(data) {
        Ok(r) => r,
        Err(_) => {
            tracing::trace!(server = server_name, data, "ignoring non-response event");
            return;
        }
    };

    let sender = pending.lock().ok().and_then(|mut p| p.remove(&response.id));
    match sender {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => {
            tracing::debug!(server = server_name, id = response.id, "reply for unknown request id");
        }
    }
}

/// Remove every complete event from `buffer`, returning each event's joined
/// `data:` payload. Events without data (comments, keep-alives) are skipped.
///
/// Bytes are only decoded once a whole event has arrived, so a character
/// split across network chunks is reassembled before decoding.
fn drain_events(server_name: &str, buffer: &mut Vec<u8>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(end) = buffer.windows(2).position(|w| w == b"\n\n") {
        let raw: Vec<u8> = buffer.drain(..end + 2).collect();
        let event = match String::from_utf8(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(server = server_name, error = %e, "dropping event with invalid UTF-8");
                continue;
            }
        };
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();
        if !data.is_empty() {
            out.push(data.join("\n"));
        }
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
