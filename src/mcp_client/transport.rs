//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with tool server child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter, shared by both transports.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Channel Trait ───────────────────────────────────────────────────────────

/// A connection that can carry one JSON-RPC request/response exchange.
///
/// Implemented by both wire shapes so the handshake, discovery and call
/// logic in `lifecycle` is written once.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Server id, for error context.
    fn server_name(&self) -> &str;

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError>;
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Both ends of the pipe, locked together so one exchange completes before
/// the next begins.
struct Pipe {
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    pipe: Mutex<Pipe>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            server_name: server_name.to_string(),
            pipe: Mutex::new(Pipe {
                writer: stdin,
                reader: BufReader::new(stdout),
            }),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Writes one line of JSON, then reads lines until a response with the
    /// same `id` arrives. Log output and stale responses from a previously
    /// timed-out request are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req)
            .map_err(|e| self.transport_err(format!("failed to serialize request: {e}")))?;
        json.push('\n');

        let mut pipe = self.pipe.lock().await;
        self.write_line(&mut pipe.writer, &json).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = pipe
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_err(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(McpError::ServerCrashed {
                    name: self.server_name.clone(),
                    reason: "server stdout closed (process may have exited)".into(),
                });
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = resp.id,
                        "skipping stale response"
                    );
                }
                Err(_) => {
                    tracing::trace!(server = %self.server_name, line = trimmed, "non-JSON stdout line");
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
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

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            self.transport_err(format!("failed to serialize notification: {e}"))
        })?;
        json.push('\n');

        let mut pipe = self.pipe.lock().await;
        self.write_line(&mut pipe.writer, &json).await
    }

    async fn write_line(&self, writer: &mut ChildStdin, line: &str) -> Result<(), McpError> {
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_err(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_err(format!("failed to flush stdin: {e}")))
    }

    fn transport_err(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl RpcChannel for StdioTransport {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        StdioTransport::request(self, method, params).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        StdioTransport::notify(self, method, params).await
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Interpret a `tools/call` result body.
///
/// `isError: true` becomes `Err` with the joined text content. Otherwise the
/// payload is `structuredContent` when present, then a single text block
/// (parsed as JSON when it is JSON), then the raw result.
pub fn interpret_tool_output(result: serde_json::Value) -> Result<serde_json::Value, String> {
    let texts: Vec<&str> = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();

    if result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
        let detail = if texts.is_empty() {
            "tool reported an error".to_string()
        } else {
            texts.join("\n")
        };
        return Err(detail);
    }

    if let Some(structured) = result.get("structuredContent") {
        return Ok(structured.clone());
    }

    if texts.len() == 1 {
        let text = texts[0];
        return Ok(serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())));
    }

    Ok(result)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
