//! Tool client error types.

use thiserror::Error;

/// Errors that can occur while talking to tool servers.
///
/// The dispatcher never returns these to the agent loop directly; they are
/// folded into an error `ToolResult` at the `invoke` boundary.
#[derive(Debug, Error)]
pub enum McpError {
    /// A stdio server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake or tool listing failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error, HTTP error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The persistent stream channel closed while a request was pending.
    #[error("connection to server '{server}' closed")]
    ConnectionClosed { server: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the registry snapshot.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// Server process exited unexpectedly.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed { name: String, reason: String },

    /// Configuration error (missing server, bad config entry).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// All restart attempts exhausted for a server within a session.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },
}

impl McpError {
    /// Whether the underlying connection should be discarded after this error.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. }
                | McpError::ConnectionClosed { .. }
                | McpError::ServerCrashed { .. }
        )
    }
}

/// Discovery reached some servers but not all of them.
///
/// The registry has already been refreshed with what did respond; this only
/// reports the omissions.
#[derive(Debug, Error)]
#[error("discovery incomplete: {} server(s) unreachable ({}), {available} tool(s) available", failures.len(), failed_names(failures))]
pub struct DiscoveryError {
    /// `(server_id, error)` for every server that did not answer.
    pub failures: Vec<(String, McpError)>,
    /// Number of tools in the refreshed snapshot.
    pub available: usize,
}

fn failed_names(failures: &[(String, McpError)]) -> String {
    failures
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
