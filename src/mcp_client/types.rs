//! Shared types for the tool client.
//!
//! JSON-RPC 2.0 message types, tool server protocol structures, and the
//! descriptor / call / result records exchanged with the agent core.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── Tool Server Protocol ────────────────────────────────────────────────────

/// Tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(default, alias = "outputSchema", alias = "resultSchema")]
    pub output_schema: Option<serde_json::Value>,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

// ─── Descriptors, Calls, Results ─────────────────────────────────────────────

/// Which wire shape reaches a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Line-delimited JSON-RPC over a child process's stdin/stdout.
    Stdio,
    /// Persistent server-sent-event channel plus HTTP POST for requests.
    Stream,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Stream => "stream",
        }
    }
}

/// Static metadata for one tool, immutable once discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique across the registry.
    pub name: String,
    pub server_id: String,
    pub transport_kind: TransportKind,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_schema: Option<serde_json::Value>,
}

impl ToolDescriptor {
    /// Build a descriptor from a server's `tools/list` entry.
    pub fn from_definition(
        server_id: &str,
        transport_kind: TransportKind,
        def: McpToolDefinition,
    ) -> Self {
        Self {
            name: def.name,
            server_id: server_id.to_string(),
            transport_kind,
            description: def.description,
            input_schema: def.input_schema,
            result_schema: def.output_schema,
        }
    }

    /// Names of the top-level arguments the schema marks as required.
    pub fn required_args(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// A request to run one tool. Consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    pub request_id: String,
}

impl ToolCall {
    /// Create a call with a fresh request id.
    pub fn new(tool_name: &str, args: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            args,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Outcome status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Ok => "ok",
            ToolStatus::Error => "error",
        }
    }
}

/// Result of a tool call. Never mutated after the dispatcher creates it.
///
/// Exactly one of `payload` / `error_detail` is set, matching `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub request_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub execution_time_ms: u64,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, payload: serde_json::Value, execution_time_ms: u64) -> Self {
        Self {
            request_id: call.request_id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolStatus::Ok,
            payload: Some(payload),
            error_detail: None,
            execution_time_ms,
        }
    }

    pub fn error(call: &ToolCall, detail: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            request_id: call.request_id.clone(),
            tool_name: call.tool_name.clone(),
            status: ToolStatus::Error,
            payload: None,
            error_detail: Some(detail.into()),
            execution_time_ms,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    /// Render the payload or error as plain text for prompts and logs.
    pub fn render(&self) -> String {
        match (&self.payload, &self.error_detail) {
            (Some(serde_json::Value::String(s)), _) => s.clone(),
            (Some(v), _) => v.to_string(),
            (None, Some(detail)) => format!("error: {detail}"),
            (None, None) => String::new(),
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// One tool server entry from the `servers` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory for the child process.
        #[serde(default)]
        cwd: Option<String>,
    },
    Stream {
        /// Base URL; `/events` and `/message` are appended.
        base_url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl ServerConfig {
    pub fn transport_kind(&self) -> TransportKind {
        match self {
            ServerConfig::Stdio { .. } => TransportKind::Stdio,
            ServerConfig::Stream { .. } => TransportKind::Stream,
        }
    }
}

/// The `servers` section: server id → config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_tool_definition_accepts_camel_case_schemas() {
        let json = r#"{
            "name": "estimate_emissions",
            "inputSchema": {"type": "object", "required": ["region"]},
            "outputSchema": {"type": "object"}
        }"#;
        let def: McpToolDefinition = serde_json::from_str(json).unwrap();
        let desc = ToolDescriptor::from_definition("carbon", TransportKind::Stdio, def);
        assert_eq!(desc.required_args(), vec!["region"]);
        assert!(desc.result_schema.is_some());
        assert_eq!(desc.description, "");
    }

    #[test]
    fn test_server_config_tagged_by_transport() {
        let yaml = r#"
            carbon:
              transport: stdio
              command: python3
              args: ["server.py"]
            search:
              transport: stream
              base_url: "http://127.0.0.1:9000"
        "#;
        let servers: HashMap<String, ServerConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(servers["carbon"].transport_kind(), TransportKind::Stdio);
        assert_eq!(servers["search"].transport_kind(), TransportKind::Stream);
    }

    #[test]
    fn test_tool_result_constructors() {
        let call = ToolCall::new("lookup", serde_json::Map::new());
        let ok = ToolResult::ok(&call, serde_json::json!({"n": 1}), 3);
        assert!(ok.is_ok());
        assert_eq!(ok.request_id, call.request_id);
        assert!(ok.error_detail.is_none());

        let err = ToolResult::error(&call, "boom", 0);
        assert!(!err.is_ok());
        assert!(err.payload.is_none());
        assert_eq!(err.render(), "error: boom");
    }

    #[test]
    fn test_tool_call_ids_are_unique() {
        let a = ToolCall::new("x", serde_json::Map::new());
        let b = ToolCall::new("x", serde_json::Map::new());
        assert_ne!(a.request_id, b.request_id);
    }
}
