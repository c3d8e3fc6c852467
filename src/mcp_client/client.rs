//! Tool client: the high-level interface for tool execution.
//!
//! `McpClient` is shared by every task. It owns the server configurations,
//! the snapshot registry and the long-lived stream connections. Each task
//! opens a `ToolSession`, which owns the stdio processes it starts so that
//! two tasks never interleave request/response pairs on one pipe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::errors::{DiscoveryError, McpError};
use super::lifecycle::{self, CallOutcome, ManagedServer};
use super::registry::{ServerTools, ToolRegistry, ToolResolution, ToolSnapshot};
use super::stream::StreamTransport;
use super::types::{
    McpServersConfig, ServerConfig, ToolCall, ToolDescriptor, ToolResult, TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for tool call execution (ms).
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Shared tool client: registry, server configs and stream connections.
pub struct McpClient {
    /// Server configurations, by server id.
    configs: HashMap<String, ServerConfig>,
    /// Current name → descriptor snapshot.
    registry: ToolRegistry,
    /// One long-lived connection per stream server, shared across tasks.
    streams: Mutex<HashMap<String, Arc<StreamTransport>>>,
    /// Serialises discovery passes.
    discovery_lock: Mutex<()>,
    /// Per-call timeout.
    call_timeout: Duration,
}

impl McpClient {
    /// Create a new client from a servers configuration.
    pub fn new(config: McpServersConfig) -> Self {
        Self {
            configs: config.servers,
            registry: ToolRegistry::new(),
            streams: Mutex::new(HashMap::new()),
            discovery_lock: Mutex::new(()),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
        }
    }

    /// Set the tool call timeout in milliseconds.
    pub fn set_call_timeout(&mut self, timeout_ms: u64) {
        self.call_timeout = Duration::from_millis(timeout_ms);
    }

    pub fn call_timeout_ms(&self) -> u64 {
        self.call_timeout.as_millis() as u64
    }

    /// Configured server ids, sorted.
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The current descriptor snapshot.
    pub fn snapshot(&self) -> Arc<ToolSnapshot> {
        self.registry.snapshot()
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Query every configured server and swap in a fresh registry snapshot.
    ///
    /// Best-effort: servers that answer are registered even when others
    /// fail, in which case the refreshed table is still installed and a
    /// `DiscoveryError` lists the omissions. Calls already in flight keep
    /// using the snapshot they started with.
    pub async fn discover(&self) -> Result<Vec<ToolDescriptor>, DiscoveryError> {
        let _pass = self.discovery_lock.lock().await;

        let (found, failures) = lifecycle::discover_all(&self.configs).await;

        let mut server_tools = Vec::with_capacity(found.len());
        let mut fresh_streams = Vec::new();
        for (server_id, discovered) in found {
            let transport_kind = self
                .configs
                .get(&server_id)
                .map(ServerConfig::transport_kind)
                .unwrap_or(TransportKind::Stdio);
            if let Some(stream) = discovered.stream {
                fresh_streams.push((server_id.clone(), stream));
            }
            server_tools.push(ServerTools {
                server_id,
                transport_kind,
                tools: discovered.tools,
            });
        }

        {
            let mut streams = self.streams.lock().await;
            for (server_id, stream) in fresh_streams {
                streams.insert(server_id, stream);
            }
        }

        let snapshot = ToolSnapshot::build(server_tools);
        let descriptors: Vec<ToolDescriptor> =
            snapshot.descriptors().into_iter().cloned().collect();
        let available = descriptors.len();
        self.registry.replace(snapshot);

        for (server_id, err) in &failures {
            tracing::warn!(server = %server_id, error = %err, "server omitted from discovery");
        }
        tracing::info!(
            tools = available,
            servers = self.configs.len() - failures.len(),
            failed = failures.len(),
            "tool discovery complete"
        );

        if failures.is_empty() {
            Ok(descriptors)
        } else {
            Err(DiscoveryError {
                failures,
                available,
            })
        }
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    /// Open a task-scoped session for dispatching tool calls.
    pub fn session(self: &Arc<Self>) -> ToolSession {
        ToolSession {
            client: Arc::clone(self),
            processes: HashMap::new(),
            restart_counts: HashMap::new(),
        }
    }

    /// Shared stream connection for a server, reconnecting if it closed.
    ///
    /// The map lock is never held while connecting, so a slow server cannot
    /// stall calls to other stream servers.
    async fn stream_channel(&self, server_id: &str) -> Result<Arc<StreamTransport>, McpError> {
        if let Some(live) = self.live_stream(server_id).await {
            return Ok(live);
        }

        let config = self.config_for(server_id)?;
        let transport = lifecycle::connect_stream_server(server_id, config).await?;

        let mut streams = self.streams.lock().await;
        if let Some(existing) = streams.get(server_id) {
            // Another caller connected first; keep theirs and drop ours.
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
        }
        streams.insert(server_id.to_string(), Arc::clone(&transport));
        Ok(transport)
    }

    async fn live_stream(&self, server_id: &str) -> Option<Arc<StreamTransport>> {
        let streams = self.streams.lock().await;
        let existing = streams.get(server_id)?;
        if existing.is_closed() {
            tracing::info!(server = server_id, "stream channel closed, reconnecting");
            return None;
        }
        Some(Arc::clone(existing))
    }

    fn config_for(&self, server_id: &str) -> Result<&ServerConfig, McpError> {
        self.configs.get(server_id).ok_or(McpError::ConfigError {
            reason: format!("no configuration for server '{server_id}'"),
        })
    }
}

// ─── ToolSession ─────────────────────────────────────────────────────────────

/// Task-scoped dispatcher.
///
/// Stdio servers are started lazily on first use and kept for the life of
/// the session. A server that dies is dropped and respawned (with backoff)
/// on its next call.
pub struct ToolSession {
    client: Arc<McpClient>,
    /// Running stdio processes owned by this session.
    processes: HashMap<String, ManagedServer>,
    /// Servers started at least once, with how often they were restarted.
    restart_counts: HashMap<String, u32>,
}

impl ToolSession {
    /// Execute one tool call. Every failure is returned as an error result.
    ///
    /// Steps:
    /// 1. Resolve the name and check required arguments against the snapshot
    /// 2. Reach the owning server over its transport
    /// 3. Run `tools/call` under the per-call timeout
    pub async fn invoke(&mut self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let snapshot = self.client.snapshot();

        let desc = match snapshot.validate_call(call) {
            Ok(desc) => desc.clone(),
            Err(McpError::UnknownTool { name }) => {
                let detail = unknown_tool_detail(&snapshot, &name);
                tracing::warn!(tool = %name, "planner referenced unknown tool");
                return ToolResult::error(call, detail, elapsed_ms(start));
            }
            Err(e) => {
                tracing::warn!(tool = %call.tool_name, error = %e, "tool call rejected");
                return ToolResult::error(call, e.to_string(), elapsed_ms(start));
            }
        };

        let timeout = self.client.call_timeout;
        let outcome = tokio::time::timeout(timeout, self.dispatch(&desc, call)).await;
        let elapsed = elapsed_ms(start);

        let result = match outcome {
            Ok(Ok(CallOutcome::Payload(payload))) => ToolResult::ok(call, payload, elapsed),
            Ok(Ok(CallOutcome::ToolFailed(detail))) => ToolResult::error(call, detail, elapsed),
            Ok(Err(e)) => {
                if e.is_connection_fatal() {
                    self.discard(&desc).await;
                }
                ToolResult::error(call, e.to_string(), elapsed)
            }
            Err(_) => {
                let e = McpError::Timeout {
                    tool: desc.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                ToolResult::error(call, e.to_string(), elapsed)
            }
        };

        tracing::info!(
            tool = %desc.name,
            server = %desc.server_id,
            transport = desc.transport_kind.as_str(),
            status = result.status.as_str(),
            elapsed_ms = result.execution_time_ms,
            "tool call complete"
        );
        result
    }

    /// Servers with a live process in this session, sorted.
    pub fn running_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Restarts performed for a server in this session.
    pub fn restart_count(&self, server_id: &str) -> u32 {
        self.restart_counts.get(server_id).copied().unwrap_or(0)
    }

    /// Shut down every process this session started.
    pub async fn close(&mut self) {
        for (_, mut server) in self.processes.drain() {
            server.shutdown().await;
        }
    }

    async fn dispatch(
        &mut self,
        desc: &ToolDescriptor,
        call: &ToolCall,
    ) -> Result<CallOutcome, McpError> {
        match desc.transport_kind {
            TransportKind::Stdio => {
                let server = self.stdio_server(&desc.server_id).await?;
                lifecycle::call_tool(&server.transport, &desc.name, &call.args).await
            }
            TransportKind::Stream => {
                let channel = self.client.stream_channel(&desc.server_id).await?;
                lifecycle::call_tool(channel.as_ref(), &desc.name, &call.args).await
            }
        }
    }

    /// The session's process for a server, starting or restarting it as needed.
    async fn stdio_server(&mut self, server_id: &str) -> Result<&ManagedServer, McpError> {
        let alive = match self.processes.get_mut(server_id) {
            Some(server) => server.is_alive(),
            None => false,
        };

        if !alive {
            if self.processes.remove(server_id).is_some() {
                tracing::warn!(server = server_id, "stdio server exited, respawning");
            }
            let config = self.client.config_for(server_id)?;
            let server = match self.restart_counts.get(server_id).copied() {
                None => lifecycle::spawn_server(server_id, config).await?,
                Some(count) => lifecycle::restart_server(server_id, config, count).await?,
            };
            self.restart_counts
                .insert(server_id.to_string(), server.restart_count());
            self.processes.insert(server_id.to_string(), server);
        }

        self.processes
            .get(server_id)
            .ok_or(McpError::ServerCrashed {
                name: server_id.to_string(),
                reason: "server not running".into(),
            })
    }

    /// Drop a broken connection so the next call re-establishes it.
    async fn discard(&mut self, desc: &ToolDescriptor) {
        match desc.transport_kind {
            TransportKind::Stdio => {
                if let Some(mut server) = self.processes.remove(&desc.server_id) {
                    server.shutdown().await;
                }
            }
            // The shared channel marks itself closed; `stream_channel` reconnects.
            TransportKind::Stream => {}
        }
    }
}

/// "unknown tool" detail, with suggestions when there are close names.
fn unknown_tool_detail(snapshot: &ToolSnapshot, name: &str) -> String {
    match snapshot.resolve(name) {
        ToolResolution::NotFound { suggestions, .. } if !suggestions.is_empty() => {
            format!(
                "unknown tool '{name}' (did you mean: {}?)",
                suggestions.join(", ")
            )
        }
        _ => format!("unknown tool '{name}'"),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{write_stdio_server, MockStreamServer};
    use crate::mcp_client::types::ToolStatus;

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn stdio_client(dir: &std::path::Path, timeout_ms: u64) -> Arc<McpClient> {
        let mut config = McpServersConfig::default();
        config
            .servers
            .insert("local".into(), write_stdio_server(dir, ""));
        let mut client = McpClient::new(config);
        client.set_call_timeout(timeout_ms);
        let client = Arc::new(client);
        client.discover().await.unwrap();
        client
    }

    #[tokio::test]
    async fn unknown_tool_never_touches_a_transport() {
        let dir = tempfile::tempdir().unwrap();
        let client = stdio_client(dir.path(), 5_000).await;
        let mut session = client.session();

        let call = ToolCall::new("ecoh", serde_json::Map::new());
        let result = session.invoke(&call).await;
        assert_eq!(result.status, ToolStatus::Error);
        let detail = result.error_detail.unwrap();
        assert!(detail.starts_with("unknown tool 'ecoh'"));
        assert!(detail.contains("echo"));
        assert!(session.running_servers().is_empty());
        assert_eq!(result.request_id, call.request_id);
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let client = stdio_client(dir.path(), 5_000).await;
        let mut session = client.session();

        let result = session.invoke(&ToolCall::new("echo", serde_json::Map::new())).await;
        assert!(!result.is_ok());
        assert!(result.error_detail.unwrap().contains("text"));
        assert!(session.running_servers().is_empty());
    }

    #[tokio::test]
    async fn stdio_invoke_starts_server_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let client = stdio_client(dir.path(), 5_000).await;
        let mut session = client.session();
        assert!(session.running_servers().is_empty());

        let result = session
            .invoke(&ToolCall::new("echo", args(serde_json::json!({"text": "hi"}))))
            .await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(result.payload.unwrap()["text"], "hi");
        assert_eq!(session.running_servers(), vec!["local"]);

        let failed = session.invoke(&ToolCall::new("fail", serde_json::Map::new())).await;
        assert_eq!(failed.error_detail.as_deref(), Some("deliberate failure"));

        session.close().await;
        assert!(session.running_servers().is_empty());
    }

    #[tokio::test]
    async fn qualified_names_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let client = stdio_client(dir.path(), 5_000).await;
        let mut session = client.session();
        let result = session
            .invoke(&ToolCall::new("local.echo", args(serde_json::json!({"text": "q"}))))
            .await;
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn slow_tool_times_out_as_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let client = stdio_client(dir.path(), 200).await;
        let mut session = client.session();

        let result = session
            .invoke(&ToolCall::new("sleep", args(serde_json::json!({"ms": 2000}))))
            .await;
        assert!(!result.is_ok());
        assert!(result.error_detail.unwrap().contains("timed out after 200ms"));
    }

    #[tokio::test]
    async fn crashed_server_is_respawned_on_next_call() {
        let dir = tempfile::tempdir().unwrap();
        let client = stdio_client(dir.path(), 10_000).await;
        let mut session = client.session();

        let crashed = session.invoke(&ToolCall::new("crash", serde_json::Map::new())).await;
        assert!(!crashed.is_ok());
        assert!(session.running_servers().is_empty());

        let result = session
            .invoke(&ToolCall::new("echo", args(serde_json::json!({"text": "back"}))))
            .await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(session.restart_count("local"), 1);
    }

    #[tokio::test]
    async fn sessions_do_not_share_stdio_processes() {
        let dir = tempfile::tempdir().unwrap();
        let client = stdio_client(dir.path(), 5_000).await;
        let mut first = client.session();
        let mut second = client.session();

        let pid = |r: ToolResult| r.payload.unwrap()["pid"].as_u64().unwrap();
        let a1 = pid(first.invoke(&ToolCall::new("pid", serde_json::Map::new())).await);
        let a2 = pid(first.invoke(&ToolCall::new("pid", serde_json::Map::new())).await);
        let b = pid(second.invoke(&ToolCall::new("pid", serde_json::Map::new())).await);

        assert_eq!(a1, a2, "a session reuses its process");
        assert_ne!(a1, b, "sessions own separate processes");
    }

    #[tokio::test]
    async fn stream_invoke_reconnects_after_channel_loss() {
        let mock = MockStreamServer::start().await;
        let mut config = McpServersConfig::default();
        config.servers.insert("remote".into(), mock.config());
        let client = Arc::new(McpClient::new(config));
        let tools = client.discover().await.unwrap();
        assert!(tools.iter().all(|t| t.transport_kind == TransportKind::Stream));

        let mut session = client.session();
        let echo = ToolCall::new("stream_echo", args(serde_json::json!({"text": "one"})));
        let result = session.invoke(&echo).await;
        assert_eq!(result.payload.unwrap()["text"], "one");

        let lost = session.invoke(&ToolCall::new("hangup", serde_json::Map::new())).await;
        assert!(!lost.is_ok());

        let again = ToolCall::new("stream_echo", args(serde_json::json!({"text": "two"})));
        let result = session.invoke(&again).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(result.payload.unwrap()["text"], "two");
    }

    #[tokio::test]
    async fn partial_discovery_keeps_reachable_servers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = McpServersConfig::default();
        config
            .servers
            .insert("local".into(), write_stdio_server(dir.path(), ""));
        config.servers.insert(
            "offline".into(),
            ServerConfig::Stream {
                base_url: "http://127.0.0.1:9".into(),
                headers: HashMap::new(),
            },
        );
        let client = Arc::new(McpClient::new(config));

        let err = client.discover().await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, "offline");
        assert_eq!(err.available, 5);
        assert!(client.snapshot().get("echo").is_some());
    }

    #[tokio::test]
    async fn slow_stream_connect_does_not_block_other_servers() {
        // Accepts the event channel and never answers it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled_url = format!("http://{}", listener.local_addr().unwrap());
        let stalled = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        let healthy = MockStreamServer::start().await;

        let mut config = McpServersConfig::default();
        config.servers.insert(
            "stalled".into(),
            ServerConfig::Stream {
                base_url: stalled_url,
                headers: HashMap::new(),
            },
        );
        config.servers.insert("healthy".into(), healthy.config());
        let client = Arc::new(McpClient::new(config));

        let waiting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.stream_channel("stalled").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let channel = tokio::time::timeout(Duration::from_secs(2), client.stream_channel("healthy"))
            .await
            .expect("healthy server waited on the stalled connect")
            .unwrap();
        assert!(!channel.is_closed());
        assert!(!waiting.is_finished());

        // A second lookup reuses the live channel.
        let again = client.stream_channel("healthy").await.unwrap();
        assert!(Arc::ptr_eq(&channel, &again));

        waiting.abort();
        stalled.abort();
    }

    #[tokio::test]
    async fn refresh_does_not_disturb_held_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let client = stdio_client(dir.path(), 5_000).await;
        let held = client.snapshot();
        client.discover().await.unwrap();
        assert_eq!(held.len(), client.snapshot().len());
        assert!(!Arc::ptr_eq(&held, &client.snapshot()));
    }
}
