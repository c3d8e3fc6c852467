//! Tool server lifecycle management.
//!
//! Spawning, handshaking, listing tools, restarting and shutting down stdio
//! server processes, and opening stream channels. The JSON-RPC helpers here
//! (`handshake`, `list_tools`, `call_tool`) work over any `RpcChannel`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::sleep;

use super::errors::McpError;
use super::stream::StreamTransport;
use super::transport::{extract_result, interpret_tool_output, RpcChannel, StdioTransport};
use super::types::{InitializeResult, ListToolsResult, McpToolDefinition, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum restart attempts before giving up on a server within one session.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// Timeout for the initialize handshake plus tool listing.
///
/// Generous because some tool servers load large libraries at startup.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum stderr captured into an init failure message.
const MAX_STDERR_CHARS: usize = 2000;

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running stdio tool server process with its transport.
pub struct ManagedServer {
    /// Server id from config.
    pub name: String,
    process: Child,
    pub transport: StdioTransport,
    restart_count: u32,
}

impl ManagedServer {
    /// How many times this server has been restarted.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Check if the server process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Attempt to gracefully shut down the server, killing it on timeout.
    pub async fn shutdown(&mut self) {
        let _ = self.transport.notify("shutdown", None).await;

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.process.wait()).await {
            Ok(Ok(_)) => {}
            _ => {
                let _ = self.process.kill().await;
            }
        }
        tracing::debug!(server = %self.name, "server shut down");
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a stdio server process and perform the initialization handshake.
pub async fn spawn_server(name: &str, config: &ServerConfig) -> Result<ManagedServer, McpError> {
    let ServerConfig::Stdio {
        command,
        args,
        env,
        cwd,
    } = config
    else {
        return Err(McpError::ConfigError {
            reason: format!("server '{name}' is not a stdio server"),
        });
    };

    let mut cmd = Command::new(command);
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr_handle = child.stderr.take();

    let transport = StdioTransport::new(name, stdin, stdout);

    let failure = match tokio::time::timeout(INIT_TIMEOUT, handshake(&transport)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!(
            "initialization timed out after {}s",
            INIT_TIMEOUT.as_secs()
        )),
    };

    if let Some(reason) = failure {
        let _ = child.kill().await;
        let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
        if !stderr_ctx.is_empty() {
            tracing::warn!(server = name, stderr = %stderr_ctx, "server stderr captured on failure");
        }
        return Err(McpError::InitFailed {
            name: name.to_string(),
            reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
        });
    }

    tracing::info!(server = name, pid = child.id(), "stdio server started");

    Ok(ManagedServer {
        name: name.to_string(),
        process: child,
        transport,
        restart_count: 0,
    })
}

/// Open a stream channel and perform the initialization handshake.
pub async fn connect_stream_server(
    name: &str,
    config: &ServerConfig,
) -> Result<Arc<StreamTransport>, McpError> {
    let ServerConfig::Stream { base_url, headers } = config else {
        return Err(McpError::ConfigError {
            reason: format!("server '{name}' is not a stream server"),
        });
    };

    let transport = tokio::time::timeout(INIT_TIMEOUT, async {
        let transport = StreamTransport::connect(name, base_url, headers).await?;
        handshake(&transport).await?;
        Ok::<_, McpError>(transport)
    })
    .await
    .map_err(|_| McpError::InitFailed {
        name: name.to_string(),
        reason: format!("initialization timed out after {}s", INIT_TIMEOUT.as_secs()),
    })??;

    Ok(Arc::new(transport))
}

/// Read any available stderr output from a failed server process.
async fn read_stderr_on_failure(stderr_handle: Option<tokio::process::ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > MAX_STDERR_CHARS {
                let cut = crate::agent_core::tokens::truncate_utf8(&buf, MAX_STDERR_CHARS).len();
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Protocol ────────────────────────────────────────────────────────────────

/// Perform the `initialize` handshake.
pub async fn handshake(channel: &dyn RpcChannel) -> Result<(), McpError> {
    let params = serde_json::json!({
        "clientInfo": {"name": "taskpilot", "version": env!("CARGO_PKG_VERSION")},
    });
    let result = extract_result(channel.request("initialize", Some(params)).await?)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: channel.server_name().to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    tracing::debug!(
        server = channel.server_name(),
        reported_name = ?init.server_info.as_ref().and_then(|i| i.name.clone()),
        "handshake complete"
    );

    let _ = channel.notify("notifications/initialized", None).await;
    Ok(())
}

/// Ask a server for its tool definitions.
pub async fn list_tools(channel: &dyn RpcChannel) -> Result<Vec<McpToolDefinition>, McpError> {
    let result = extract_result(channel.request("tools/list", None).await?)?;
    let listed: ListToolsResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: channel.server_name().to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;
    Ok(listed.tools)
}

/// Outcome of one `tools/call` exchange.
#[derive(Debug)]
pub enum CallOutcome {
    /// The tool ran and produced a payload.
    Payload(serde_json::Value),
    /// The server answered, but the tool failed.
    ToolFailed(String),
}

/// Run one `tools/call`. `Err` means the exchange itself failed.
pub async fn call_tool(
    channel: &dyn RpcChannel,
    tool_name: &str,
    args: &serde_json::Map<String, serde_json::Value>,
) -> Result<CallOutcome, McpError> {
    let params = serde_json::json!({
        "name": tool_name,
        "arguments": args,
    });
    let response = channel.request("tools/call", Some(params)).await?;

    match extract_result(response) {
        Ok(body) => Ok(match interpret_tool_output(body) {
            Ok(payload) => CallOutcome::Payload(payload),
            Err(detail) => CallOutcome::ToolFailed(detail),
        }),
        Err(McpError::ServerError { code, message, .. }) => {
            Ok(CallOutcome::ToolFailed(format!("[{code}] {message}")))
        }
        Err(e) => Err(e),
    }
}

// ─── Restart ─────────────────────────────────────────────────────────────────

/// Respawn a crashed stdio server with exponential backoff (1s, 2s, 4s).
pub async fn restart_server(
    name: &str,
    config: &ServerConfig,
    current_restart_count: u32,
) -> Result<ManagedServer, McpError> {
    if current_restart_count >= MAX_RESTART_ATTEMPTS {
        return Err(McpError::RestartExhausted {
            name: name.to_string(),
            attempts: MAX_RESTART_ATTEMPTS,
        });
    }

    let delay = restart_delay(current_restart_count);
    tracing::warn!(
        server = name,
        attempt = current_restart_count + 1,
        delay_ms = delay.as_millis() as u64,
        "restarting stdio server"
    );
    sleep(delay).await;

    let mut server = spawn_server(name, config).await?;
    server.restart_count = current_restart_count + 1;
    Ok(server)
}

fn restart_delay(restart_count: u32) -> Duration {
    RESTART_BASE_DELAY * 2u32.pow(restart_count)
}

// ─── Discovery ───────────────────────────────────────────────────────────────

/// What one server reported at discovery time.
pub struct DiscoveredServer {
    pub tools: Vec<McpToolDefinition>,
    /// Open channel for stream servers, kept as the shared connection.
    pub stream: Option<Arc<StreamTransport>>,
}

/// Query one server for its tools.
///
/// Stdio servers are spawned, listed and shut down again (sessions start
/// their own processes lazily). Stream servers keep the opened channel.
pub async fn discover_server(name: &str, config: &ServerConfig) -> Result<DiscoveredServer, McpError> {
    match config {
        ServerConfig::Stdio { .. } => {
            let mut server = spawn_server(name, config).await?;
            let tools = tokio::time::timeout(INIT_TIMEOUT, list_tools(&server.transport)).await;
            server.shutdown().await;
            let tools = tools.map_err(|_| McpError::InitFailed {
                name: name.to_string(),
                reason: "tools/list timed out".into(),
            })??;
            Ok(DiscoveredServer {
                tools,
                stream: None,
            })
        }
        ServerConfig::Stream { .. } => {
            let transport = connect_stream_server(name, config).await?;
            let tools = tokio::time::timeout(INIT_TIMEOUT, list_tools(transport.as_ref()))
                .await
                .map_err(|_| McpError::InitFailed {
                    name: name.to_string(),
                    reason: "tools/list timed out".into(),
                })??;
            Ok(DiscoveredServer {
                tools,
                stream: Some(transport),
            })
        }
    }
}

/// Discover all configured servers concurrently.
///
/// Servers that fail are reported but do not prevent the others from being
/// used (partial discovery is acceptable).
pub async fn discover_all(
    configs: &HashMap<String, ServerConfig>,
) -> (HashMap<String, DiscoveredServer>, Vec<(String, McpError)>) {
    let mut discovered = HashMap::new();
    let mut errors = Vec::new();

    let mut handles = Vec::new();
    for (name, config) in configs {
        let name = name.clone();
        let config = config.clone();
        handles.push((
            name.clone(),
            tokio::spawn(async move { discover_server(&name, &config).await }),
        ));
    }

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(server)) => {
                discovered.insert(name, server);
            }
            Ok(Err(e)) => errors.push((name, e)),
            Err(e) => {
                errors.push((
                    name.clone(),
                    McpError::SpawnFailed {
                        name,
                        reason: format!("join error: {e}"),
                    },
                ));
            }
        }
    }

    (discovered, errors)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{write_stdio_server, MockStreamServer};

    #[test]
    fn restart_delay_doubles() {
        assert_eq!(restart_delay(0), Duration::from_secs(1));
        assert_eq!(restart_delay(1), Duration::from_secs(2));
        assert_eq!(restart_delay(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn restart_exhausted_after_max_attempts() {
        let config = ServerConfig::Stdio {
            command: "true".into(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        };
        let err = restart_server("x", &config, MAX_RESTART_ATTEMPTS)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::RestartExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let config = ServerConfig::Stdio {
            command: "/nonexistent/tool-server".into(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        };
        let err = spawn_server("ghost", &config).await.err().unwrap();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn stdio_discovery_lists_tools() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_stdio_server(dir.path(), "");
        let discovered = discover_server("mock", &config).await.unwrap();
        let names: Vec<_> = discovered.tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"echo"));
        assert!(discovered.stream.is_none());
    }

    #[tokio::test]
    async fn stdio_call_and_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_stdio_server(dir.path(), "");
        let mut server = spawn_server("mock", &config).await.unwrap();

        let mut args = serde_json::Map::new();
        args.insert("text".into(), serde_json::json!("hi"));
        match call_tool(&server.transport, "echo", &args).await.unwrap() {
            CallOutcome::Payload(p) => assert_eq!(p["text"], "hi"),
            other => panic!("unexpected {other:?}"),
        }

        match call_tool(&server.transport, "fail", &serde_json::Map::new()).await.unwrap() {
            CallOutcome::ToolFailed(detail) => assert_eq!(detail, "deliberate failure"),
            other => panic!("unexpected {other:?}"),
        }

        match call_tool(&server.transport, "nope", &serde_json::Map::new()).await.unwrap() {
            CallOutcome::ToolFailed(detail) => assert!(detail.contains("-32601")),
            other => panic!("unexpected {other:?}"),
        }

        server.shutdown().await;
        assert!(!server.is_alive());
    }

    #[tokio::test]
    async fn stream_discovery_keeps_channel_open() {
        let mock = MockStreamServer::start().await;
        let discovered = discover_server("remote", &mock.config()).await.unwrap();
        assert_eq!(discovered.tools[0].name, "stream_echo");
        let stream = discovered.stream.unwrap();
        assert!(!stream.is_closed());
    }

    #[tokio::test]
    async fn discover_all_reports_partial_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut configs = HashMap::new();
        configs.insert("good".to_string(), write_stdio_server(dir.path(), ""));
        configs.insert(
            "bad".to_string(),
            ServerConfig::Stream {
                base_url: "http://127.0.0.1:9".into(),
                headers: HashMap::new(),
            },
        );

        let (ok, errors) = discover_all(&configs).await;
        assert!(ok.contains_key("good"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "bad");
    }
}
