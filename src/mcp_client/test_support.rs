//! Mock tool servers for unit tests.
//!
//! - `MockStreamServer`: in-process HTTP endpoint speaking the event-channel
//!   protocol (`GET /events` + `POST /message`).
//! - `write_stdio_server`: writes a small python3 tool server to a temp dir.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::ServerConfig;

/// Sentinel pushed through the event queue to close the channel.
const HANGUP: &str = "__hangup__";

type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

pub(crate) struct MockStreamServer {
    pub base_url: String,
    accept_loop: JoinHandle<()>,
}

impl MockStreamServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink: EventSink = Arc::new(Mutex::new(None));

        let accept_loop = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(handle_connection(sock, Arc::clone(&sink)));
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            accept_loop,
        }
    }

    pub fn config(&self) -> ServerConfig {
        ServerConfig::Stream {
            base_url: self.base_url.clone(),
            headers: HashMap::new(),
        }
    }
}

impl Drop for MockStreamServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn handle_connection(mut sock: TcpStream, sink: EventSink) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();

    if head.starts_with("GET /events") {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Ok(mut slot) = sink.lock() {
            *slot = Some(tx);
        }
        let headers = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                       cache-control: no-cache\r\nconnection: close\r\n\r\n";
        if sock.write_all(headers.as_bytes()).await.is_err() {
            return;
        }
        let _ = sock.write_all(b": ready\n\n").await;
        while let Some(data) = rx.recv().await {
            if data == HANGUP {
                break;
            }
            if sock.write_all(format!("data: {data}\n\n").as_bytes()).await.is_err() {
                break;
            }
            let _ = sock.flush().await;
        }
        let _ = sock.shutdown().await;
        return;
    }

    let content_length = head
        .lines()
        .find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .and_then(|v| v.trim().parse::<usize>().ok())
        })
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let body = buf[header_end..header_end + content_length].to_vec();

    let _ = sock
        .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
        .await;
    let _ = sock.shutdown().await;

    let Ok(msg) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return;
    };
    let Some(id) = msg.get("id").and_then(|v| v.as_u64()) else {
        return;
    };
    let method = msg["method"].as_str().unwrap_or_default().to_string();
    let params = msg.get("params").cloned().unwrap_or(serde_json::Value::Null);

    let (delay_ms, reply) = answer(id, &method, &params);
    let sender = sink.lock().ok().and_then(|s| s.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        if let Some(tx) = sender {
            let _ = tx.send(reply);
        }
    });
}

fn answer(id: u64, method: &str, params: &serde_json::Value) -> (u64, String) {
    let ok = |result: serde_json::Value| {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
    };
    match method {
        "initialize" => (0, ok(serde_json::json!({"serverInfo": {"name": "mock-stream"}}))),
        "tools/list" => (
            0,
            ok(serde_json::json!({"tools": [
                {
                    "name": "stream_echo",
                    "description": "Echo text over the stream channel",
                    "inputSchema": {"type": "object", "required": ["text"]}
                },
                {"name": "hangup", "description": "Close the event channel", "inputSchema": {}}
            ]})),
        ),
        "tools/call" => {
            let args = &params["arguments"];
            match params["name"].as_str().unwrap_or_default() {
                "echo" | "stream_echo" => (
                    args["delay_ms"].as_u64().unwrap_or(0),
                    ok(serde_json::json!({
                        "content": [{"type": "text", "text": args["text"]}],
                        "structuredContent": {"text": args["text"]}
                    })),
                ),
                "hangup" => (0, HANGUP.to_string()),
                other => (
                    0,
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": format!("unknown tool {other}")}
                    })
                    .to_string(),
                ),
            }
        }
        _ => (
            0,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "method not found"}
            })
            .to_string(),
        ),
    }
}

// ─── stdio mock ──────────────────────────────────────────────────────────────

const STDIO_SERVER_PY: &str = r#"
import json, os, sys, time

PREFIX = os.environ.get("TOOL_PREFIX", "")
TOOLS = [
    {"name": "echo", "description": "Echo text back",
     "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}},
    {"name": "pid", "description": "Report the server process id", "inputSchema": {"type": "object"}},
    {"name": "sleep", "description": "Sleep for ms milliseconds", "inputSchema": {"type": "object"}},
    {"name": "fail", "description": "Always fails", "inputSchema": {"type": "object"}},
    {"name": "crash", "description": "Exit the process", "inputSchema": {"type": "object"}},
]

def reply(msg_id, result=None, error=None):
    msg = {"jsonrpc": "2.0", "id": msg_id}
    if error is not None:
        msg["error"] = error
    else:
        msg["result"] = result
    sys.stdout.write(json.dumps(msg) + "\n")
    sys.stdout.flush()

def text(value):
    return {"content": [{"type": "text", "text": json.dumps(value)}]}

print("mock server starting", flush=True)
for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    if "id" not in msg:
        if msg.get("method") == "shutdown":
            break
        continue
    method = msg.get("method")
    params = msg.get("params") or {}
    if method == "initialize":
        reply(msg["id"], {"serverInfo": {"name": "mock", "version": "1"}, "capabilities": {}})
    elif method == "tools/list":
        reply(msg["id"], {"tools": [dict(t, name=PREFIX + t["name"]) for t in TOOLS]})
    elif method == "tools/call":
        name = (params.get("name") or "")[len(PREFIX):]
        args = params.get("arguments") or {}
        if name == "echo":
            reply(msg["id"], text({"text": args.get("text")}))
        elif name == "pid":
            reply(msg["id"], text({"pid": os.getpid()}))
        elif name == "sleep":
            time.sleep(args.get("ms", 0) / 1000.0)
            reply(msg["id"], text({"slept": args.get("ms", 0)}))
        elif name == "fail":
            reply(msg["id"], {"content": [{"type": "text", "text": "deliberate failure"}], "isError": True})
        elif name == "crash":
            sys.exit(3)
        else:
            reply(msg["id"], error={"code": -32601, "message": "unknown tool " + name})
    else:
        reply(msg["id"], error={"code": -32601, "message": "method not found"})
"#;

/// Write the python mock server into `dir` and return a config that runs it.
pub(crate) fn write_stdio_server(dir: &Path, tool_prefix: &str) -> ServerConfig {
    let path: PathBuf = dir.join(format!("{tool_prefix}mock_server.py"));
    std::fs::write(&path, STDIO_SERVER_PY).unwrap();
    let mut env = HashMap::new();
    env.insert("TOOL_PREFIX".to_string(), tool_prefix.to_string());
    ServerConfig::Stdio {
        command: "python3".into(),
        args: vec![path.to_string_lossy().into_owned()],
        env,
        cwd: None,
    }
}
