//! Shared fixtures for the end-to-end scenarios.
//!
//! - `carbon_tools`: a python3 stdio tool server with emission estimates,
//!   a job poller that never finishes, a sleeper and a failing tool.
//! - `RegionBackend`: a language model that answers from the prompt it is
//!   given, so concurrent tasks can share one backend.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use taskpilot::agent_core::{ConversationEvent, EventType, PERCEPTION_INSTRUCTIONS, PLANNER_INSTRUCTIONS};
use taskpilot::inference::scripted::hashed_embedding;
use taskpilot::inference::{InferenceError, LlmBackend, ScriptedBackend};
use taskpilot::mcp_client::{McpClient, McpServersConfig, ServerConfig};

// ─── Tool Server ────────────────────────────────────────────────────────────

const CARBON_SERVER_PY: &str = r#"
import json, sys, time

TOOLS = [
    {"name": "estimate_emissions", "description": "Estimate annual CO2 emissions for one region",
     "inputSchema": {"type": "object", "properties": {"region": {"type": "string"}}, "required": ["region"]}},
    {"name": "poll_job", "description": "Check a long-running job",
     "inputSchema": {"type": "object", "properties": {"job_id": {"type": "string"}}}},
    {"name": "sleep", "description": "Sleep for ms milliseconds", "inputSchema": {"type": "object"}},
    {"name": "fail", "description": "Always fails", "inputSchema": {"type": "object"}},
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

def tonnes(region):
    return sum(ord(c) for c in region) * 1000

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
        reply(msg["id"], {"serverInfo": {"name": "carbon", "version": "1"}, "capabilities": {}})
    elif method == "tools/list":
        reply(msg["id"], {"tools": TOOLS})
    elif method == "tools/call":
        name = params.get("name") or ""
        args = params.get("arguments") or {}
        if name == "estimate_emissions":
            region = args.get("region", "")
            reply(msg["id"], text({"region": region, "tonnes_co2": tonnes(region)}))
        elif name == "poll_job":
            reply(msg["id"], text({"job_id": args.get("job_id"), "status": "pending"}))
        elif name == "sleep":
            time.sleep(args.get("ms", 0) / 1000.0)
            reply(msg["id"], text({"slept": args.get("ms", 0)}))
        elif name == "fail":
            reply(msg["id"], {"content": [{"type": "text", "text": "deliberate failure"}], "isError": True})
        else:
            reply(msg["id"], error={"code": -32601, "message": "unknown tool " + name})
    else:
        reply(msg["id"], error={"code": -32601, "message": "method not found"})
"#;

/// Deterministic estimate the mock server reports for `region`.
pub fn expected_tonnes(region: &str) -> u64 {
    region.chars().map(|c| c as u64).sum::<u64>() * 1000
}

/// Start the carbon tool server from `dir` and discover its tools.
pub async fn carbon_tools(dir: &Path) -> Arc<McpClient> {
    let script = dir.join("carbon_server.py");
    std::fs::write(&script, CARBON_SERVER_PY).unwrap();

    let mut config = McpServersConfig::default();
    config.servers.insert(
        "carbon".into(),
        ServerConfig::Stdio {
            command: "python3".into(),
            args: vec![script.to_string_lossy().into_owned()],
            env: HashMap::new(),
            cwd: None,
        },
    );
    let client = Arc::new(McpClient::new(config));
    let tools = client.discover().await.unwrap();
    assert_eq!(tools.len(), 4);
    client
}

// ─── Language Models ────────────────────────────────────────────────────────

/// Canned perception plus a planner script.
pub fn scripted(perception: &str, plans: &[&str]) -> Arc<ScriptedBackend> {
    Arc::new(
        ScriptedBackend::new()
            .route(PERCEPTION_INSTRUCTIONS, [perception])
            .route(PLANNER_INSTRUCTIONS, plans.iter().copied()),
    )
}

/// Reads the region from the last word of the request and estimates it once.
pub struct RegionBackend;

fn last_word(text: &str) -> &str {
    text.split_whitespace()
        .last()
        .unwrap_or_default()
        .trim_matches(|c: char| !c.is_alphanumeric())
}

#[async_trait]
impl LlmBackend for RegionBackend {
    async fn generate_text(&self, prompt: &str, context: &str) -> Result<String, InferenceError> {
        if context.starts_with(PERCEPTION_INSTRUCTIONS) {
            let region = last_word(prompt);
            return Ok(serde_json::json!({
                "intent": format!("estimate emissions for {region}"),
                "tool_hints": ["estimate_emissions"],
                "requires_tools": true,
            })
            .to_string());
        }

        // The first planner line is `Task: <intent>`.
        let intent = prompt.lines().next().unwrap_or_default();
        let region = last_word(intent);
        let action = if prompt.contains("tool_result:") {
            serde_json::json!({"action": "final_answer", "answer": format!("## Emissions for {region}")})
        } else {
            serde_json::json!({
                "action": "tool_call",
                "tool": "estimate_emissions",
                "args": {"region": region},
            })
        };
        Ok(action.to_string())
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        Ok(hashed_embedding(text))
    }
}

// ─── Event Helpers ──────────────────────────────────────────────────────────

pub fn of_type(events: &[ConversationEvent], event_type: EventType) -> Vec<&ConversationEvent> {
    events.iter().filter(|e| e.event_type == event_type).collect()
}

pub fn position(events: &[ConversationEvent], event_type: EventType) -> Option<usize> {
    events.iter().position(|e| e.event_type == event_type)
}
