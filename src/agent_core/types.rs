//! Shared types for the agent core.
//!
//! Conversation events, memory records, planner actions, task options and
//! results, and the orchestrator's tunables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ─── Conversation Events ────────────────────────────────────────────────────

/// Kind of a conversation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserPrompt,
    Perception,
    Plan,
    ToolCall,
    ToolResult,
    FinalAnswer,
    Error,
}

impl EventType {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserPrompt => "user_prompt",
            EventType::Perception => "perception",
            EventType::Plan => "plan",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::FinalAnswer => "final_answer",
            EventType::Error => "error",
        }
    }

    /// Parse from database string representation. Unknown values read as `Error`.
    pub fn parse(s: &str) -> Self {
        match s {
            "user_prompt" => EventType::UserPrompt,
            "perception" => EventType::Perception,
            "plan" => EventType::Plan,
            "tool_call" => EventType::ToolCall,
            "tool_result" => EventType::ToolResult,
            "final_answer" => EventType::FinalAnswer,
            _ => EventType::Error,
        }
    }
}

/// One append-only entry in a task's conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub task_id: String,
    /// Starts at 1, strictly increasing within a task.
    pub sequence_no: u64,
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ─── Task State ─────────────────────────────────────────────────────────────

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

// ─── Memory ─────────────────────────────────────────────────────────────────

/// A stored (query, result) pair with the query's embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub query_text: String,
    pub embedding: Vec<f32>,
    pub result_summary: String,
    pub created_at: DateTime<Utc>,
}

// ─── Perception & Planning ──────────────────────────────────────────────────

/// Structured reading of the user's request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perception {
    pub intent: String,
    #[serde(default)]
    pub tool_hints: Vec<String>,
    /// Whether answering needs external lookups.
    #[serde(default)]
    pub requires_tools: bool,
}

/// The single next step the planner chose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    ToolCall {
        tool: String,
        #[serde(default)]
        args: serde_json::Map<String, serde_json::Value>,
    },
    FinalAnswer {
        answer: String,
    },
}

// ─── Task Submission ────────────────────────────────────────────────────────

/// Progress update streamed to the caller while a task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskDelta {
    Started { task_id: String },
    FastPath { rule: String },
    Planned { step: u32, action: Action },
    GuardrailRejected { step: u32 },
    ToolStarted { tool: String, request_id: String },
    ToolFinished { tool: String, ok: bool, execution_time_ms: u64 },
    Finished { success: bool },
}

/// Per-task options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Overrides the configured step budget.
    pub max_steps: Option<u32>,
    /// Intent supplied by the caller; used for fast-path matching.
    pub intent_hint: Option<String>,
    /// Receives one delta per planner/tool update. Closed receivers are ignored.
    pub deltas: Option<mpsc::Sender<TaskDelta>>,
    /// Cancels the task between steps.
    pub cancel: Option<CancellationToken>,
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    MaxSteps,
    ParseError,
    PlannerUnavailable,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub step_count: u32,
    pub tool_call_count: u32,
    /// Name of the fast-path rule that completed the task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_path: Option<String>,
}

/// Outcome of `submit_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub metadata: TaskMetadata,
}

// ─── Orchestrator Tunables ──────────────────────────────────────────────────

/// The `orchestrator` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Step budget per task (default: 8).
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Tool calls required before a final answer is accepted on tasks that
    /// need tools (default: 1).
    #[serde(default = "default_min_tool_evidence")]
    pub min_tool_evidence: u32,
    /// Memory records retrieved per step (default: 3).
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
    /// Bound on each language-model call (default: 60s).
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Bound on each embedding call (default: 10s).
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
    /// Capacity of the delta channel the CLI creates (default: 32).
    #[serde(default = "default_delta_buffer")]
    pub delta_buffer: usize,
    /// Tool output longer than this is clipped before planning (default: 6000).
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
}

fn default_max_steps() -> u32 {
    8
}
fn default_min_tool_evidence() -> u32 {
    1
}
fn default_memory_top_k() -> usize {
    3
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_embed_timeout_secs() -> u64 {
    10
}
fn default_delta_buffer() -> usize {
    32
}
fn default_max_tool_result_chars() -> usize {
    6000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            min_tool_evidence: default_min_tool_evidence(),
            memory_top_k: default_memory_top_k(),
            llm_timeout_secs: default_llm_timeout_secs(),
            embed_timeout_secs: default_embed_timeout_secs(),
            delta_buffer: default_delta_buffer(),
            max_tool_result_chars: default_max_tool_result_chars(),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
