//! Agent Core: the task loop and everything it remembers.
//!
//! Submodules:
//! - `orchestrator`: Perceive → plan → act → observe state machine
//! - `perception`: Structured intent from the raw request
//! - `planner`: One next action per step, plus the evidence guardrail
//! - `plan_parser`: JSON + bracket parsers for model output
//! - `fast_path`: Configurable deterministic workflows
//! - `memory`: Semantic store of prior (query, result) pairs
//! - `conversation`: Per-task event log and export
//! - `database`: SQLite persistence for tasks, events and memory
//! - `tokens`: Prompt budgeting and UTF-8 safe truncation
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod database;
pub mod errors;
pub mod fast_path;
pub mod memory;
pub mod orchestrator;
pub mod perception;
pub mod plan_parser;
pub mod planner;
pub mod tokens;
pub mod types;

// Re-exports for convenience
pub use conversation::{ConversationLog, ConversationStore};
pub use database::AgentDatabase;
pub use errors::AgentError;
pub use fast_path::{FastPathRouter, FastPathRule, WorkflowPlan};
pub use memory::MemoryStore;
pub use orchestrator::Orchestrator;
pub use perception::PERCEPTION_INSTRUCTIONS;
pub use planner::PLANNER_INSTRUCTIONS;
pub use types::{
    Action, ConversationEvent, EventType, MemoryRecord, OrchestratorConfig, Perception,
    TaskDelta, TaskError, TaskErrorKind, TaskMetadata, TaskOptions, TaskResult, TaskStatus,
};
