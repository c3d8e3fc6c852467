//! Agent Core error types.

use thiserror::Error;

/// Errors that can occur inside the agent core.
///
/// None of these escape `submit_task`: the orchestrator folds them into a
/// `TaskError` or logs and continues.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Planner output could not be parsed into an action.
    #[error("planner output could not be parsed: {reason}")]
    ParseError { reason: String, raw: String },

    /// The language model could not be reached.
    #[error("language model unavailable: {reason}")]
    PlannerUnavailable { reason: String },

    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// Embedding backend failed during a memory operation.
    #[error("memory backend error: {reason}")]
    MemoryBackend { reason: String },

    /// Invalid agent configuration (e.g. a fast-path rule).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Task id not known to the conversation store.
    #[error("task not found: '{task_id}'")]
    TaskNotFound { task_id: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}
