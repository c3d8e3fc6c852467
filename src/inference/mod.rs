//! Inference: the language-model collaborator behind a narrow interface.
//!
//! This module handles:
//! - The `LlmBackend` trait (`generate_text`, `embed_text`)
//! - An OpenAI-compatible HTTP client with a model fallback chain
//! - A scripted backend for offline runs and tests
//! - Model configuration with env-var interpolation
//!
//! Swapping a hosted model for a local one is a config change, not a code change.

pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod scripted;
pub mod types;

// Re-exports for convenience
pub use backend::{cosine_similarity, LlmBackend};
pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use scripted::ScriptedBackend;
