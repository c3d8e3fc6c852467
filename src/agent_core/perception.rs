//! Perception: turn the raw request into a structured intent.
//!
//! One language-model call per task. Failures never stop the task; the
//! request itself becomes the intent and no hints are given.

use std::sync::Arc;
use std::time::Duration;

use super::plan_parser::parse_perception;
use super::types::Perception;
use crate::inference::LlmBackend;

/// System instructions for the perception call.
pub const PERCEPTION_INSTRUCTIONS: &str = "\
You read a user's request and describe it for a planning agent.
Respond with exactly one JSON object and nothing else:
{\"intent\": \"<the request restated as one short imperative sentence>\",
 \"tool_hints\": [\"<tool or server names that look relevant>\"],
 \"requires_tools\": <true if answering needs data from a tool, else false>}
Only name tools that appear in the capability list.";

pub struct Perceiver {
    backend: Arc<dyn LlmBackend>,
    timeout: Duration,
}

impl Perceiver {
    pub fn new(backend: Arc<dyn LlmBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Read `prompt` against the current capability summary.
    pub async fn perceive(&self, prompt: &str, capability_summary: &str) -> Perception {
        let context = format!("{PERCEPTION_INSTRUCTIONS}\n\n{capability_summary}");

        let reply = tokio::time::timeout(self.timeout, self.backend.generate_text(prompt, &context)).await;
        let text = match reply {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "perception call failed, using raw prompt");
                return fallback(prompt);
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "perception timed out, using raw prompt"
                );
                return fallback(prompt);
            }
        };

        match parse_perception(&text) {
            Some(perception) => {
                tracing::info!(
                    intent = %perception.intent,
                    hints = perception.tool_hints.len(),
                    requires_tools = perception.requires_tools,
                    "request perceived"
                );
                perception
            }
            None => {
                tracing::warn!("perception output unusable, using raw prompt");
                fallback(prompt)
            }
        }
    }
}

fn fallback(prompt: &str) -> Perception {
    Perception {
        intent: prompt.trim().to_string(),
        tool_hints: Vec::new(),
        requires_tools: false,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
