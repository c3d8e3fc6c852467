//! Planner: ask the language model for exactly one next action.
//!
//! Each call builds a prompt from the intent, the tool catalogue (narrowed
//! by perception hints), relevant memory and the step history, and parses
//! the reply into an `Action`.
//!
//! Failure handling:
//! - Unparseable output gets one corrective retry, then `ParseError`
//! - A failed or timed-out model call is retried once, then `PlannerUnavailable`
//!
//! The guardrail sits beside the planner: it rejects a `FinalAnswer` that
//! arrives before enough tool evidence exists.

use std::sync::Arc;
use std::time::Duration;

use super::errors::AgentError;
use super::plan_parser::parse_action;
use super::types::{Action, MemoryRecord, Perception};
use crate::inference::LlmBackend;
use crate::mcp_client::registry::render_catalogue;
use crate::mcp_client::{ToolDescriptor, ToolSnapshot};

/// System instructions for planning calls.
pub const PLANNER_INSTRUCTIONS: &str = "\
You are the planning step of a tool-using agent. Decide the single next action.
Reply with exactly one JSON object and nothing else, either
{\"action\": \"tool_call\", \"tool\": \"<tool name>\", \"args\": {<arguments matching the input schema>}}
or
{\"action\": \"final_answer\", \"answer\": \"<complete answer for the user>\"}
Use only tools from the list below. If a tool returned an error, retry with \
different arguments, choose another tool, or answer with what you have.";

/// Sent with the repeated request after unparseable output.
const CORRECTIVE_NOTE: &str = "Your previous reply could not be parsed";

/// Memory summaries longer than this are clipped in prompts.
const MEMORY_SNIPPET_CHARS: usize = 300;

// ─── Tool Selection ─────────────────────────────────────────────────────────

/// Descriptors offered to the planner.
///
/// Hints narrow the set; when no descriptor matches any hint the full set
/// is used.
pub fn select_tools<'a>(snapshot: &'a ToolSnapshot, hints: &[String]) -> Vec<&'a ToolDescriptor> {
    let narrowed = snapshot.matching_hints(hints);
    if narrowed.is_empty() {
        if !hints.is_empty() {
            tracing::debug!(hints = ?hints, "no tool matched perception hints, offering all tools");
        }
        return snapshot.descriptors();
    }
    narrowed
}

// ─── Planner ────────────────────────────────────────────────────────────────

pub struct Planner {
    backend: Arc<dyn LlmBackend>,
    timeout: Duration,
}

impl Planner {
    pub fn new(backend: Arc<dyn LlmBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Produce the next action.
    pub async fn plan(
        &self,
        intent: &str,
        tools: &[&ToolDescriptor],
        memory_hits: &[MemoryRecord],
        history: &str,
    ) -> Result<Action, AgentError> {
        let context = build_context(tools);
        let prompt = build_prompt(intent, memory_hits, history);

        let first = self.generate(&prompt, &context).await?;
        let reason = match parse_action(&first) {
            Ok(action) => return Ok(action),
            Err(reason) => reason,
        };

        tracing::warn!(reason = %reason, "planner output unparseable, retrying with correction");
        let corrective = format!(
            "{prompt}\n\n{CORRECTIVE_NOTE} ({reason}). \
             Reply again with exactly one JSON object as described."
        );
        let second = self.generate(&corrective, &context).await?;
        parse_action(&second).map_err(|reason| AgentError::ParseError { reason, raw: second })
    }

    /// One model call with a single retry on error or timeout.
    async fn generate(&self, prompt: &str, context: &str) -> Result<String, AgentError> {
        let mut last_error = String::new();
        for attempt in 1..=2u32 {
            match tokio::time::timeout(self.timeout, self.backend.generate_text(prompt, context)).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {}s", self.timeout.as_secs_f32()),
            }
            tracing::warn!(attempt, error = %last_error, "planner call failed");
        }
        Err(AgentError::PlannerUnavailable { reason: last_error })
    }
}

fn build_context(tools: &[&ToolDescriptor]) -> String {
    if tools.is_empty() {
        return format!("{PLANNER_INSTRUCTIONS}\n\nTools:\n(no tools available)");
    }
    format!("{PLANNER_INSTRUCTIONS}\n\nTools:\n{}", render_catalogue(tools))
}

fn build_prompt(intent: &str, memory_hits: &[MemoryRecord], history: &str) -> String {
    let mut prompt = format!("Task: {intent}");

    if !memory_hits.is_empty() {
        prompt.push_str("\n\nRelevant results from earlier tasks:");
        for hit in memory_hits {
            prompt.push_str(&format!(
                "\n- {} => {}",
                hit.query_text,
                super::tokens::clip_for_prompt(&hit.result_summary, MEMORY_SNIPPET_CHARS)
            ));
        }
    }

    if history.is_empty() {
        prompt.push_str("\n\nNo steps taken yet.");
    } else {
        prompt.push_str("\n\nSteps so far:\n");
        prompt.push_str(history);
    }
    prompt
}

// ─── Guardrail ──────────────────────────────────────────────────────────────

/// Rejects final answers given before enough tool evidence exists.
#[derive(Debug, Clone, Copy)]
pub struct Guardrail {
    pub min_tool_evidence: u32,
}

impl Guardrail {
    /// Why `action` is rejected, or `None` when it may proceed.
    ///
    /// Applies only to tasks perceived as needing tools and only while any
    /// tool is available. Failed calls count as evidence: the planner saw
    /// the error and may decide to answer anyway.
    pub fn check(
        &self,
        action: &Action,
        perception: &Perception,
        tool_call_count: u32,
        tools_available: bool,
    ) -> Option<String> {
        match action {
            Action::FinalAnswer { .. }
                if perception.requires_tools
                    && tools_available
                    && tool_call_count < self.min_tool_evidence =>
            {
                Some(format!(
                    "final answer rejected: {tool_call_count} of {} required tool calls made; \
                     gather evidence with a tool first",
                    self.min_tool_evidence
                ))
            }
            _ => None,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
