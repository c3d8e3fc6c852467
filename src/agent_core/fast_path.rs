//! Fast-path router: deterministic workflows for recognised requests.
//!
//! Before perception and planning, the orchestrator checks the request
//! against an ordered table of rules loaded from configuration. The first
//! rule that matches yields a `WorkflowPlan`, a fixed sequence of tool calls
//! where fields of step *i*'s payload feed the arguments of step *i+1*. A
//! matched task makes no language-model calls unless a step fails.
//!
//! A rule matches when the caller's intent hint equals the rule's `intent`,
//! or when at least `min_groups` of its keyword groups appear in the
//! lowercased input. Each group is a set of synonyms; any one of them counts.

use serde::{Deserialize, Serialize};

use super::errors::AgentError;
use crate::mcp_client::ToolCall;

// ─── Rule Table ─────────────────────────────────────────────────────────────

/// One entry of the `fast_paths` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathRule {
    pub name: String,
    /// Synonym groups matched against the lowercased input.
    #[serde(default)]
    pub keywords: Vec<Vec<String>>,
    /// Groups that must match. Defaults to all of them.
    #[serde(default)]
    pub min_groups: Option<usize>,
    /// Intent hint that selects this rule outright.
    #[serde(default)]
    pub intent: Option<String>,
    pub steps: Vec<FastPathStep>,
    /// Final answer text; `{result}` is the last payload, `{input}` the request.
    #[serde(default)]
    pub answer_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathStep {
    pub tool: String,
    /// Fixed arguments. String values may contain `{input}`.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    /// Values copied from the previous step's payload.
    #[serde(default)]
    pub bind: Vec<ArgBinding>,
}

/// Copy `from` (a JSON pointer into the previous payload) into argument `to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgBinding {
    pub from: String,
    pub to: String,
}

impl FastPathRule {
    fn required_groups(&self) -> usize {
        self.min_groups.unwrap_or(self.keywords.len())
    }

    fn matches(&self, lower_input: &str, intent_hint: Option<&str>) -> bool {
        if let (Some(intent), Some(hint)) = (&self.intent, intent_hint) {
            if intent.trim().eq_ignore_ascii_case(hint.trim()) {
                return true;
            }
        }

        if self.keywords.is_empty() {
            return false;
        }
        keyword_score(lower_input, &self.keywords) >= self.required_groups()
    }

    fn validate(&self) -> Result<(), AgentError> {
        let invalid = |reason: String| AgentError::ConfigError {
            reason: format!("fast path '{}': {reason}", self.name),
        };

        if self.name.trim().is_empty() {
            return Err(AgentError::ConfigError {
                reason: "fast path rule without a name".into(),
            });
        }
        if self.steps.is_empty() {
            return Err(invalid("no steps".into()));
        }
        if self.keywords.is_empty() && self.intent.is_none() {
            return Err(invalid("needs keywords or an intent".into()));
        }
        if self.keywords.iter().any(|g| g.is_empty()) {
            return Err(invalid("empty keyword group".into()));
        }
        let required = self.required_groups();
        if !self.keywords.is_empty() && (required == 0 || required > self.keywords.len()) {
            return Err(invalid(format!(
                "min_groups must be between 1 and {}",
                self.keywords.len()
            )));
        }
        if let Some(binding) = self.steps.first().and_then(|s| s.bind.first()) {
            return Err(invalid(format!(
                "first step cannot bind '{}', there is no previous step",
                binding.to
            )));
        }
        for step in &self.steps {
            if let Some(b) = step.bind.iter().find(|b| !b.from.is_empty() && !b.from.starts_with('/')) {
                return Err(invalid(format!("binding source '{}' is not a JSON pointer", b.from)));
            }
        }
        Ok(())
    }
}

/// Count the keyword groups with at least one term present.
fn keyword_score(lower_input: &str, groups: &[Vec<String>]) -> usize {
    groups
        .iter()
        .filter(|group| {
            group
                .iter()
                .any(|kw| lower_input.contains(&kw.to_lowercase()))
        })
        .count()
}

// ─── Workflow Plans ─────────────────────────────────────────────────────────

/// A matched rule, bound to the request it matched.
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    pub rule: String,
    input: String,
    steps: Vec<FastPathStep>,
    answer_template: Option<String>,
}

impl WorkflowPlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Build the call for step `index`, given the previous step's payload.
    ///
    /// Bindings whose pointer does not resolve are skipped; the tool's own
    /// argument validation reports anything that ends up missing.
    pub fn call_for(&self, index: usize, previous: Option<&serde_json::Value>) -> Option<ToolCall> {
        let step = self.steps.get(index)?;

        let mut args: serde_json::Map<String, serde_json::Value> = step
            .args
            .iter()
            .map(|(k, v)| (k.clone(), substitute_input(v, &self.input)))
            .collect();

        if let Some(payload) = previous {
            for binding in &step.bind {
                match payload.pointer(&binding.from) {
                    Some(value) => {
                        args.insert(binding.to.clone(), value.clone());
                    }
                    None => tracing::debug!(
                        rule = %self.rule,
                        from = %binding.from,
                        "binding source missing from previous payload"
                    ),
                }
            }
        }

        Some(ToolCall::new(&step.tool, args))
    }

    /// Final answer for a completed workflow.
    pub fn render_answer(&self, last_payload: Option<&serde_json::Value>) -> String {
        let result = last_payload.map(render_payload).unwrap_or_default();
        match &self.answer_template {
            Some(template) => template
                .replace("{result}", &result)
                .replace("{input}", &self.input),
            None => result,
        }
    }
}

fn substitute_input(value: &serde_json::Value, input: &str) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if s.contains("{input}") => {
            serde_json::Value::String(s.replace("{input}", input))
        }
        other => other.clone(),
    }
}

fn render_payload(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

/// Ordered rule table. First match wins.
#[derive(Debug, Clone, Default)]
pub struct FastPathRouter {
    rules: Vec<FastPathRule>,
}

impl FastPathRouter {
    /// Build a router, rejecting malformed rules.
    pub fn new(rules: Vec<FastPathRule>) -> Result<Self, AgentError> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The workflow for the first rule matching `input` or `intent_hint`.
    pub fn match_workflow(&self, input: &str, intent_hint: Option<&str>) -> Option<WorkflowPlan> {
        let lower = input.to_lowercase();
        let rule = self.rules.iter().find(|r| r.matches(&lower, intent_hint))?;

        tracing::info!(rule = %rule.name, steps = rule.steps.len(), "fast path matched");
        Some(WorkflowPlan {
            rule: rule.name.clone(),
            input: input.to_string(),
            steps: rule.steps.clone(),
            answer_template: rule.answer_template.clone(),
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
