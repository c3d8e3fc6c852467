//! Parsers for language-model output.
//!
//! Planner output is parsed into the closed `Action` union. Two formats are
//! accepted:
//! - **JSON** (primary): `{"action":"tool_call","tool":"x","args":{...}}` or
//!   `{"action":"final_answer","answer":"..."}`, possibly wrapped in prose
//!   or markdown fences.
//! - **Bracket** (fallback): `[tool_call(tool="x", args={...})]` or
//!   `[final_answer(answer="...")]`, which some small models emit natively.
//!
//! Anything else is a parse error the planner reports back to the model.

use super::types::{Action, Perception};

// ─── Planner Actions ────────────────────────────────────────────────────────

/// Parse planner output into an `Action`.
pub fn parse_action(text: &str) -> Result<Action, String> {
    let json_err = match parse_json_action(text) {
        Ok(action) => return validate(action),
        Err(e) => e,
    };

    if let Some(action) = parse_bracket_action(text) {
        return validate(action);
    }

    Err(json_err)
}

fn parse_json_action(text: &str) -> Result<Action, String> {
    let json_str = extract_json(text).ok_or("no JSON object in output")?;
    serde_json::from_str::<Action>(json_str).map_err(|e| format!("invalid action JSON: {e}"))
}

fn validate(action: Action) -> Result<Action, String> {
    match &action {
        Action::ToolCall { tool, .. } if tool.trim().is_empty() => {
            Err("tool_call has an empty tool name".into())
        }
        Action::FinalAnswer { answer } if answer.trim().is_empty() => {
            Err("final_answer has an empty answer".into())
        }
        _ => Ok(action),
    }
}

/// Extract the first balanced `{...}` span from text that may carry prose or
/// fences. Braces inside JSON strings do not count.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().copied().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Bracket-Format Parser ──────────────────────────────────────────────────

/// Parse `[tool_call(tool="x", args={...})]` or `[final_answer(answer="...")]`.
pub fn parse_bracket_action(text: &str) -> Option<Action> {
    for line in text.lines() {
        let line = line.trim();

        if let Some(inner) = extract_bracket_call(line, "final_answer") {
            let answer = extract_named_string_arg(inner, "answer")?;
            return Some(Action::FinalAnswer { answer });
        }

        if let Some(inner) = extract_bracket_call(line, "tool_call") {
            let tool = extract_named_string_arg(inner, "tool")?;
            let args = match extract_named_object_arg(inner, "args") {
                Some(args) => args,
                None if inner.contains("args=") => return None,
                None => serde_json::Map::new(),
            };
            return Some(Action::ToolCall { tool, args });
        }
    }
    None
}

/// Extract the inner arguments from a bracket call like `[fn_name(args)]`.
fn extract_bracket_call<'a>(line: &'a str, fn_name: &str) -> Option<&'a str> {
    let pattern = format!("[{fn_name}(");
    let start = line.find(&pattern)?;
    let rest = &line[start + pattern.len()..];
    let close = rest.rfind(")]")?;
    Some(&rest[..close])
}

/// Extract a named string argument like `key="value"`, handling escaped quotes.
pub fn extract_named_string_arg(args: &str, key: &str) -> Option<String> {
    let pattern = format!("{key}=\"");
    let start = args.find(&pattern)?;
    let rest = &args[start + pattern.len()..];

    let bytes = rest.as_bytes();
    let mut end = 0;
    while end < bytes.len() {
        if bytes[end] == b'"' && (end == 0 || bytes[end - 1] != b'\\') {
            break;
        }
        end += 1;
    }
    if end >= bytes.len() {
        return None;
    }

    Some(rest[..end].replace("\\\"", "\""))
}

/// Extract a named JSON object argument like `args={"a": 1}`.
fn extract_named_object_arg(
    args: &str,
    key: &str,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let pattern = format!("{key}=");
    let start = args.find(&pattern)?;
    let rest = &args[start + pattern.len()..];
    let json = extract_json(rest)?;
    match serde_json::from_str::<serde_json::Value>(json).ok()? {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

// ─── Perception ─────────────────────────────────────────────────────────────

/// Parse perception output. `None` when there is no usable intent.
pub fn parse_perception(text: &str) -> Option<Perception> {
    let perception: Perception = serde_json::from_str(extract_json(text)?).ok()?;
    if perception.intent.trim().is_empty() {
        return None;
    }
    Some(perception)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
