//! Text budgeting for prompts.
//!
//! UTF-8 safe truncation of tool output before it is fed back to the
//! planner or stored in memory.

// ─── Constants ──────────────────────────────────────────────────────────────

/// Maximum length of a memory result summary.
const SUMMARY_MAX_BYTES: usize = 400;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
///
/// If the byte at `max_bytes` is inside a multi-byte character, the slice is
/// shortened to the preceding character boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Clip text for a prompt, marking how much was dropped.
pub fn clip_for_prompt(text: &str, max_bytes: usize) -> String {
    let kept = truncate_utf8(text, max_bytes);
    if kept.len() == text.len() {
        return text.to_string();
    }
    format!("{kept}...(truncated {} bytes)", text.len() - kept.len())
}

/// One-line summary of a tool payload for the memory store.
pub fn summarize_result(tool_name: &str, rendered: &str) -> String {
    let flat = rendered.split_whitespace().collect::<Vec<_>>().join(" ");
    let preview = truncate_utf8(&flat, SUMMARY_MAX_BYTES);
    if preview.len() < flat.len() {
        format!("{tool_name} returned: {preview}...")
    } else {
        format!("{tool_name} returned: {preview}")
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
