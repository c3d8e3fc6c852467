//! Tool registry: aggregates tool descriptors across all tool servers.
//!
//! The name → descriptor table is an immutable `ToolSnapshot`. A refresh
//! builds a complete new snapshot and swaps it in; readers holding the old
//! `Arc` keep a consistent view until they drop it, so in-flight calls are
//! never blocked or disturbed by re-discovery.
//!
//! Provides:
//! - Tool lookup by name, or by `server.tool` qualified name
//! - Suggestions for unknown names via edit distance
//! - Validation that a call carries the schema's required arguments
//! - Prompt renderings (capability summary, tool catalogue)

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use super::errors::McpError;
use super::types::{McpToolDefinition, ToolCall, ToolDescriptor, TransportKind};

/// Suggestions below this similarity are not worth showing.
const SUGGESTION_FLOOR: f64 = 0.3;

/// Maximum suggestions attached to an unknown-tool error.
const MAX_SUGGESTIONS: usize = 3;

// ─── ToolSnapshot ────────────────────────────────────────────────────────────

/// One consistent, immutable view of every discovered tool.
#[derive(Debug, Clone, Default)]
pub struct ToolSnapshot {
    /// `tool_name → descriptor`.
    tools: HashMap<String, ToolDescriptor>,
}

/// Tools reported by one server, as input to `ToolSnapshot::build`.
pub struct ServerTools {
    pub server_id: String,
    pub transport_kind: TransportKind,
    pub tools: Vec<McpToolDefinition>,
}

impl ToolSnapshot {
    /// Build a snapshot from per-server tool lists.
    ///
    /// Servers are processed in id order; when two servers report the same
    /// tool name the first keeps it and the duplicate is dropped with a warning.
    pub fn build(mut servers: Vec<ServerTools>) -> Self {
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        let mut tools: HashMap<String, ToolDescriptor> = HashMap::new();
        for server in servers {
            for def in server.tools {
                if let Some(existing) = tools.get(&def.name) {
                    tracing::warn!(
                        tool = %def.name,
                        kept = %existing.server_id,
                        dropped = %server.server_id,
                        "duplicate tool name across servers"
                    );
                    continue;
                }
                let desc =
                    ToolDescriptor::from_definition(&server.server_id, server.transport_kind, def);
                tools.insert(desc.name.clone(), desc);
            }
        }

        Self { tools }
    }

    /// Build a snapshot directly from descriptors (first occurrence of a name wins).
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        let mut tools = HashMap::new();
        for desc in descriptors {
            tools.entry(desc.name.clone()).or_insert(desc);
        }
        Self { tools }
    }

    /// Look up a tool by its exact name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<&ToolDescriptor> = self.tools.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Distinct server ids, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.tools
            .values()
            .map(|d| d.server_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of tools owned by a server.
    pub fn tools_for_server(&self, server_id: &str) -> usize {
        self.tools.values().filter(|d| d.server_id == server_id).count()
    }

    /// Descriptors whose name or server id matches one of `hints`.
    ///
    /// Matching is case-insensitive; a hint also matches as a substring of
    /// the tool name. Empty when nothing matches.
    pub fn matching_hints(&self, hints: &[String]) -> Vec<&ToolDescriptor> {
        if hints.is_empty() {
            return Vec::new();
        }
        let lowered: Vec<String> = hints.iter().map(|h| h.trim().to_lowercase()).collect();
        self.descriptors()
            .into_iter()
            .filter(|d| {
                let name = d.name.to_lowercase();
                let server = d.server_id.to_lowercase();
                lowered
                    .iter()
                    .filter(|h| !h.is_empty())
                    .any(|h| name == *h || server == *h || name.contains(h.as_str()))
            })
            .collect()
    }

    /// Validate a call: the tool resolves and required arguments are present.
    ///
    /// Full JSON Schema validation is left to the server.
    pub fn validate_call(&self, call: &ToolCall) -> Result<&ToolDescriptor, McpError> {
        let desc = match self.resolve(&call.tool_name) {
            ToolResolution::NotFound { .. } => {
                return Err(McpError::UnknownTool {
                    name: call.tool_name.clone(),
                })
            }
            resolved => resolved
                .resolved_name()
                .and_then(|name| self.get(name))
                .ok_or(McpError::UnknownTool {
                    name: call.tool_name.clone(),
                })?,
        };

        for field in desc.required_args() {
            if !call.args.contains_key(field) {
                return Err(McpError::InvalidArguments {
                    tool: desc.name.clone(),
                    reason: format!("missing required field: '{field}'"),
                });
            }
        }

        Ok(desc)
    }

    /// Concise capability summary for prompts.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools currently available.".to_string();
        }

        let server_names = self.server_names();
        let server_parts: Vec<String> = server_names
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_server(name)))
            .collect();

        format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            server_names.len(),
            server_parts.join(", "),
        )
    }
}

/// Render descriptors as a prompt catalogue, one tool per block.
pub fn render_catalogue(descriptors: &[&ToolDescriptor]) -> String {
    descriptors
        .iter()
        .map(|d| {
            let desc = if d.description.is_empty() {
                String::new()
            } else {
                format!(": {}", d.description)
            };
            format!("- {}{desc}\n  input schema: {}", d.name, d.input_schema)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Tool Resolution ────────────────────────────────────────────────────────

/// How a tool name was resolved against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResolution {
    /// Name found as-is.
    Exact(String),

    /// Name was `server.tool` and that server owns `tool`.
    Qualified { resolved: String },

    /// No match. `suggestions` holds up to 3 similar tool names.
    NotFound { suggestions: Vec<String> },
}

impl ToolResolution {
    /// The resolved tool name, if resolution succeeded.
    pub fn resolved_name(&self) -> Option<&str> {
        match self {
            Self::Exact(name) => Some(name),
            Self::Qualified { resolved, .. } => Some(resolved),
            Self::NotFound { .. } => None,
        }
    }
}

impl ToolSnapshot {
    /// Resolve a tool name that may be server-qualified or simply wrong.
    ///
    /// Strategy (first match wins):
    /// 1. **Exact:** name exists as-is.
    /// 2. **Qualified:** `server.tool` where `server` owns `tool`.
    /// 3. **NotFound:** with edit-distance suggestions.
    ///
    /// Misspelled names are never silently corrected.
    pub fn resolve(&self, name: &str) -> ToolResolution {
        if self.tools.contains_key(name) {
            return ToolResolution::Exact(name.to_string());
        }

        if let Some((server, tool)) = name.split_once('.') {
            if let Some(desc) = self.tools.get(tool) {
                if desc.server_id == server {
                    return ToolResolution::Qualified {
                        resolved: tool.to_string(),
                    };
                }
            }
        }

        ToolResolution::NotFound {
            suggestions: self.find_similar(name, MAX_SUGGESTIONS),
        }
    }

    /// Find up to `max_results` tool names most similar to `name`.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name.rsplit('.').next().unwrap_or(name);

        let mut scored: Vec<(String, f64)> = self
            .tools
            .keys()
            .map(|tool| (tool.clone(), similarity(query, tool)))
            .filter(|(_, score)| *score > SUGGESTION_FLOOR)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let n = b_bytes.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, &ca) in a_bytes.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=n {
            let cost = usize::from(ca != b_bytes[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Holder of the current snapshot. Cheap to read, swapped whole on refresh.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    current: RwLock<Arc<ToolSnapshot>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. Stays valid even if a refresh swaps in a new one.
    pub fn snapshot(&self) -> Arc<ToolSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Atomically replace the whole table.
    pub fn replace(&self, snapshot: ToolSnapshot) {
        let next = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, required: &[&str]) -> McpToolDefinition {
        McpToolDefinition {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: serde_json::json!({"type": "object", "required": required}),
            output_schema: None,
        }
    }

    fn sample_snapshot() -> ToolSnapshot {
        ToolSnapshot::build(vec![
            ServerTools {
                server_id: "carbon".into(),
                transport_kind: TransportKind::Stdio,
                tools: vec![
                    def("estimate_emissions", &["region"]),
                    def("list_regions", &[]),
                ],
            },
            ServerTools {
                server_id: "search".into(),
                transport_kind: TransportKind::Stream,
                tools: vec![def("web_search", &["query"])],
            },
        ])
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(name, args.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn build_and_lookup() {
        let snap = sample_snapshot();
        assert_eq!(snap.len(), 3);
        let desc = snap.get("web_search").unwrap();
        assert_eq!(desc.server_id, "search");
        assert_eq!(desc.transport_kind, TransportKind::Stream);
        assert_eq!(snap.server_names(), vec!["carbon", "search"]);
        assert_eq!(snap.tools_for_server("carbon"), 2);
    }

    #[test]
    fn duplicate_names_keep_first_server_in_id_order() {
        let snap = ToolSnapshot::build(vec![
            ServerTools {
                server_id: "zeta".into(),
                transport_kind: TransportKind::Stdio,
                tools: vec![def("lookup", &[])],
            },
            ServerTools {
                server_id: "alpha".into(),
                transport_kind: TransportKind::Stream,
                tools: vec![def("lookup", &[])],
            },
        ]);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("lookup").unwrap().server_id, "alpha");
    }

    #[test]
    fn resolve_exact_and_qualified() {
        let snap = sample_snapshot();
        assert_eq!(
            snap.resolve("web_search"),
            ToolResolution::Exact("web_search".into())
        );
        let r = snap.resolve("carbon.estimate_emissions");
        assert_eq!(r.resolved_name(), Some("estimate_emissions"));
        // Wrong server prefix does not resolve.
        assert_eq!(snap.resolve("search.estimate_emissions").resolved_name(), None);
    }

    #[test]
    fn resolve_not_found_has_suggestions() {
        let snap = sample_snapshot();
        match snap.resolve("estimate_emission") {
            ToolResolution::NotFound { suggestions, .. } => {
                assert_eq!(suggestions.first().map(String::as_str), Some("estimate_emissions"));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn resolve_not_found_without_close_matches() {
        let snap = sample_snapshot();
        match snap.resolve("zzzzzzzzzzzzzzzzzz") {
            ToolResolution::NotFound { suggestions, .. } => assert!(suggestions.is_empty()),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn validate_call_checks_required_fields() {
        let snap = sample_snapshot();
        assert!(snap
            .validate_call(&call("estimate_emissions", serde_json::json!({"region": "EU"})))
            .is_ok());

        let err = snap
            .validate_call(&call("estimate_emissions", serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));
        assert!(err.to_string().contains("region"));

        let err = snap.validate_call(&call("nope", serde_json::json!({}))).unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));
    }

    #[test]
    fn hints_narrow_by_name_or_server() {
        let snap = sample_snapshot();
        let by_server: Vec<_> = snap
            .matching_hints(&["carbon".into()])
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(by_server, vec!["estimate_emissions", "list_regions"]);

        let by_name = snap.matching_hints(&["Search".into()]);
        assert_eq!(by_name.len(), 1);

        assert!(snap.matching_hints(&["calendar".into()]).is_empty());
        assert!(snap.matching_hints(&[]).is_empty());
    }

    #[test]
    fn capability_summary_lists_servers() {
        assert_eq!(
            ToolSnapshot::default().capability_summary(),
            "No tools currently available."
        );
        let summary = sample_snapshot().capability_summary();
        assert!(summary.contains("3 tools across 2 servers"));
        assert!(summary.contains("carbon (2)"));
    }

    #[test]
    fn catalogue_includes_schema() {
        let snap = sample_snapshot();
        let text = render_catalogue(&snap.descriptors());
        assert!(text.contains("- web_search: web_search tool"));
        assert!(text.contains("\"required\":[\"query\"]"));
    }

    #[test]
    fn registry_swap_keeps_old_readers_consistent() {
        let registry = ToolRegistry::new();
        registry.replace(sample_snapshot());
        let before = registry.snapshot();

        registry.replace(ToolSnapshot::default());
        assert_eq!(before.len(), 3, "held snapshot is unaffected by refresh");
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert!((similarity("", "") - 1.0).abs() < f64::EPSILON);
    }
}
