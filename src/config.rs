//! Application configuration: one YAML file for models, tool servers,
//! orchestrator tunables and fast-path rules.
//!
//! `${VAR}` and `${VAR:-default}` are interpolated before parsing, and a
//! leading `~` in paths expands to the home directory.
//!
//! Lookup order:
//! 1. `--config <path>`
//! 2. `TASKPILOT_CONFIG`
//! 3. `taskpilot.yaml` in the working directory or any parent

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::agent_core::{FastPathRule, OrchestratorConfig};
use crate::inference::config::{expand_tilde, interpolate_env_vars};
use crate::inference::ModelsConfig;
use crate::mcp_client::client::DEFAULT_CALL_TIMEOUT_MS;
use crate::mcp_client::{McpServersConfig, ServerConfig};

pub const CONFIG_FILE_NAME: &str = "taskpilot.yaml";
pub const CONFIG_ENV_VAR: &str = "TASKPILOT_CONFIG";

// ─── Sections ───────────────────────────────────────────────────────────────

/// The `tools` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    /// Per-call timeout in milliseconds (default: 30000).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

/// The optional `scripted` section: canned replies instead of a live model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptedResponses {
    #[serde(default)]
    pub perception: Vec<String>,
    #[serde(default)]
    pub planner: Vec<String>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// `active_model`, `models` and `fallback_chain` sit at the top level.
    #[serde(flatten)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// When non-empty, only these servers are started.
    #[serde(default)]
    pub enabled_servers: Vec<String>,
    /// Ordered; the first matching rule wins.
    #[serde(default)]
    pub fast_paths: Vec<FastPathRule>,
    /// Where the database lives. Defaults to the platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Persist tasks, events and memory to SQLite (default: true).
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// Write logs to `<log_dir>/taskpilot.log` instead of stderr.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub scripted: Option<ScriptedResponses>,
}

fn default_persist() -> bool {
    true
}

// ─── Loading ────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse config text.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let interpolated = interpolate_env_vars(raw);
        let mut config: AppConfig =
            serde_yaml::from_str(&interpolated).context("failed to parse YAML")?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        let expand = |p: &PathBuf| PathBuf::from(expand_tilde(&p.to_string_lossy()));
        self.data_dir = self.data_dir.as_ref().map(expand);
        self.log_dir = self.log_dir.as_ref().map(expand);
        for server in self.servers.values_mut() {
            if let ServerConfig::Stdio { cwd: Some(cwd), .. } = server {
                *cwd = expand_tilde(cwd);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.scripted.is_none() && self.models.models.is_empty() {
            anyhow::bail!("no models configured and no scripted responses given");
        }
        if self.orchestrator.max_steps == 0 {
            anyhow::bail!("orchestrator.max_steps must be at least 1");
        }
        if self.orchestrator.delta_buffer == 0 {
            anyhow::bail!("orchestrator.delta_buffer must be at least 1");
        }
        Ok(())
    }

    /// Names in `enabled_servers` with no matching server entry.
    pub fn unknown_enabled_servers(&self) -> Vec<&str> {
        self.enabled_servers
            .iter()
            .filter(|name| !self.servers.contains_key(*name))
            .map(String::as_str)
            .collect()
    }

    /// Server configs after applying the `enabled_servers` allowlist.
    ///
    /// Called after logging is up, so unknown allowlist entries are reported here.
    pub fn servers_config(&self) -> McpServersConfig {
        for name in self.unknown_enabled_servers() {
            tracing::warn!(server = name, "enabled_servers names an unknown server");
        }

        let mut servers = self.servers.clone();
        if !self.enabled_servers.is_empty() {
            let allowlist: HashSet<&str> = self.enabled_servers.iter().map(String::as_str).collect();
            let before = servers.len();
            servers.retain(|name, _| allowlist.contains(name.as_str()));
            tracing::info!(
                before,
                after = servers.len(),
                "filtered servers by enabled_servers allowlist"
            );
        }
        McpServersConfig { servers }
    }

    /// Configured data directory, or the platform default.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(crate::data_dir)
    }
}

/// Locate the config file. `None` when no candidate exists.
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(expand_tilde(&path)));
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
