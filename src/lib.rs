pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use agent_core::{AgentDatabase, FastPathRouter, Orchestrator};
use agent_core::{PERCEPTION_INSTRUCTIONS, PLANNER_INSTRUCTIONS};
use config::AppConfig;
use inference::{InferenceClient, LlmBackend, ScriptedBackend};
use mcp_client::McpClient;

/// Log files kept besides the current one.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for TaskPilot.
///
/// - macOS: `~/Library/Application Support/taskpilot/`
/// - Windows: `{FOLDERID_RoamingAppData}\taskpilot\`
/// - Linux: `$XDG_DATA_HOME/taskpilot/` (fallback `~/.local/share/taskpilot/`)
///
/// Falls back to `~/.taskpilot/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("taskpilot");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskpilot")
}

// ─── Tracing ────────────────────────────────────────────────────────────────

/// Where and how logs are written.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Write `<dir>/taskpilot.log` instead of stderr.
    pub dir: Option<PathBuf>,
    /// One JSON object per line instead of human-readable text.
    pub json: bool,
}

/// Initialize the tracing subscriber.
///
/// With a log directory:
/// 1. Rotates existing logs (taskpilot.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh taskpilot.log with a line-flushing writer.
///
/// Filtering follows `RUST_LOG`, defaulting to `taskpilot=info,warn`.
pub fn init_tracing(options: &LogOptions) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskpilot=info,warn"));
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let writer = match &options.dir {
        Some(dir) => Some(open_log_file(dir)?),
        None => None,
    };

    let installed = match (writer, options.json) {
        (Some(w), true) => builder.json().with_writer(w).try_init(),
        (Some(w), false) => builder.with_ansi(false).with_writer(w).try_init(),
        (None, true) => builder.json().with_writer(std::io::stderr).try_init(),
        (None, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

fn open_log_file(dir: &Path) -> anyhow::Result<FlushingWriter> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let log_path = dir.join("taskpilot.log");
    rotate_log_file(&log_path, LOG_FILES_KEPT);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    Ok(FlushingWriter::new(file))
}

/// Log the startup banner.
pub fn log_startup_banner(data_dir: &Path, config_path: &Path) {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config = %config_path.display(),
        pid = std::process::id(),
        "=== TaskPilot starting ==="
    );
}

/// Rotate log files: `taskpilot.log` → `taskpilot.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Each log line is on disk as soon as it is written, so a killed process
/// leaves a complete log behind.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Assembly ───────────────────────────────────────────────────────────────

/// The language-model backend the config asks for.
///
/// A `scripted` section selects canned replies; otherwise the HTTP client
/// with the configured fallback chain is used.
pub fn build_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn LlmBackend>> {
    if let Some(script) = &config.scripted {
        tracing::info!(
            perception = script.perception.len(),
            planner = script.planner.len(),
            "using scripted language-model backend"
        );
        let backend = ScriptedBackend::new()
            .route(PERCEPTION_INSTRUCTIONS, script.perception.clone())
            .route(PLANNER_INSTRUCTIONS, script.planner.clone());
        return Ok(Arc::new(backend));
    }

    let timeout = Duration::from_secs(config.orchestrator.llm_timeout_secs);
    let client = InferenceClient::with_timeout(config.models.clone(), timeout)
        .context("failed to initialise language-model client")?;
    tracing::info!(model = %client.current_model_key(), "language-model client ready");
    Ok(Arc::new(client))
}

/// Build a ready orchestrator: tools discovered, backend and storage attached.
///
/// Discovery is best-effort and an unusable database only disables
/// persistence; both are logged.
pub async fn build_orchestrator(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let mut client = McpClient::new(config.servers_config());
    client.set_call_timeout(config.tools.call_timeout_ms);
    let tools = Arc::new(client);

    match tools.discover().await {
        Ok(found) => tracing::info!(tools = found.len(), "all tool servers discovered"),
        Err(e) => tracing::warn!(error = %e, "continuing with partial tool set"),
    }

    let backend = build_backend(config)?;
    let fast_paths =
        FastPathRouter::new(config.fast_paths.clone()).context("invalid fast_paths section")?;

    let mut orchestrator = Orchestrator::new(tools, backend, config.orchestrator.clone())
        .with_fast_paths(fast_paths);

    if config.persist {
        let dir = config.resolved_data_dir();
        let db_path = dir.join("taskpilot.db");
        let opened = std::fs::create_dir_all(&dir)
            .map_err(|e| e.to_string())
            .and_then(|_| AgentDatabase::open(&db_path).map_err(|e| e.to_string()));
        match opened {
            Ok(db) => {
                tracing::info!(db_path = %db_path.display(), "agent database initialized");
                orchestrator = orchestrator.with_database(Arc::new(db));
            }
            Err(e) => {
                tracing::warn!(db_path = %db_path.display(), error = %e, "persistence disabled")
            }
        }
    }

    Ok(orchestrator)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
