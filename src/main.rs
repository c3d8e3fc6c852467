//! `taskpilot` command line: run one task and print its result.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use taskpilot::agent_core::{TaskDelta, TaskOptions};
use taskpilot::config::{self, AppConfig, CONFIG_ENV_VAR, CONFIG_FILE_NAME};
use taskpilot::LogOptions;

#[derive(Debug, Parser)]
#[command(name = "taskpilot", version, about = "Run a tool-calling agent task")]
struct Cli {
    /// Config file (default: $TASKPILOT_CONFIG, then taskpilot.yaml upward from cwd).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured step budget.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Intent hint used for fast-path matching.
    #[arg(long)]
    intent: Option<String>,

    /// Print the task's conversation log after the result.
    #[arg(long)]
    export_log: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// The request to carry out.
    #[arg(required = true, num_args = 1..)]
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let config_path = config::find_config_path(cli.config.as_deref(), &cwd).with_context(|| {
        format!("no {CONFIG_FILE_NAME} found; pass --config or set {CONFIG_ENV_VAR}")
    })?;
    let config = AppConfig::load(&config_path)?;

    taskpilot::init_tracing(&LogOptions {
        dir: config.log_dir.clone(),
        json: cli.json_logs,
    })?;
    taskpilot::log_startup_banner(&config.resolved_data_dir(), &config_path);

    let orchestrator = taskpilot::build_orchestrator(&config).await?;

    let (tx, mut rx) = mpsc::channel::<TaskDelta>(config.orchestrator.delta_buffer);
    let printer = tokio::spawn(async move {
        while let Some(delta) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&delta) {
                eprintln!("{line}");
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling after the current step");
            on_interrupt.cancel();
        }
    });

    let prompt = cli.prompt.join(" ");
    let result = orchestrator
        .submit_task(
            &prompt,
            TaskOptions {
                max_steps: cli.max_steps,
                intent_hint: cli.intent,
                deltas: Some(tx),
                cancel: Some(cancel),
            },
        )
        .await;
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if cli.export_log {
        println!("{}", orchestrator.export_log(&result.task_id)?);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
