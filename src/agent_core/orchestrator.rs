//! Orchestrator: the perceive → plan → act → observe loop.
//!
//! Each task runs as a state machine:
//!
//! ```text
//! FastPathCheck ─┬─ matched, completed ──────────────────────────────→ Terminated(Ok)
//!                └─ no match / aborted → Perceiving → Retrieving → Planning
//!                                           ↑                          │
//!                                           └── Recording ← Dispatching ┘
//! ```
//!
//! - Perception runs once per task; later iterations reuse it.
//! - Every planning iteration consumes one step, including ones the
//!   guardrail rejects. Planning with the budget spent fails the task with
//!   "maximum steps".
//! - Tool failures come back as error results and are fed to the next
//!   planning step. The loop never re-invokes a tool on its own.
//! - Cancellation is observed at the top of each iteration and between
//!   fast-path steps. A call already dispatched finishes and is recorded.
//!
//! Tasks share the tool client (registry snapshot, stream connections) and
//! the memory store; everything else belongs to the task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::conversation::{ConversationLog, ConversationStore};
use super::database::AgentDatabase;
use super::errors::AgentError;
use super::fast_path::{FastPathRouter, WorkflowPlan};
use super::memory::MemoryStore;
use super::perception::Perceiver;
use super::planner::{select_tools, Guardrail, Planner};
use super::tokens::{clip_for_prompt, summarize_result};
use super::types::{
    Action, ConversationEvent, EventType, MemoryRecord, OrchestratorConfig, Perception, TaskDelta,
    TaskError, TaskErrorKind, TaskMetadata, TaskOptions, TaskResult, TaskStatus,
};
use crate::inference::LlmBackend;
use crate::mcp_client::{McpClient, ToolCall, ToolResult, ToolSession};

/// Final answers stored in memory are clipped to this many bytes.
const ANSWER_SUMMARY_BYTES: usize = 400;

// ─── State Machine ──────────────────────────────────────────────────────────

enum Phase {
    FastPathCheck,
    Perceiving,
    Retrieving,
    Planning,
    Dispatching(ToolCall),
    Recording(ToolResult),
    Terminated(Result<String, TaskError>),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::FastPathCheck => "fast_path_check",
            Phase::Perceiving => "perceiving",
            Phase::Retrieving => "retrieving",
            Phase::Planning => "planning",
            Phase::Dispatching(_) => "dispatching",
            Phase::Recording(_) => "recording",
            Phase::Terminated(_) => "terminated",
        }
    }
}

enum FastPathOutcome {
    Completed(String),
    Aborted,
    Cancelled,
}

/// Mutable state of one running task. Owned by its `submit_task` call.
struct TaskRun {
    prompt: String,
    log: ConversationLog,
    session: ToolSession,
    step_count: u32,
    tool_call_count: u32,
    max_steps: u32,
    fast_path: Option<String>,
    perception: Option<Perception>,
    memory_hits: Vec<MemoryRecord>,
    deltas: Option<mpsc::Sender<TaskDelta>>,
    cancel: Option<CancellationToken>,
}

impl TaskRun {
    fn task_id(&self) -> &str {
        self.log.task_id()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// The perceived intent, or the raw prompt before perception.
    fn intent(&self) -> &str {
        self.perception
            .as_ref()
            .map(|p| p.intent.as_str())
            .unwrap_or(self.prompt.as_str())
    }

    /// Deliver a delta. Waits for room in the channel; a dropped receiver is ignored.
    async fn emit(&self, delta: TaskDelta) {
        if let Some(tx) = &self.deltas {
            let _ = tx.send(delta).await;
        }
    }
}

fn cancelled() -> TaskError {
    TaskError {
        kind: TaskErrorKind::Cancelled,
        message: "task cancelled".into(),
    }
}

fn planner_failure(err: AgentError) -> TaskError {
    let kind = match err {
        AgentError::ParseError { .. } => TaskErrorKind::ParseError,
        _ => TaskErrorKind::PlannerUnavailable,
    };
    TaskError {
        kind,
        message: err.to_string(),
    }
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

pub struct Orchestrator {
    tools: Arc<McpClient>,
    backend: Arc<dyn LlmBackend>,
    memory: MemoryStore,
    perceiver: Perceiver,
    planner: Planner,
    guardrail: Guardrail,
    fast_paths: FastPathRouter,
    conversations: ConversationStore,
    db: Option<Arc<AgentDatabase>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        tools: Arc<McpClient>,
        backend: Arc<dyn LlmBackend>,
        config: OrchestratorConfig,
    ) -> Self {
        let llm_timeout = Duration::from_secs(config.llm_timeout_secs);
        Self {
            memory: Self::memory_store(&backend, &config, None),
            perceiver: Perceiver::new(Arc::clone(&backend), llm_timeout),
            planner: Planner::new(Arc::clone(&backend), llm_timeout),
            guardrail: Guardrail {
                min_tool_evidence: config.min_tool_evidence,
            },
            fast_paths: FastPathRouter::default(),
            conversations: ConversationStore::new(None),
            db: None,
            tools,
            backend,
            config,
        }
    }

    /// Use an ordered fast-path rule table.
    pub fn with_fast_paths(mut self, router: FastPathRouter) -> Self {
        self.fast_paths = router;
        self
    }

    /// Persist tasks, events and memory to `db`, loading stored memory.
    pub fn with_database(mut self, db: Arc<AgentDatabase>) -> Self {
        self.memory = Self::memory_store(&self.backend, &self.config, Some(Arc::clone(&db)));
        self.conversations = ConversationStore::new(Some(Arc::clone(&db)));
        self.db = Some(db);
        self
    }

    fn memory_store(
        backend: &Arc<dyn LlmBackend>,
        config: &OrchestratorConfig,
        db: Option<Arc<AgentDatabase>>,
    ) -> MemoryStore {
        let store = MemoryStore::new(Arc::clone(backend))
            .with_embed_timeout(Duration::from_secs(config.embed_timeout_secs));
        match db {
            Some(db) => store.with_database(db),
            None => store,
        }
    }

    pub fn tools(&self) -> &Arc<McpClient> {
        &self.tools
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Export a finished task's log as newline-joined `type data` lines.
    pub fn export_log(&self, task_id: &str) -> Result<String, AgentError> {
        self.conversations.export_log(task_id)
    }

    /// Events of a finished task, in sequence order.
    pub fn events(&self, task_id: &str) -> Result<Arc<Vec<ConversationEvent>>, AgentError> {
        self.conversations.events(task_id)
    }

    // ─── Task Entry Point ───────────────────────────────────────────────

    /// Run one task to completion. Never fails: every outcome is a `TaskResult`.
    pub async fn submit_task(&self, prompt: &str, options: TaskOptions) -> TaskResult {
        let task_id = uuid::Uuid::new_v4().to_string();
        let max_steps = options.max_steps.unwrap_or(self.config.max_steps);

        if let Some(db) = &self.db {
            if let Err(e) = db.create_task(&task_id, prompt) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to persist task");
            }
        }
        tracing::info!(task_id = %task_id, max_steps, "task started");

        let mut run = TaskRun {
            prompt: prompt.to_string(),
            log: ConversationLog::new(&task_id, self.db.clone()),
            session: self.tools.session(),
            step_count: 0,
            tool_call_count: 0,
            max_steps,
            fast_path: None,
            perception: None,
            memory_hits: Vec::new(),
            deltas: options.deltas,
            cancel: options.cancel,
        };

        run.emit(TaskDelta::Started {
            task_id: task_id.clone(),
        })
        .await;
        run.log.append(EventType::UserPrompt, prompt.into());

        let outcome = self.drive(&mut run, options.intent_hint.as_deref()).await;
        run.session.close().await;

        let (result, error) = match outcome {
            Ok(answer) => (Some(answer), None),
            Err(err) => {
                run.log.append(
                    EventType::Error,
                    serde_json::json!({"kind": err.kind, "message": err.message}),
                );
                (None, Some(err))
            }
        };
        let success = error.is_none();
        let status = if success {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };

        if let Some(db) = &self.db {
            if let Err(e) = db.finish_task(
                &task_id,
                status,
                result.as_deref(),
                error.as_ref().map(|e| e.message.as_str()),
                run.step_count,
                run.tool_call_count,
            ) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to persist task status");
            }
        }

        tracing::info!(
            task_id = %task_id,
            status = status.as_str(),
            steps = run.step_count,
            tool_calls = run.tool_call_count,
            fast_path = run.fast_path.as_deref().unwrap_or("-"),
            "task finished"
        );
        run.emit(TaskDelta::Finished { success }).await;

        let metadata = TaskMetadata {
            step_count: run.step_count,
            tool_call_count: run.tool_call_count,
            fast_path: run.fast_path.take(),
        };
        self.conversations.insert(&task_id, run.log.into_events());

        TaskResult {
            task_id,
            success,
            result,
            error,
            metadata,
        }
    }

    async fn drive(&self, run: &mut TaskRun, intent_hint: Option<&str>) -> Result<String, TaskError> {
        let mut phase = Phase::FastPathCheck;
        loop {
            tracing::debug!(
                task_id = %run.task_id(),
                phase = phase.name(),
                step = run.step_count,
                "phase transition"
            );

            phase = match phase {
                Phase::FastPathCheck => {
                    match self.fast_paths.match_workflow(&run.prompt, intent_hint) {
                        Some(plan) => match self.run_fast_path(run, &plan).await {
                            FastPathOutcome::Completed(answer) => Phase::Terminated(Ok(answer)),
                            FastPathOutcome::Aborted => Phase::Perceiving,
                            FastPathOutcome::Cancelled => Phase::Terminated(Err(cancelled())),
                        },
                        None => Phase::Perceiving,
                    }
                }

                Phase::Perceiving => {
                    if run.is_cancelled() {
                        tracing::info!(task_id = %run.task_id(), "task cancelled");
                        Phase::Terminated(Err(cancelled()))
                    } else {
                        if run.perception.is_none() {
                            let summary = self.tools.snapshot().capability_summary();
                            let perception = self.perceiver.perceive(&run.prompt, &summary).await;
                            run.log.append(
                                EventType::Perception,
                                serde_json::to_value(&perception).unwrap_or_default(),
                            );
                            run.perception = Some(perception);
                        }
                        Phase::Retrieving
                    }
                }

                Phase::Retrieving => {
                    let hits = self
                        .memory
                        .retrieve(run.intent(), self.config.memory_top_k)
                        .await;
                    run.memory_hits = hits;
                    Phase::Planning
                }

                Phase::Planning => self.plan_step(run).await,

                Phase::Dispatching(call) => Phase::Recording(self.dispatch(run, &call, None).await),

                Phase::Recording(result) => {
                    let query = run.intent().to_string();
                    self.record(run, &result, &query).await;
                    Phase::Perceiving
                }

                Phase::Terminated(outcome) => return outcome,
            };
        }
    }

    // ─── Planning ───────────────────────────────────────────────────────

    async fn plan_step(&self, run: &mut TaskRun) -> Phase {
        if run.step_count >= run.max_steps {
            tracing::warn!(
                task_id = %run.task_id(),
                max_steps = run.max_steps,
                "step budget exhausted"
            );
            return Phase::Terminated(Err(TaskError {
                kind: TaskErrorKind::MaxSteps,
                message: format!(
                    "maximum steps ({}) reached without a final answer",
                    run.max_steps
                ),
            }));
        }
        run.step_count += 1;
        let step = run.step_count;

        let perception = run.perception.clone().unwrap_or_else(|| Perception {
            intent: run.prompt.clone(),
            tool_hints: Vec::new(),
            requires_tools: false,
        });
        let snapshot = self.tools.snapshot();
        let tools = select_tools(&snapshot, &perception.tool_hints);
        let history = run.log.planner_history(self.config.max_tool_result_chars);

        let action = match self
            .planner
            .plan(&perception.intent, &tools, &run.memory_hits, &history)
            .await
        {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!(task_id = %run.task_id(), step, error = %e, "planning failed");
                return Phase::Terminated(Err(planner_failure(e)));
            }
        };

        if let Some(reason) =
            self.guardrail
                .check(&action, &perception, run.tool_call_count, !snapshot.is_empty())
        {
            tracing::warn!(task_id = %run.task_id(), step, reason = %reason, "guardrail rejected action");
            run.log.append(
                EventType::Plan,
                serde_json::json!({"step": step, "action": action, "rejected": reason}),
            );
            run.emit(TaskDelta::GuardrailRejected { step }).await;
            return Phase::Perceiving;
        }

        let label = match &action {
            Action::ToolCall { tool, .. } => tool.as_str(),
            Action::FinalAnswer { .. } => "final_answer",
        };
        tracing::info!(task_id = %run.task_id(), step, action = label, "step planned");
        run.log.append(
            EventType::Plan,
            serde_json::json!({"step": step, "action": action}),
        );
        run.emit(TaskDelta::Planned {
            step,
            action: action.clone(),
        })
        .await;

        match action {
            Action::ToolCall { tool, args } => Phase::Dispatching(ToolCall::new(&tool, args)),
            Action::FinalAnswer { answer } => {
                run.log.append(EventType::FinalAnswer, answer.as_str().into());
                self.memory
                    .record(&perception.intent, &clip_for_prompt(&answer, ANSWER_SUMMARY_BYTES))
                    .await;
                Phase::Terminated(Ok(answer))
            }
        }
    }

    // ─── Tool Steps ─────────────────────────────────────────────────────

    /// Log, announce and run one call. Always yields a result.
    async fn dispatch(
        &self,
        run: &mut TaskRun,
        call: &ToolCall,
        fast_path: Option<&str>,
    ) -> ToolResult {
        let mut data = serde_json::json!({
            "tool": call.tool_name,
            "args": call.args,
            "request_id": call.request_id,
        });
        if let Some(rule) = fast_path {
            data["fast_path"] = rule.into();
        }
        run.log.append(EventType::ToolCall, data);
        run.emit(TaskDelta::ToolStarted {
            tool: call.tool_name.clone(),
            request_id: call.request_id.clone(),
        })
        .await;
        run.tool_call_count += 1;

        run.session.invoke(call).await
    }

    /// Log a result and remember successful payloads under `memory_query`.
    async fn record(&self, run: &mut TaskRun, result: &ToolResult, memory_query: &str) {
        let mut data = serde_json::json!({
            "tool": result.tool_name,
            "request_id": result.request_id,
            "status": result.status,
            "execution_time_ms": result.execution_time_ms,
        });
        match (&result.payload, &result.error_detail) {
            (Some(payload), _) => data["payload"] = payload.clone(),
            (None, Some(detail)) => data["error"] = detail.as_str().into(),
            (None, None) => {}
        }
        run.log.append(EventType::ToolResult, data);
        run.emit(TaskDelta::ToolFinished {
            tool: result.tool_name.clone(),
            ok: result.is_ok(),
            execution_time_ms: result.execution_time_ms,
        })
        .await;

        if result.is_ok() {
            self.memory
                .record(memory_query, &summarize_result(&result.tool_name, &result.render()))
                .await;
        }
    }

    // ─── Fast Path ──────────────────────────────────────────────────────

    async fn run_fast_path(&self, run: &mut TaskRun, plan: &WorkflowPlan) -> FastPathOutcome {
        run.emit(TaskDelta::FastPath {
            rule: plan.rule.clone(),
        })
        .await;
        let query = run.prompt.clone();

        let mut previous: Option<serde_json::Value> = None;
        for index in 0..plan.len() {
            if run.is_cancelled() {
                tracing::info!(task_id = %run.task_id(), rule = %plan.rule, "fast path cancelled");
                return FastPathOutcome::Cancelled;
            }
            let Some(call) = plan.call_for(index, previous.as_ref()) else {
                break;
            };

            let result = self.dispatch(run, &call, Some(&plan.rule)).await;
            self.record(run, &result, &query).await;

            if !result.is_ok() {
                tracing::warn!(
                    task_id = %run.task_id(),
                    rule = %plan.rule,
                    step = index + 1,
                    tool = %result.tool_name,
                    "fast path step failed, falling back to planner"
                );
                return FastPathOutcome::Aborted;
            }
            previous = result.payload;
        }

        let answer = plan.render_answer(previous.as_ref());
        run.log.append(EventType::FinalAnswer, answer.as_str().into());
        self.memory
            .record(&query, &clip_for_prompt(&answer, ANSWER_SUMMARY_BYTES))
            .await;
        run.fast_path = Some(plan.rule.clone());
        FastPathOutcome::Completed(answer)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
