//! Conversation log: the ordered, append-only record of a task.
//!
//! Responsibilities:
//! - Assign sequence numbers (1, 2, 3, ... per task)
//! - Mirror events to SQLite when persistence is on (failures are logged)
//! - Render the step history for planner prompts
//! - Export a finished task's log as newline-joined `type data` lines

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use super::database::AgentDatabase;
use super::errors::AgentError;
use super::tokens::clip_for_prompt;
use super::types::{ConversationEvent, EventType};

/// Events shown to the planner, newest last.
const HISTORY_WINDOW: usize = 24;

/// Finished logs kept in memory; older ones are served from the database.
pub const MAX_CACHED_LOGS: usize = 256;

// ─── ConversationLog ────────────────────────────────────────────────────────

/// One task's event log. Owned and written only by the task's orchestrator run.
pub struct ConversationLog {
    task_id: String,
    events: Vec<ConversationEvent>,
    db: Option<Arc<AgentDatabase>>,
}

impl ConversationLog {
    pub fn new(task_id: &str, db: Option<Arc<AgentDatabase>>) -> Self {
        Self {
            task_id: task_id.to_string(),
            events: Vec::new(),
            db,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Append an event with the next sequence number.
    pub fn append(&mut self, event_type: EventType, data: serde_json::Value) -> &ConversationEvent {
        let sequence_no = self.events.last().map(|e| e.sequence_no + 1).unwrap_or(1);
        let event = ConversationEvent {
            task_id: self.task_id.clone(),
            sequence_no,
            event_type,
            data,
            timestamp: Utc::now(),
        };

        if let Some(db) = &self.db {
            if let Err(e) = db.insert_event(&event) {
                tracing::warn!(task_id = %self.task_id, error = %e, "failed to persist conversation event");
            }
        }

        tracing::debug!(
            task_id = %self.task_id,
            seq = sequence_no,
            event = event_type.as_str(),
            "event recorded"
        );

        self.events.push(event);
        &self.events[self.events.len() - 1]
    }

    pub fn events(&self) -> &[ConversationEvent] {
        &self.events
    }

    /// Number of events of one type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Recent step history for the planner, with long data clipped.
    pub fn planner_history(&self, max_data_chars: usize) -> String {
        let steps: Vec<&ConversationEvent> = self
            .events
            .iter()
            .filter(|e| {
                !matches!(e.event_type, EventType::UserPrompt | EventType::Perception)
            })
            .collect();
        let start = steps.len().saturating_sub(HISTORY_WINDOW);

        steps[start..]
            .iter()
            .map(|e| {
                format!(
                    "{}: {}",
                    e.event_type.as_str(),
                    clip_for_prompt(&render_data(&e.data), max_data_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Newline-joined `type data` rendering in sequence order.
    pub fn export(&self) -> String {
        render_events(&self.events)
    }

    pub fn into_events(self) -> Vec<ConversationEvent> {
        self.events
    }
}

/// Render events as `type data` lines. String data is written raw,
/// everything else as compact JSON.
pub fn render_events(events: &[ConversationEvent]) -> String {
    events
        .iter()
        .map(|e| format!("{} {}", e.event_type.as_str(), render_data(&e.data)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_data(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── ConversationStore ──────────────────────────────────────────────────────

/// Finished logs, kept for export.
///
/// Holds at most `capacity` logs, evicting the oldest first. Evicted tasks
/// and tasks from earlier runs are read back from the database.
pub struct ConversationStore {
    logs: RwLock<CachedLogs>,
    capacity: usize,
    db: Option<Arc<AgentDatabase>>,
}

#[derive(Default)]
struct CachedLogs {
    by_task: HashMap<String, Arc<Vec<ConversationEvent>>>,
    order: VecDeque<String>,
}

impl ConversationStore {
    pub fn new(db: Option<Arc<AgentDatabase>>) -> Self {
        Self::with_capacity(db, MAX_CACHED_LOGS)
    }

    pub fn with_capacity(db: Option<Arc<AgentDatabase>>, capacity: usize) -> Self {
        Self {
            logs: RwLock::new(CachedLogs::default()),
            capacity: capacity.max(1),
            db,
        }
    }

    /// Store a finished task's events.
    pub fn insert(&self, task_id: &str, events: Vec<ConversationEvent>) {
        let Ok(mut logs) = self.logs.write() else {
            return;
        };
        if logs
            .by_task
            .insert(task_id.to_string(), Arc::new(events))
            .is_none()
        {
            logs.order.push_back(task_id.to_string());
        }
        while logs.order.len() > self.capacity {
            if let Some(oldest) = logs.order.pop_front() {
                logs.by_task.remove(&oldest);
                tracing::debug!(task_id = %oldest, "evicted conversation log from memory");
            }
        }
    }

    /// Events of a task, in sequence order.
    pub fn events(&self, task_id: &str) -> Result<Arc<Vec<ConversationEvent>>, AgentError> {
        if let Some(events) = self
            .logs
            .read()
            .ok()
            .and_then(|l| l.by_task.get(task_id).cloned())
        {
            return Ok(events);
        }

        if let Some(db) = &self.db {
            let events = db.get_events(task_id)?;
            if !events.is_empty() {
                return Ok(Arc::new(events));
            }
        }

        Err(AgentError::TaskNotFound {
            task_id: task_id.to_string(),
        })
    }

    /// Export a task's log.
    pub fn export_log(&self, task_id: &str) -> Result<String, AgentError> {
        Ok(render_events(&self.events(task_id)?))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_start_at_one_and_increase() {
        let mut log = ConversationLog::new("t1", None);
        assert_eq!(log.append(EventType::UserPrompt, "hi".into()).sequence_no, 1);
        assert_eq!(log.append(EventType::Plan, serde_json::json!({})).sequence_no, 2);
        assert_eq!(log.append(EventType::FinalAnswer, "bye".into()).sequence_no, 3);
        assert!(log
            .events()
            .windows(2)
            .all(|w| w[0].sequence_no < w[1].sequence_no));
        assert_eq!(log.count(EventType::Plan), 1);
    }

    #[test]
    fn test_export_format() {
        let mut log = ConversationLog::new("t1", None);
        log.append(EventType::UserPrompt, "Compare regions".into());
        log.append(
            EventType::ToolCall,
            serde_json::json!({"tool": "estimate", "args": {"region": "EU"}}),
        );
        assert_eq!(
            log.export(),
            "user_prompt Compare regions\ntool_call {\"args\":{\"region\":\"EU\"},\"tool\":\"estimate\"}"
        );
    }

    #[test]
    fn test_planner_history_skips_prompt_and_clips() {
        let mut log = ConversationLog::new("t1", None);
        log.append(EventType::UserPrompt, "question".into());
        log.append(EventType::Perception, serde_json::json!({"intent": "x"}));
        log.append(EventType::ToolResult, "x".repeat(100).into());

        let history = log.planner_history(10);
        assert!(!history.contains("question"));
        assert!(history.starts_with("tool_result: xxxxxxxxxx...(truncated 90 bytes)"));
    }

    #[test]
    fn test_events_mirror_to_database() {
        let db = Arc::new(AgentDatabase::open(":memory:").unwrap());
        db.create_task("t1", "p").unwrap();
        let mut log = ConversationLog::new("t1", Some(Arc::clone(&db)));
        log.append(EventType::UserPrompt, "p".into());
        log.append(EventType::FinalAnswer, "a".into());

        let store = ConversationStore::new(Some(db));
        assert_eq!(store.export_log("t1").unwrap(), "user_prompt p\nfinal_answer a");
    }

    #[test]
    fn test_persistence_failure_is_not_fatal() {
        let db = Arc::new(AgentDatabase::open(":memory:").unwrap());
        // No task row: the foreign key rejects the insert, the log still records.
        let mut log = ConversationLog::new("orphan", Some(db));
        log.append(EventType::UserPrompt, "p".into());
        assert_eq!(log.events().len(), 1);
    }

    #[test]
    fn test_store_lookup() {
        let store = ConversationStore::new(None);
        let mut log = ConversationLog::new("t1", None);
        log.append(EventType::UserPrompt, "p".into());
        store.insert("t1", log.into_events());

        assert_eq!(store.export_log("t1").unwrap(), "user_prompt p");
        assert!(matches!(
            store.export_log("nope"),
            Err(AgentError::TaskNotFound { .. })
        ));
    }

    fn finished_log(task_id: &str, db: Option<Arc<AgentDatabase>>) -> Vec<ConversationEvent> {
        let mut log = ConversationLog::new(task_id, db);
        log.append(EventType::UserPrompt, task_id.into());
        log.into_events()
    }

    #[test]
    fn test_store_evicts_oldest_beyond_capacity() {
        let store = ConversationStore::with_capacity(None, 2);
        for task_id in ["t1", "t2", "t3"] {
            store.insert(task_id, finished_log(task_id, None));
        }

        assert!(matches!(
            store.events("t1"),
            Err(AgentError::TaskNotFound { .. })
        ));
        assert_eq!(store.export_log("t2").unwrap(), "user_prompt t2");
        assert_eq!(store.export_log("t3").unwrap(), "user_prompt t3");

        // Re-inserting a cached task does not grow the cache.
        store.insert("t3", finished_log("t3", None));
        assert_eq!(store.export_log("t2").unwrap(), "user_prompt t2");
    }

    #[test]
    fn test_evicted_log_is_read_back_from_database() {
        let db = Arc::new(AgentDatabase::open(":memory:").unwrap());
        let store = ConversationStore::with_capacity(Some(Arc::clone(&db)), 1);
        for task_id in ["t1", "t2"] {
            db.create_task(task_id, task_id).unwrap();
            store.insert(task_id, finished_log(task_id, Some(Arc::clone(&db))));
        }

        assert_eq!(store.export_log("t1").unwrap(), "user_prompt t1");
        assert_eq!(store.events("t2").unwrap().len(), 1);
    }
}
