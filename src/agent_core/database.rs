//! SQLite persistence for tasks, conversation events and memory records.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex; every statement is
//! short. WAL mode is enabled so exports can read while tasks append.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::errors::AgentError;
use super::types::{ConversationEvent, EventType, MemoryRecord, TaskStatus};

// ─── Rows ───────────────────────────────────────────────────────────────────

/// A persisted task summary.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub task_id: String,
    pub prompt: String,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub step_count: u32,
    pub tool_call_count: u32,
}

// ─── Database ───────────────────────────────────────────────────────────────

/// SQLite database handle for the agent core.
pub struct AgentDatabase {
    conn: Mutex<Connection>,
}

impl AgentDatabase {
    /// Open (or create) the agent database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AgentError> {
        self.conn.lock().map_err(|_| AgentError::DatabaseError {
            reason: "connection mutex poisoned".into(),
        })
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), AgentError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                result TEXT,
                error TEXT,
                step_count INTEGER NOT NULL DEFAULT 0,
                tool_call_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS conversation_events (
                task_id TEXT NOT NULL,
                sequence_no INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (task_id, sequence_no),
                FOREIGN KEY (task_id) REFERENCES tasks(id)
            );

            CREATE TABLE IF NOT EXISTS memory_records (
                id TEXT PRIMARY KEY,
                query_text TEXT NOT NULL,
                embedding TEXT NOT NULL,
                result_summary TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ─── Tasks ──────────────────────────────────────────────────────────

    /// Record a newly started task.
    pub fn create_task(&self, task_id: &str, prompt: &str) -> Result<(), AgentError> {
        self.conn()?.execute(
            "INSERT INTO tasks (id, prompt) VALUES (?1, ?2)",
            params![task_id, prompt],
        )?;
        Ok(())
    }

    /// Record a task's terminal status and counters.
    pub fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
        step_count: u32,
        tool_call_count: u32,
    ) -> Result<(), AgentError> {
        self.conn()?.execute(
            "UPDATE tasks
             SET status = ?2, result = ?3, error = ?4, step_count = ?5,
                 tool_call_count = ?6, finished_at = datetime('now')
             WHERE id = ?1",
            params![
                task_id,
                status.as_str(),
                result,
                error,
                step_count,
                tool_call_count
            ],
        )?;
        Ok(())
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRow>, AgentError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, prompt, status, result, error, step_count, tool_call_count
                 FROM tasks WHERE id = ?1",
                params![task_id],
                |row| {
                    Ok(TaskRow {
                        task_id: row.get(0)?,
                        prompt: row.get(1)?,
                        status: row.get(2)?,
                        result: row.get(3)?,
                        error: row.get(4)?,
                        step_count: row.get(5)?,
                        tool_call_count: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ─── Conversation Events ────────────────────────────────────────────

    /// Mirror one conversation event.
    pub fn insert_event(&self, event: &ConversationEvent) -> Result<(), AgentError> {
        let data = serde_json::to_string(&event.data)?;
        self.conn()?.execute(
            "INSERT INTO conversation_events (task_id, sequence_no, event_type, data, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.task_id,
                event.sequence_no as i64,
                event.event_type.as_str(),
                data,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All events of a task in sequence order.
    pub fn get_events(&self, task_id: &str) -> Result<Vec<ConversationEvent>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, sequence_no, event_type, data, timestamp
             FROM conversation_events WHERE task_id = ?1 ORDER BY sequence_no ASC",
        )?;
        let events = stmt
            .query_map(params![task_id], |row| {
                Ok(ConversationEvent {
                    task_id: row.get(0)?,
                    sequence_no: row.get::<_, i64>(1)? as u64,
                    event_type: EventType::parse(&row.get::<_, String>(2)?),
                    data: parse_json_value(row.get::<_, String>(3)?),
                    timestamp: parse_timestamp(&row.get::<_, String>(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ─── Memory ─────────────────────────────────────────────────────────

    /// Append one memory record.
    pub fn insert_memory(&self, record: &MemoryRecord) -> Result<(), AgentError> {
        let embedding = serde_json::to_string(&record.embedding)?;
        self.conn()?.execute(
            "INSERT OR IGNORE INTO memory_records (id, query_text, embedding, result_summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.query_text,
                embedding,
                record.result_summary,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Every stored memory record, oldest first.
    pub fn load_memories(&self) -> Result<Vec<MemoryRecord>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, query_text, embedding, result_summary, created_at
             FROM memory_records ORDER BY created_at ASC, rowid ASC",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(MemoryRecord {
                    id: row.get(0)?,
                    query_text: row.get(1)?,
                    embedding: serde_json::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or_default(),
                    result_summary: row.get(3)?,
                    created_at: parse_timestamp(&row.get::<_, String>(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_json_value(json: String) -> serde_json::Value {
    serde_json::from_str(&json).unwrap_or(serde_json::Value::String(json))
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> AgentDatabase {
        AgentDatabase::open(":memory:").unwrap()
    }

    fn event(task_id: &str, seq: u64, event_type: EventType, data: serde_json::Value) -> ConversationEvent {
        ConversationEvent {
            task_id: task_id.into(),
            sequence_no: seq,
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_task_lifecycle() {
        let db = test_db();
        db.create_task("t1", "compare regions").unwrap();
        let row = db.get_task("t1").unwrap().unwrap();
        assert_eq!(row.status, "running");

        db.finish_task("t1", TaskStatus::Succeeded, Some("done"), None, 3, 2)
            .unwrap();
        let row = db.get_task("t1").unwrap().unwrap();
        assert_eq!(row.status, "succeeded");
        assert_eq!(row.result.as_deref(), Some("done"));
        assert_eq!((row.step_count, row.tool_call_count), (3, 2));

        assert!(db.get_task("missing").unwrap().is_none());
    }

    #[test]
    fn test_events_round_trip_in_order() {
        let db = test_db();
        db.create_task("t1", "p").unwrap();
        db.insert_event(&event("t1", 2, EventType::Plan, serde_json::json!({"step": 1})))
            .unwrap();
        db.insert_event(&event("t1", 1, EventType::UserPrompt, serde_json::json!("p")))
            .unwrap();

        let events = db.get_events("t1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::UserPrompt);
        assert_eq!(events[0].data, serde_json::json!("p"));
        assert_eq!(events[1].data["step"], 1);
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let db = test_db();
        db.create_task("t1", "p").unwrap();
        let e = event("t1", 1, EventType::UserPrompt, serde_json::json!("p"));
        db.insert_event(&e).unwrap();
        assert!(db.insert_event(&e).is_err());
    }

    #[test]
    fn test_event_for_unknown_task_rejected() {
        let db = test_db();
        let e = event("ghost", 1, EventType::UserPrompt, serde_json::json!("p"));
        assert!(matches!(db.insert_event(&e), Err(AgentError::DatabaseError { .. })));
    }

    #[test]
    fn test_memory_records_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        {
            let db = AgentDatabase::open(&path).unwrap();
            db.insert_memory(&MemoryRecord {
                id: "m1".into(),
                query_text: "carbon".into(),
                embedding: vec![0.6, 0.8],
                result_summary: "estimate returned 12".into(),
                created_at: Utc::now(),
            })
            .unwrap();
        }
        let db = AgentDatabase::open(&path).unwrap();
        let records = db.load_memories().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].embedding, vec![0.6, 0.8]);
        assert_eq!(records[0].result_summary, "estimate returned 12");
    }
}
