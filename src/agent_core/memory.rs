//! Semantic memory of prior (query, result) pairs.
//!
//! Records are append-only for the life of the store. Retrieval ranks by
//! cosine similarity between the query embedding and each record's
//! embedding, newest first on ties. Embedding failures degrade to "no
//! memory" with a warning and never reach the task.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;

use super::database::AgentDatabase;
use super::types::MemoryRecord;
use crate::inference::{cosine_similarity, LlmBackend};

/// Default bound on one embedding call.
const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MemoryStore {
    backend: Arc<dyn LlmBackend>,
    records: RwLock<Vec<MemoryRecord>>,
    db: Option<Arc<AgentDatabase>>,
    embed_timeout: Duration,
}

impl MemoryStore {
    /// In-memory store.
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            backend,
            records: RwLock::new(Vec::new()),
            db: None,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
        }
    }

    /// Persist new records to `db` and load the ones already there.
    pub fn with_database(mut self, db: Arc<AgentDatabase>) -> Self {
        match db.load_memories() {
            Ok(existing) => {
                tracing::info!(records = existing.len(), "memory store hydrated");
                if let Ok(mut records) = self.records.write() {
                    records.extend(existing);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load stored memories"),
        }
        self.db = Some(db);
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` records most similar to `query`.
    ///
    /// Empty when the store is empty or the embedding backend fails.
    pub async fn retrieve(&self, query: &str, k: usize) -> Vec<MemoryRecord> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }

        let Some(query_embedding) = self.embed(query).await else {
            return Vec::new();
        };

        let Ok(records) = self.records.read() else {
            return Vec::new();
        };

        // (score, insertion index); a later index is newer.
        let mut scored: Vec<(f32, usize)> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (cosine_similarity(&query_embedding, &r.embedding), i))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| records[b.1].created_at.cmp(&records[a.1].created_at))
                .then_with(|| b.1.cmp(&a.1))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(_, i)| records[i].clone())
            .collect()
    }

    /// Append a record for `query`. Duplicates are kept.
    ///
    /// A no-op (with a warning) when the embedding backend fails.
    pub async fn record(&self, query: &str, result_summary: &str) {
        let Some(embedding) = self.embed(query).await else {
            return;
        };

        let record = MemoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            query_text: query.to_string(),
            embedding,
            result_summary: result_summary.to_string(),
            created_at: Utc::now(),
        };

        if let Some(db) = &self.db {
            if let Err(e) = db.insert_memory(&record) {
                tracing::warn!(error = %e, "failed to persist memory record");
            }
        }

        if let Ok(mut records) = self.records.write() {
            records.push(record);
        }
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        match tokio::time::timeout(self.embed_timeout, self.backend.embed_text(text)).await {
            Ok(Ok(v)) if !v.is_empty() => Some(v),
            Ok(Ok(_)) => {
                tracing::warn!("embedding backend returned an empty vector");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "embedding backend unavailable, memory skipped");
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.embed_timeout.as_secs(),
                    "embedding timed out, memory skipped"
                );
                None
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
