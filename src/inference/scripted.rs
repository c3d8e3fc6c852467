//! Deterministic backend that replays canned responses.
//!
//! Used for offline runs and tests. Responses are routed by the start of
//! the `context` argument, so perception and planning prompts can be given
//! separate scripts. Embeddings are a hashed bag of words: texts sharing
//! words land close together.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::backend::{l2_normalize, LlmBackend};
use super::errors::InferenceError;

/// Embedding dimensionality.
const EMBED_DIMS: usize = 64;

/// One recorded `generate_text` call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub context: String,
}

struct Route {
    context_prefix: String,
    queue: VecDeque<String>,
    /// Repeated once the queue is drained.
    last: Option<String>,
    failing: bool,
}

/// Scripted `LlmBackend`.
#[derive(Default)]
pub struct ScriptedBackend {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
    fail_embeddings: AtomicBool,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer contexts starting with `context_prefix` with `responses`, in order.
    /// The last response repeats once the list is used up.
    pub fn route<I, S>(self, context_prefix: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_route(context_prefix, responses.into_iter().map(Into::into).collect(), false)
    }

    /// Fail every request whose context starts with `context_prefix`.
    pub fn failing_route(self, context_prefix: &str) -> Self {
        self.push_route(context_prefix, VecDeque::new(), true)
    }

    /// Make `embed_text` fail, as an unreachable embedding backend would.
    pub fn with_failing_embeddings(self) -> Self {
        self.fail_embeddings.store(true, Ordering::SeqCst);
        self
    }

    /// Delay every `generate_text` answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push_route(self, context_prefix: &str, queue: VecDeque<String>, failing: bool) -> Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push(Route {
                context_prefix: context_prefix.to_string(),
                queue,
                last: None,
                failing,
            });
        }
        self
    }

    /// Every `generate_text` call seen so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls whose context started with `context_prefix`.
    pub fn calls_for(&self, context_prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.context.starts_with(context_prefix))
            .count()
    }

    fn next_response(&self, context: &str) -> Result<String, InferenceError> {
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| InferenceError::ScriptExhausted {
                route: "poisoned script".into(),
            })?;

        let Some(route) = routes
            .iter_mut()
            .find(|r| context.starts_with(&r.context_prefix))
        else {
            return Err(InferenceError::ScriptExhausted {
                route: "unrouted context".into(),
            });
        };

        if route.failing {
            return Err(InferenceError::ConnectionFailed {
                endpoint: "scripted".into(),
                reason: "route configured to fail".into(),
            });
        }

        match route.queue.pop_front() {
            Some(next) => {
                route.last = Some(next.clone());
                Ok(next)
            }
            None => route.last.clone().ok_or(InferenceError::ScriptExhausted {
                route: route.context_prefix.chars().take(40).collect(),
            }),
        }
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn generate_text(&self, prompt: &str, context: &str) -> Result<String, InferenceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                prompt: prompt.to_string(),
                context: context.to_string(),
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_response(context)
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(InferenceError::ConnectionFailed {
                endpoint: "scripted".into(),
                reason: "embeddings disabled".into(),
            });
        }
        Ok(hashed_embedding(text))
    }
}

/// Bag-of-words vector: each lowercase word increments one FNV-hashed bucket.
pub fn hashed_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBED_DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in word.to_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        v[(hash % EMBED_DIMS as u64) as usize] += 1.0;
    }
    l2_normalize(v)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::cosine_similarity;

    #[tokio::test]
    async fn routes_by_context_prefix_and_repeats_last() {
        let backend = ScriptedBackend::new()
            .route("PLAN", ["first", "second"])
            .route("PERCEIVE", ["p"]);

        assert_eq!(backend.generate_text("x", "PLAN: go").await.unwrap(), "first");
        assert_eq!(backend.generate_text("x", "PERCEIVE it").await.unwrap(), "p");
        assert_eq!(backend.generate_text("x", "PLAN: go").await.unwrap(), "second");
        assert_eq!(backend.generate_text("x", "PLAN: go").await.unwrap(), "second");
        assert_eq!(backend.calls_for("PLAN"), 3);
        assert_eq!(backend.calls().len(), 4);
    }

    #[tokio::test]
    async fn unrouted_and_failing_contexts_error() {
        let backend = ScriptedBackend::new().failing_route("DOWN");
        assert!(matches!(
            backend.generate_text("x", "other").await,
            Err(InferenceError::ScriptExhausted { .. })
        ));
        assert!(backend
            .generate_text("x", "DOWN now")
            .await
            .unwrap_err()
            .is_retriable());
    }

    #[tokio::test]
    async fn embeddings_are_deterministic_and_similar_for_shared_words() {
        let backend = ScriptedBackend::new();
        let a = backend.embed_text("carbon emissions in europe").await.unwrap();
        let b = backend.embed_text("carbon emissions in europe").await.unwrap();
        let c = backend.embed_text("emissions of carbon").await.unwrap();
        let d = backend.embed_text("weekly grocery list").await.unwrap();
        assert_eq!(a, b);
        assert!(cosine_similarity(&a, &c) > cosine_similarity(&a, &d));
    }

    #[tokio::test]
    async fn failing_embeddings() {
        let backend = ScriptedBackend::new().with_failing_embeddings();
        assert!(backend.embed_text("x").await.is_err());
    }
}
