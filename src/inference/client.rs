//! OpenAI-compatible inference client.
//!
//! Sends chat completion and embedding requests to the configured endpoint.
//! Handles the fallback chain when the active model is unavailable: a
//! retriable failure moves the client to the next model in the chain, and
//! the switch is sticky for later requests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::backend::{l2_normalize, mean_pool_embedding, LlmBackend};
use super::config::{resolve_active_model, ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, EmbeddingRequest,
    EmbeddingResponse,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default total request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible endpoint with a model fallback chain.
///
/// Does NOT check connectivity at construction; that happens on the first
/// request.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelsConfig,
    /// Key of the model currently tried first.
    current_model_key: Mutex<String>,
    request_timeout: Duration,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        Self::with_timeout(config, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with an explicit per-request timeout.
    pub fn with_timeout(config: ModelsConfig, timeout: Duration) -> Result<Self, InferenceError> {
        let (key, model) = resolve_active_model(&config)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: model.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            current_model_key: Mutex::new(key),
            request_timeout: timeout,
        })
    }

    /// Key of the model requests currently go to first.
    pub fn current_model_key(&self) -> String {
        match self.current_model_key.lock() {
            Ok(key) => key.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Check if the current model endpoint is reachable.
    pub async fn health_check(&self) -> bool {
        let Some(model) = self.config.models.get(&self.current_model_key()) else {
            return false;
        };
        let url = format!("{}/models", model.base_url);
        match self.http.get(&url).timeout(CONNECT_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    // ─── Fallback Chain ──────────────────────────────────────────────────

    /// Models to try, in order: the current model, then the rest of the chain.
    fn candidates(&self) -> Vec<(String, ModelConfig)> {
        let current = self.current_model_key();
        let mut keys = vec![current.clone()];
        for key in &self.config.fallback_chain {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys.into_iter()
            .filter_map(|k| self.config.models.get(&k).map(|m| (k, m.clone())))
            .collect()
    }

    fn switch_to(&self, key: &str) {
        let mut current = match self.current_model_key.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *current != key {
            tracing::warn!(from = %*current, to = key, "switched to fallback model");
            *current = key.to_string();
        }
    }

    /// Run `attempt` against each candidate until one succeeds or a
    /// non-retriable error occurs.
    async fn with_fallback<T, F, Fut>(&self, attempt: F) -> Result<T, InferenceError>
    where
        F: Fn(String, ModelConfig) -> Fut,
        Fut: std::future::Future<Output = Result<T, InferenceError>>,
    {
        let mut attempted = Vec::new();
        for (key, model) in self.candidates() {
            match attempt(key.clone(), model).await {
                Ok(value) => {
                    self.switch_to(&key);
                    return Ok(value);
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable");
                    attempted.push(key);
                }
                Err(e) => return Err(e),
            }
        }
        Err(InferenceError::AllModelsUnavailable { attempted })
    }

    // ─── Requests ────────────────────────────────────────────────────────

    async fn try_chat(
        &self,
        key: &str,
        model: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url);
        let body = ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages,
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            stream: false,
            response_format: None,
        };

        tracing::debug!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            "LLM request"
        );

        let response = self.post(&url, model, &body).await?;
        let parsed: ChatCompletionResponse =
            response
                .json()
                .await
                .map_err(|e| InferenceError::MalformedResponse {
                    reason: format!("failed to parse completion: {e}"),
                })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(InferenceError::MalformedResponse {
                reason: "completion has no choices".into(),
            })
    }

    async fn try_embed(
        &self,
        key: &str,
        model: &ModelConfig,
        text: &str,
    ) -> Result<Vec<f32>, InferenceError> {
        let url = format!("{}/embeddings", model.base_url);
        let body = EmbeddingRequest {
            model: model
                .embedding_model
                .clone()
                .or_else(|| model.model_name.clone())
                .unwrap_or_else(|| key.to_string()),
            input: vec![text.to_string()],
        };

        let response = self.post(&url, model, &body).await?;
        let parsed: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| InferenceError::MalformedResponse {
                    reason: format!("failed to parse embedding response: {e}"),
                })?;

        let item = parsed
            .data
            .into_iter()
            .min_by_key(|item| item.index)
            .ok_or(InferenceError::MalformedResponse {
                reason: "empty embedding response".into(),
            })?;

        Ok(l2_normalize(mean_pool_embedding(&item.embedding)?))
    }

    async fn post<B: serde::Serialize>(
        &self,
        url: &str,
        model: &ModelConfig,
        body: &B,
    ) -> Result<reqwest::Response, InferenceError> {
        let mut request = self.http.post(url).json(body);
        if let Some(key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.request_timeout.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmBackend for InferenceClient {
    async fn generate_text(&self, prompt: &str, context: &str) -> Result<String, InferenceError> {
        self.with_fallback(|key, model| async move {
            let messages = vec![ChatMessage::system(context), ChatMessage::user(prompt)];
            self.try_chat(&key, &model, messages).await
        })
        .await
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        self.with_fallback(|key, model| async move { self.try_embed(&key, &model, text).await })
            .await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
