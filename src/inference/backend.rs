//! The narrow interface the agent core uses to reach a language model.
//!
//! Whether the model is a hosted endpoint, a local runtime or a scripted
//! stand-in is a configuration concern; the loop only sees `LlmBackend`.

use async_trait::async_trait;

use super::errors::InferenceError;

/// Text generation and embedding.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generate a completion for `prompt` under the instructions in `context`.
    async fn generate_text(&self, prompt: &str, context: &str) -> Result<String, InferenceError>;

    /// Embed `text` as a single vector.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, InferenceError>;
}

// ─── Vector Helpers ─────────────────────────────────────────────────────────

/// Mean-pool per-token embeddings into a single vector.
///
/// If already pooled (1D array of numbers), returns as-is.
/// If 2D (per-token), averages across the token dimension.
pub(crate) fn mean_pool_embedding(
    embedding: &serde_json::Value,
) -> Result<Vec<f32>, InferenceError> {
    let malformed = |reason: &str| InferenceError::MalformedResponse {
        reason: reason.to_string(),
    };

    match embedding {
        serde_json::Value::Array(arr) if arr.is_empty() => Ok(Vec::new()),

        serde_json::Value::Array(arr) if arr[0].is_number() => {
            Ok(arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
        }

        serde_json::Value::Array(arr) if arr[0].is_array() => {
            let tokens: Vec<Vec<f32>> = arr
                .iter()
                .filter_map(|row| {
                    row.as_array().map(|r| {
                        r.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
                    })
                })
                .collect();

            let dim = tokens.first().map(Vec::len).unwrap_or(0);
            if tokens.iter().any(|t| t.len() != dim) {
                return Err(malformed("per-token embeddings have mixed dimensions"));
            }

            let mut pooled = vec![0.0f32; dim];
            for token in &tokens {
                for (acc, v) in pooled.iter_mut().zip(token) {
                    *acc += v;
                }
            }
            let n = tokens.len() as f32;
            Ok(pooled.into_iter().map(|v| v / n).collect())
        }

        _ => Err(malformed("embedding is not a numeric array")),
    }
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn l2_normalize(vec: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vec;
    }
    vec.into_iter().map(|v| v / norm).collect()
}

/// Cosine similarity. Mismatched lengths or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
