use crate::error::LlmError;
use crate::llm::{endpoint_url, non_blank_env, RetryPolicy};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifies the embedding space; persisted with the index so vectors
    /// from different models are never compared.
    fn model_id(&self) -> String;

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut vectors = self.embed_documents(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| LlmError::BackendResponse {
            backend: self.model_id(),
            details: "no embedding returned for query".to_string(),
        })
    }
}

#[async_trait]
impl<T: Embedder + ?Sized> Embedder for Box<T> {
    fn model_id(&self) -> String {
        (**self).model_id()
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        (**self).embed_documents(texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        (**self).embed_query(text).await
    }
}

/// Offline, deterministic embedder hashing character trigrams into buckets.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> String {
        format!("char-trigram-{}", self.dimensions.max(1))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub batch_size: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl EmbeddingConfig {
    /// Returns `None` unless `EMBEDDING_BASE_URL` is set, in which case the
    /// offline embedder stays in charge.
    pub fn from_env() -> Option<Self> {
        let base_url = non_blank_env("EMBEDDING_BASE_URL")?;
        Some(Self {
            base_url,
            api_key: non_blank_env("EMBEDDING_API_KEY"),
            model: non_blank_env("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-004".to_string()),
            batch_size: 64,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        })
    }
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    batch_size: usize,
    retry: RetryPolicy,
}

impl OpenAiEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self, LlmError> {
        if config.model.trim().is_empty() {
            return Err(LlmError::Config("missing embedding model name".to_string()));
        }
        Ok(Self {
            client: Client::builder().timeout(config.timeout).build()?,
            endpoint: endpoint_url(&config.base_url, "embeddings")?,
            api_key: config.api_key,
            model: config.model,
            batch_size: config.batch_size.max(1),
            retry: config.retry,
        })
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
        };

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let mut call = self.client.post(self.endpoint.clone()).json(&request);
            if let Some(api_key) = &self.api_key {
                call = call.bearer_auth(api_key);
            }

            let failure = match call.send().await {
                Ok(response) if response.status().is_success() => {
                    let mut parsed: EmbeddingResponse = response.json().await?;
                    parsed.data.sort_by_key(|entry| entry.index);
                    if parsed.data.len() != inputs.len() {
                        return Err(LlmError::BackendResponse {
                            backend: self.endpoint.to_string(),
                            details: format!(
                                "{} embeddings returned for {} inputs",
                                parsed.data.len(),
                                inputs.len()
                            ),
                        });
                    }
                    return Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect());
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if !RetryPolicy::should_retry_status(status) {
                        return Err(LlmError::BackendResponse {
                            backend: self.endpoint.to_string(),
                            details: format!("{status}: {body}"),
                        });
                    }
                    format!("{status}: {body}")
                }
                Err(error) => {
                    if !RetryPolicy::should_retry_error(&error) {
                        return Err(error.into());
                    }
                    error.to_string()
                }
            };

            if attempt >= self.retry.max_attempts {
                return Err(LlmError::RetriesExhausted {
                    endpoint: self.endpoint.to_string(),
                    attempts: attempt,
                    details: failure,
                });
            }

            let delay = self.retry.backoff(attempt);
            warn!(attempt, ?delay, reason = %failure, "embedding request failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Cosine similarity; zero when either vector has no magnitude or the
/// lengths differ.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}
