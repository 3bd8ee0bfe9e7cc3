use crate::error::LlmError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// A single-shot, stateless completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
    /// Ask the backend for a JSON object reply.
    pub json_response: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.2,
            json_response: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;
}

#[async_trait]
impl<'a, T: LanguageModel + ?Sized> LanguageModel for &'a T {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        (**self).complete(request).await
    }
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for std::sync::Arc<T> {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        (**self).complete(request).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(5) as u32;
        self.base_delay * (1u32 << exponent)
    }

    pub fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    pub fn should_retry_error(error: &reqwest::Error) -> bool {
        error.is_timeout() || error.is_connect() || error.is_request()
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "gemini-2.0-flash-001".to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl LlmConfig {
    /// Reads `LLM_BASE_URL`, `LLM_API_KEY` and `LLM_MODEL`, keeping defaults
    /// for anything unset or blank.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base_url) = non_blank_env("LLM_BASE_URL") {
            config.base_url = base_url;
        }
        config.api_key = non_blank_env("LLM_API_KEY");
        if let Some(model) = non_blank_env("LLM_MODEL") {
            config.model = model;
        }
        config
    }
}

pub(crate) fn non_blank_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let value = value.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

/// Joins `path` onto `base`, treating `base` as a directory.
pub(crate) fn endpoint_url(base: &str, path: &str) -> Result<Url, LlmError> {
    let mut base = Url::parse(base)?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    Ok(base.join(path)?)
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    retry: RetryPolicy,
}

impl ChatCompletionsClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.model.trim().is_empty() {
            return Err(LlmError::Config("missing model name".to_string()));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint_url(&config.base_url, "chat/completions")?,
            api_key: config.api_key,
            model: config.model,
            retry: config.retry,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            response_format: request
                .json_response
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let mut call = self.client.post(self.endpoint.clone()).json(&body);
            if let Some(api_key) = &self.api_key {
                call = call.bearer_auth(api_key);
            }

            let failure = match call.send().await {
                Ok(response) if response.status().is_success() => {
                    let parsed: ChatResponse = response.json().await?;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.message.content)
                        .ok_or_else(|| LlmError::BackendResponse {
                            backend: self.endpoint.to_string(),
                            details: "reply had no message content".to_string(),
                        })?;
                    debug!(attempt, chars = content.len(), "completion received");
                    return Ok(content);
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
            warn!(attempt, ?delay, reason = %failure, "completion failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
