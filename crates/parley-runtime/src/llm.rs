//! OpenAI-compatible chat providers.
//!
//! Talks to any server exposing `/v1/chat/completions` (and `/v1/embeddings`
//! for text embeddings). Three access patterns:
//!
//! - [`ChatProvider::complete`] – blocking completion, whole reply at once.
//! - [`ChatProvider::complete_with_schema`] – completion constrained to a
//!   JSON Schema via `response_format`, for structured payloads like
//!   movement plans.
//! - [`ChatProvider::stream`] – token streaming over SSE, so speech can
//!   start before the reply is finished.
//!
//! [`FallbackProvider`] wraps a primary and a secondary provider: on any
//! primary failure the request is retried on the secondary exactly once.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use parley_types::ChatMessage;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM provider operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("unexpected response format: {0}")]
    BadResponse(String),
    /// Primary and fallback providers both failed.
    #[error("both providers failed: primary: {primary}; fallback: {fallback}")]
    BothFailed { primary: String, fallback: String },
}

/// A stream of reply tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Whole-request deadline for provider calls, streaming included. Generous
/// enough for a long streamed reply; a hung server still cannot stall a
/// turn forever.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn client_with_timeout(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        // Builder failure means a broken TLS backend; fall back to the
        // default client without a deadline.
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// ChatProvider
// ─────────────────────────────────────────────────────────────────────────────

/// An async chat completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send `messages` and return the assistant's whole reply.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;

    /// Like [`complete`](Self::complete), with the reply constrained to the
    /// given JSON Schema. Providers without structured-output support may
    /// ignore the schema.
    async fn complete_with_schema(
        &self,
        messages: &[ChatMessage],
        _schema: serde_json::Value,
    ) -> Result<String, LlmError> {
        self.complete(messages).await
    }

    /// Send `messages` and stream the reply token by token.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LlmError>;
}

/// An async text embedding backend.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// `response_format` field that enforces structured JSON Schema output.
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the content delta from one SSE line of a streamed completion.
///
/// Returns `Ok(None)` for blank lines, non-data lines, the `[DONE]`
/// terminator, and deltas with no content (role announcements, finish
/// chunks). Malformed JSON is an error.
fn extract_sse_delta(line: &str) -> Result<Option<String>, LlmError> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| LlmError::BadResponse(format!("bad SSE chunk: {e}")))?;
    Ok(value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAiCompatProvider
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once and reuse across turns.
pub struct OpenAiCompatProvider {
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider pointing at `base_url` (e.g.
    /// `"http://localhost:11434"`) using `model`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: client_with_timeout(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Attach a bearer token for hosted endpoints.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Override the per-call request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = client_with_timeout(timeout);
        self
    }

    /// The per-call request deadline in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(url);
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn complete_inner(
        &self,
        messages: &[ChatMessage],
        response_format: Option<ResponseFormat>,
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            response_format,
        };
        let response: ChatResponse = self
            .request(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.complete_inner(messages, None).await
    }

    async fn complete_with_schema(
        &self,
        messages: &[ChatMessage],
        schema: serde_json::Value,
    ) -> Result<String, LlmError> {
        self.complete_inner(
            messages,
            Some(ResponseFormat {
                kind: "json_schema",
                json_schema: schema,
            }),
        )
        .await
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            response_format: None,
        };
        let response = self
            .request(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let mut bytes = response.bytes_stream();

        let stream = try_stream! {
            let mut buf = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buf.push_str(&String::from_utf8_lossy(&chunk));
                // SSE events are newline-delimited; a chunk may split a line.
                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    if let Some(delta) = extract_sse_delta(line.trim())? {
                        yield delta;
                    }
                }
            }
            if let Some(delta) = extract_sse_delta(buf.trim())? {
                yield delta;
            }
        };
        Ok(Box::pin(stream))
    }
}

/// An async client for an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct OpenAiCompatEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: client_with_timeout(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Override the per-call request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = client_with_timeout(timeout);
        self
    }

    /// The per-call request deadline in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl TextEmbedder for OpenAiCompatEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let mut req = self.client.post(&url).json(&serde_json::json!({
            "model": self.model,
            "input": text,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response: EmbeddingResponse =
            req.send().await?.error_for_status()?.json().await?;
        response
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| LlmError::BadResponse("empty embeddings array".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FallbackProvider
// ─────────────────────────────────────────────────────────────────────────────

/// Primary provider with exactly one fallback.
///
/// Any error from the primary retries the whole request on the fallback
/// once; an error from the fallback surfaces as
/// [`LlmError::BothFailed`]. Errors that occur mid-stream after the fallback
/// stream has opened are not retried.
pub struct FallbackProvider {
    primary: Arc<dyn ChatProvider>,
    fallback: Arc<dyn ChatProvider>,
}

impl FallbackProvider {
    pub fn new(primary: Arc<dyn ChatProvider>, fallback: Arc<dyn ChatProvider>) -> Self {
        Self { primary, fallback }
    }

    fn both_failed(primary: LlmError, fallback: LlmError) -> LlmError {
        LlmError::BothFailed {
            primary: primary.to_string(),
            fallback: fallback.to_string(),
        }
    }
}

#[async_trait]
impl ChatProvider for FallbackProvider {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        match self.primary.complete(messages).await {
            Ok(reply) => Ok(reply),
            Err(primary_err) => {
                warn!(error = %primary_err, "primary provider failed, trying fallback");
                self.fallback
                    .complete(messages)
                    .await
                    .map_err(|e| Self::both_failed(primary_err, e))
            }
        }
    }

    async fn complete_with_schema(
        &self,
        messages: &[ChatMessage],
        schema: serde_json::Value,
    ) -> Result<String, LlmError> {
        match self
            .primary
            .complete_with_schema(messages, schema.clone())
            .await
        {
            Ok(reply) => Ok(reply),
            Err(primary_err) => {
                warn!(error = %primary_err, "primary provider failed, trying fallback");
                self.fallback
                    .complete_with_schema(messages, schema)
                    .await
                    .map_err(|e| Self::both_failed(primary_err, e))
            }
        }
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, LlmError> {
        match self.primary.stream(messages).await {
            Ok(stream) => Ok(stream),
            Err(primary_err) => {
                warn!(error = %primary_err, "primary provider failed, trying fallback");
                self.fallback
                    .stream(messages)
                    .await
                    .map_err(|e| Self::both_failed(primary_err, e))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
