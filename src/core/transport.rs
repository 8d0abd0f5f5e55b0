//! The completion API seen as a byte-stream source.
//!
//! [`CompletionTransport`] is the seam the session engine talks to. The
//! production implementation posts to an OpenAI-compatible
//! `chat/completions` endpoint with `stream: true` and hands back the raw
//! response body; decoding is the job of
//! [`StreamFrameParser`](crate::core::chat_stream::StreamFrameParser).

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ChatRequest};
use crate::core::chat_stream::format_api_error;
use crate::core::error::{MimicError, Result};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Incremental response body. An `Err` item means the connection broke
/// mid-stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Start a streaming completion. Resolves once response headers have
    /// arrived; failures before that point are returned as `Err`.
    async fn open_stream(&self, request: CompletionRequest) -> Result<ByteStream>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First delay; each further attempt doubles it.
    pub initial_delay_ms: u64,
    pub max_delay: Duration,
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay: Duration::from_secs(4),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub(crate) fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.initial_delay_ms / 2)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }
}

/// Streams completions from an OpenAI-compatible HTTP API.
///
/// Connection establishment is retried with exponential backoff for
/// transient failures. Nothing is retried once the body has started,
/// since partial output cannot be replayed.
#[derive(Clone)]
pub struct OpenAiTransport {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OpenAiTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn open_once(&self, request: &CompletionRequest) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            stream: true,
        };

        let response = self
            .client
            .post(self.chat_url())
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", request.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    MimicError::transient(format!("Connection failed: {e}"))
                } else {
                    MimicError::transport(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        let message = format_api_error(status.as_u16(), &error_text);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(MimicError::transient(message))
        } else {
            Err(MimicError::transport(message))
        }
    }
}

#[async_trait]
impl CompletionTransport for OpenAiTransport {
    async fn open_stream(&self, request: CompletionRequest) -> Result<ByteStream> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "opening completion stream"
        );

        let response = RetryIf::spawn(
            self.retry.strategy(),
            || self.open_once(&request),
            |err: &MimicError| {
                let retry = err.is_retryable();
                if retry {
                    warn!(error = %err, "completion request failed, retrying");
                }
                retry
            },
        )
        .await?;

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| MimicError::transport(format!("Stream interrupted: {e}")))
        });
        Ok(Box::pin(stream))
    }
}
