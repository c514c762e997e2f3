//! LLM provider abstraction
//!
//! Provides a common interface for interacting with OpenAI-compatible
//! chat-completion providers.

mod error;
mod openai;
#[cfg(test)]
pub mod testing;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use openai::{OpenAIConfig, OpenAIService};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Make a completion request, forwarding text to `deltas` as it is produced.
    ///
    /// Providers without token streaming deliver the whole reply as a single
    /// delta. The returned response is always the complete reply.
    async fn stream(
        &self,
        request: &LlmRequest,
        deltas: DeltaSink,
    ) -> Result<LlmResponse, LlmError> {
        let response = self.complete(request).await?;
        let text = response.text();
        if !text.is_empty() {
            let _ = deltas.send(text);
        }
        Ok(response)
    }

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }

    fn log_result(
        &self,
        result: &Result<LlmResponse, LlmError>,
        duration: std::time::Duration,
        streamed: bool,
    ) {
        match result {
            Ok(response) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    tool_calls = response.tool_uses().len(),
                    end_turn = response.end_turn,
                    streamed,
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    streamed,
                    "LLM request failed"
                );
            }
        }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.complete(request).await;
        self.log_result(&result, start.elapsed(), false);
        result
    }

    async fn stream(
        &self,
        request: &LlmRequest,
        deltas: DeltaSink,
    ) -> Result<LlmResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.stream(request, deltas).await;
        self.log_result(&result, start.elapsed(), true);
        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
