//! Mock LLM services for testing
//!
//! These mocks enable graph and adapter tests without network I/O.

use super::{DeltaSink, LlmError, LlmRequest, LlmResponse, LlmService};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Mock LLM service that returns queued responses
pub struct MockLlmService {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
    /// When set, `stream` splits text replies into these many-character deltas
    stream_chunk_chars: Option<usize>,
    delay: Option<Duration>,
}

impl MockLlmService {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            requests: Mutex::new(Vec::new()),
            stream_chunk_chars: None,
            delay: None,
        }
    }

    /// Emulate a token-streaming provider
    pub fn streaming(mut self, chunk_chars: usize) -> Self {
        self.stream_chunk_chars = Some(chunk_chars.max(1));
        self
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a text reply
    pub fn queue_text(&self, text: &str) {
        self.queue_response(LlmResponse::from_text(text));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }

    async fn stream(
        &self,
        request: &LlmRequest,
        deltas: DeltaSink,
    ) -> Result<LlmResponse, LlmError> {
        let response = self.complete(request).await?;
        let text = response.text();
        match self.stream_chunk_chars {
            Some(n) => {
                let chars: Vec<char> = text.chars().collect();
                for piece in chars.chunks(n) {
                    let _ = deltas.send(piece.iter().collect());
                }
            }
            None if !text.is_empty() => {
                let _ = deltas.send(text);
            }
            None => {}
        }
        Ok(response)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
