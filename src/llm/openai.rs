//! `OpenAI`-compatible provider implementation
//!
//! Groq, `OpenAI` and most hosted inference services speak the same
//! `chat/completions` dialect; only the base URL and key differ.

use super::types::{
    ContentBlock, DeltaSink, LlmMessage, LlmRequest, LlmResponse, MessageRole, Usage,
};
use super::{LlmError, LlmService};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Connection settings for an `OpenAI`-compatible endpoint
#[derive(Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    /// Base URL up to and including the API version, e.g. `https://api.groq.com/openai/v1`
    pub base_url: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for OpenAIConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// OpenAI-compatible service implementation
pub struct OpenAIService {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAIService {
    pub fn new(config: OpenAIConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        let endpoint = format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        );

        Ok(Self {
            client,
            api_key: config.api_key,
            model: config.model,
            endpoint,
        })
    }

    fn translate_request(&self, request: &LlmRequest, stream: bool) -> OpenAIRequest {
        let mut messages = Vec::new();

        // Add system messages first
        if !request.system.is_empty() {
            let system_text = request
                .system
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");

            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(system_text),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in &request.messages {
            // translate_message may return multiple messages (tool results need separate messages)
            messages.extend(Self::translate_message(msg));
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAITool {
                        r#type: "function".to_string(),
                        function: OpenAIFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        OpenAIRequest {
            model: self.model.clone(),
            messages,
            tools,
            max_tokens: request.max_tokens,
            stream,
        }
    }

    /// Translate an LLM message to `OpenAI` format.
    /// Returns a Vec because tool results need separate messages with role "tool".
    fn translate_message(msg: &LlmMessage) -> Vec<OpenAIMessage> {
        let role = match msg.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();

        for block in &msg.content {
            match block {
                ContentBlock::Text { text } => {
                    text_parts.push(text.clone());
                }
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(OpenAIToolCall {
                        id: id.clone(),
                        r#type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: name.clone(),
                            arguments: serde_json::to_string(input)
                                .unwrap_or_else(|_| "{}".to_string()),
                        },
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    tool_results.push((tool_use_id.clone(), content.clone(), *is_error));
                }
            }
        }

        let mut messages = Vec::new();

        if !text_parts.is_empty() || !tool_calls.is_empty() {
            let content = if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join("\n"))
            };

            let tool_calls_opt = if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            };

            messages.push(OpenAIMessage {
                role: role.to_string(),
                content,
                tool_calls: tool_calls_opt,
                tool_call_id: None,
            });
        }

        for (tool_use_id, content, is_error) in tool_results {
            messages.push(OpenAIMessage {
                role: "tool".to_string(),
                content: Some(if is_error {
                    format!("Error: {content}")
                } else {
                    content
                }),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            });
        }

        if messages.is_empty() {
            messages.push(OpenAIMessage {
                role: role.to_string(),
                content: Some(String::new()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        messages
    }

    fn normalize_response(resp: OpenAIResponse) -> Result<LlmResponse, LlmError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::unknown("No choices in response"))?;

        let mut content = Vec::new();

        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text });
            }
        }

        if let Some(tool_calls) = choice.message.tool_calls {
            for tc in tool_calls {
                if tc.function.name.is_empty() {
                    continue;
                }
                content.push(ContentBlock::ToolUse {
                    id: tc.id,
                    name: tc.function.name,
                    input: parse_arguments(&tc.function.arguments),
                });
            }
        }

        let end_turn = choice.finish_reason.as_deref() == Some("stop");

        Ok(LlmResponse {
            content,
            end_turn,
            usage: resp.usage.map(Usage::from).unwrap_or_default(),
        })
    }

    /// POST the request and turn non-success statuses into classified errors
    async fn post(&self, body: &OpenAIRequest) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

        let mut error = match serde_json::from_str::<OpenAIErrorResponse>(&body) {
            Ok(error_resp) => LlmError::from_status(status.as_u16(), &error_resp.error.message),
            Err(_) => LlmError::unknown(format!("HTTP {status} error: {body}")),
        };
        if let Some(delay) = retry_after {
            error = error.with_retry_after(delay);
        }
        Err(error)
    }
}

#[async_trait]
impl LlmService for OpenAIService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let openai_request = self.translate_request(request, false);
        let response = self.post(&openai_request).await?;

        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

        let openai_response: OpenAIResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::unknown(format!("Failed to parse response: {e} - body: {body}"))
        })?;

        Self::normalize_response(openai_response)
    }

    async fn stream(
        &self,
        request: &LlmRequest,
        deltas: DeltaSink,
    ) -> Result<LlmResponse, LlmError> {
        let openai_request = self.translate_request(request, true);
        let response = self.post(&openai_request).await?;

        let mut events = response.bytes_stream().eventsource();
        let mut acc = StreamAccumulator::default();

        while let Some(event) = events.next().await {
            let event = event.map_err(|e| LlmError::network(format!("SSE stream error: {e}")))?;
            if event.data == "[DONE]" {
                return Ok(acc.finish());
            }

            let chunk: OpenAIStreamChunk = serde_json::from_str(&event.data).map_err(|e| {
                LlmError::unknown(format!("SSE parsing error: {e}, data: {}", event.data))
            })?;
            if let Some(error) = &chunk.error {
                return Err(LlmError::server_error(format!(
                    "SSE API error: {}",
                    error.message
                )));
            }
            acc.apply(chunk, &deltas);
        }

        Err(LlmError::network(
            "SSE stream closed before response completed",
        ))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

fn parse_arguments(arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|e| {
        tracing::warn!(error = %e, arguments = %arguments, "Failed to parse function call arguments");
        serde_json::json!({})
    })
}

/// Assembles streamed chunks into a complete response
#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    /// Tool calls arrive as fragments keyed by their position in the reply
    tool_calls: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    fn apply(&mut self, chunk: OpenAIStreamChunk, deltas: &DeltaSink) {
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                self.text.push_str(&text);
                let _ = deltas.send(text);
            }
        }

        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            let call = self.tool_calls.entry(fragment.index).or_default();
            if let Some(id) = fragment.id {
                call.id = id;
            }
            if let Some(function) = fragment.function {
                if let Some(name) = function.name {
                    call.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    call.arguments.push_str(&arguments);
                }
            }
        }

        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }
    }

    fn finish(self) -> LlmResponse {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::Text { text: self.text });
        }
        for call in self.tool_calls.into_values() {
            if call.name.is_empty() {
                continue;
            }
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                input: parse_arguments(&call.arguments),
            });
        }

        LlmResponse {
            content,
            end_turn: self.finish_reason.as_deref() == Some("stop"),
            usage: self.usage.unwrap_or_default(),
        }
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    r#type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[allow(clippy::struct_field_names)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<OpenAIUsage> for Usage {
    fn from(usage: OpenAIUsage) -> Self {
        Usage {
            input_tokens: u64::from(usage.prompt_tokens),
            output_tokens: u64::from(usage.completion_tokens),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
    #[serde(default)]
    error: Option<OpenAIError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{SystemContent, ToolDefinition};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn service() -> OpenAIService {
        OpenAIService::new(OpenAIConfig {
            api_key: "test-key".to_string(),
            model: "llama-3.3-70b-specdec".to_string(),
            base_url: "https://api.groq.com/openai/v1/".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        assert_eq!(
            service().endpoint,
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn test_translate_request_puts_system_first() {
        let request = LlmRequest {
            system: vec![SystemContent::new("rules"), SystemContent::new("persona")],
            messages: vec![LlmMessage::user_text("hi")],
            tools: vec![ToolDefinition {
                name: "generate_sales_contract".to_string(),
                description: "d".to_string(),
                input_schema: json!({"type": "object"}),
            }],
            max_tokens: None,
        };
        let translated = service().translate_request(&request, false);

        assert_eq!(translated.messages.len(), 2);
        assert_eq!(translated.messages[0].role, "system");
        assert_eq!(
            translated.messages[0].content.as_deref(),
            Some("rules\n\npersona")
        );
        assert_eq!(translated.messages[1].role, "user");
        assert_eq!(translated.tools.as_ref().map(Vec::len), Some(1));

        let body = serde_json::to_value(&translated).unwrap();
        assert_eq!(body["model"], "llama-3.3-70b-specdec");
        assert_eq!(body["stream"], false);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_tool_results_become_tool_messages() {
        let msg = LlmMessage {
            role: MessageRole::User,
            content: vec![
                ContentBlock::tool_result("call_1", "{\"status\":\"error\"}", false),
                ContentBlock::tool_result("call_2", "boom", true),
            ],
        };
        let translated = OpenAIService::translate_message(&msg);

        assert_eq!(translated.len(), 2);
        assert!(translated.iter().all(|m| m.role == "tool"));
        assert_eq!(translated[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(translated[1].content.as_deref(), Some("Error: boom"));
    }

    #[test]
    fn test_normalize_response_with_tool_call() {
        let resp: OpenAIResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "generate_sales_contract",
                            "arguments": "{\"property_address\":\"123 Main St\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }))
        .unwrap();

        let response = OpenAIService::normalize_response(resp).unwrap();
        assert!(!response.end_turn);
        let uses = response.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "call_1");
        assert_eq!(uses[0].2["property_address"], "123 Main St");
        assert_eq!(response.usage.input_tokens, 10);
    }

    #[test]
    fn test_normalize_response_without_choices_fails() {
        let resp: OpenAIResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(OpenAIService::normalize_response(resp).is_err());
    }

    #[test]
    fn test_stream_accumulator_assembles_fragments() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut acc = StreamAccumulator::default();
        let chunks = [
            json!({"choices": [{"delta": {"role": "assistant", "content": "Sure, "}}]}),
            json!({"choices": [{"delta": {"content": "generating."}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0, "id": "call_9",
                "function": {"name": "generate_sales_contract", "arguments": "{\"offer_"}
            }]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": "price\": 300000}"}
            }]}, "finish_reason": "tool_calls"}]}),
        ];
        for chunk in chunks {
            acc.apply(serde_json::from_value(chunk).unwrap(), &tx);
        }
        drop(tx);

        let response = acc.finish();
        assert_eq!(response.text(), "Sure, generating.");
        let uses = response.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "call_9");
        assert_eq!(uses[0].2["offer_price"], 300_000);
        assert!(!response.end_turn);

        let mut streamed = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            streamed.push(delta);
        }
        assert_eq!(streamed, vec!["Sure, ", "generating."]);
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = OpenAIConfig {
            api_key: "secret-key".to_string(),
            model: "m".to_string(),
            base_url: "u".to_string(),
            timeout: Duration::from_secs(1),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
