//! Graph nodes: the agent call and the tool runner

use super::{GraphError, GraphState, StateUpdate};
use crate::checkpoint::ThreadId;
use crate::conversation::{Message, Role, ToolCall};
use crate::llm::{
    ContentBlock, DeltaSink, LlmMessage, LlmRequest, LlmResponse, LlmService, MessageRole,
    SystemContent, ToolDefinition,
};
use crate::tools::{ToolContext, ToolRegistry};
use async_trait::async_trait;
use std::sync::Arc;

/// Per-run context shared by every node
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub thread_id: ThreadId,
    /// Receives assistant text as it is generated
    pub deltas: Option<DeltaSink>,
}

/// One step of a conversation graph.
///
/// A node sees the full state and returns a partial update; the graph
/// appends the update's messages.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, state: &GraphState, ctx: &NodeContext) -> Result<StateUpdate, GraphError>;
}

/// Formats the prompt, calls the model and appends its reply
pub struct AgentNode {
    llm: Arc<dyn LlmService>,
    system_prompt: String,
    tools: Vec<ToolDefinition>,
}

impl AgentNode {
    pub fn new(llm: Arc<dyn LlmService>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
        }
    }

    /// Advertise these tools to the model
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// System instruction first, then the whole history in order.
    ///
    /// System messages inside the history are forwarded as extra system
    /// content after the fixed instruction.
    pub fn build_request(&self, state: &GraphState) -> LlmRequest {
        let mut system = vec![SystemContent::new(&self.system_prompt)];
        let mut messages = Vec::with_capacity(state.messages.len());

        for message in &state.messages {
            match message.role {
                Role::System => system.push(SystemContent::new(&message.content)),
                Role::User => messages.push(LlmMessage::user_text(&message.content)),
                Role::Assistant => {
                    let mut content = Vec::with_capacity(1 + message.tool_calls.len());
                    if !message.content.is_empty() || message.tool_calls.is_empty() {
                        content.push(ContentBlock::text(&message.content));
                    }
                    content.extend(message.tool_calls.iter().map(|call| {
                        ContentBlock::tool_use(&call.id, &call.name, call.arguments.clone())
                    }));
                    messages.push(LlmMessage {
                        role: MessageRole::Assistant,
                        content,
                    });
                }
                Role::Tool => messages.push(LlmMessage {
                    role: MessageRole::User,
                    content: vec![ContentBlock::tool_result(
                        message.tool_call_id.as_deref().unwrap_or_default(),
                        &message.content,
                        false,
                    )],
                }),
            }
        }

        LlmRequest {
            system,
            messages,
            tools: self.tools.clone(),
            max_tokens: None,
        }
    }
}

fn reply_message(response: &LlmResponse) -> Message {
    let tool_calls: Vec<ToolCall> = response
        .tool_uses()
        .into_iter()
        .map(|(id, name, input)| ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: input.clone(),
        })
        .collect();
    Message::assistant_with_tools(response.text(), tool_calls)
}

#[async_trait]
impl Node for AgentNode {
    async fn run(&self, state: &GraphState, ctx: &NodeContext) -> Result<StateUpdate, GraphError> {
        let request = self.build_request(state);
        let response = match &ctx.deltas {
            Some(deltas) => self.llm.stream(&request, deltas.clone()).await?,
            None => self.llm.complete(&request).await?,
        };
        Ok(StateUpdate::message(reply_message(&response)))
    }
}

/// Runs the tool calls of the latest assistant message
pub struct ToolsNode {
    registry: Arc<ToolRegistry>,
}

impl ToolsNode {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Node for ToolsNode {
    async fn run(&self, state: &GraphState, ctx: &NodeContext) -> Result<StateUpdate, GraphError> {
        let Some(last) = state.last_message().filter(|m| m.has_tool_calls()) else {
            return Ok(StateUpdate::empty());
        };

        let mut results = Vec::with_capacity(last.tool_calls.len());
        for call in &last.tool_calls {
            let tool_ctx = ToolContext::new(ctx.thread_id.clone());
            let output = self
                .registry
                .execute(&call.name, call.arguments.clone(), tool_ctx)
                .await;
            let content = match output {
                Some(output) => output.output,
                None => {
                    tracing::warn!(tool = %call.name, thread_id = %ctx.thread_id, "Model requested unknown tool");
                    format!("Unknown tool: {}", call.name)
                }
            };
            results.push(Message::tool_result(&call.id, content));
        }
        Ok(StateUpdate::messages(results))
    }
}
