//! Chat-stream adapter over the conversation graph
//!
//! Voice pipelines and chat front-ends speak in chat contexts and chunked
//! streams. [`GraphLlm`] converts a chat context into graph messages, runs the
//! graph for one turn and yields the reply as [`ChatChunk`]s.

use crate::checkpoint::ThreadId;
use crate::conversation::{Conversation, ConversationError, Message, Role};
use crate::graph::{ConversationGraph, GraphError};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl From<ChatRole> for Role {
    fn from(role: ChatRole) -> Self {
        match role {
            ChatRole::System => Role::System,
            ChatRole::User => Role::User,
            ChatRole::Assistant => Role::Assistant,
            ChatRole::Tool => Role::Tool,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Running transcript of a chat, owned by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    pub messages: Vec<ChatMessage>,
}

impl ChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn append(mut self, role: ChatRole, content: impl Into<String>) -> Self {
        self.push(role, content);
        self
    }

    pub fn push(&mut self, role: ChatRole, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }
}

/// Functions a caller offers for the model to call
#[derive(Debug, Clone, Default)]
pub struct FunctionContext {
    pub names: Vec<String>,
}

/// What to do with system messages found in a chat context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SystemMessagePolicy {
    /// Pass them to the graph, where they follow the fixed instruction
    #[default]
    Forward,
    Drop,
}

impl FromStr for SystemMessagePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Self::Forward),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown system message policy: {other}")),
        }
    }
}

/// Per-turn options for [`GraphLlm::chat`]
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Thread whose checkpoint records the turn. Without one the turn runs
    /// detached and nothing is stored.
    pub session: Option<ThreadId>,
    /// Not supported; logged and ignored
    pub functions: Option<FunctionContext>,
}

impl ChatOptions {
    pub fn session(thread_id: ThreadId) -> Self {
        Self {
            session: Some(thread_id),
            functions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceDelta {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub delta: ChoiceDelta,
}

/// One unit of a streamed reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub request_id: String,
    pub choices: Vec<Choice>,
}

impl ChatChunk {
    fn assistant(request_id: &str, content: String) -> Self {
        Self {
            request_id: request_id.to_string(),
            choices: vec![Choice {
                index: 0,
                delta: ChoiceDelta {
                    role: ChatRole::Assistant,
                    content,
                },
            }],
        }
    }

    /// Concatenated text of every choice
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .map(|c| c.delta.content.as_str())
            .collect()
    }
}

/// Streamed reply for one turn.
///
/// Yields at least one chunk on success. A failed run ends the stream with a
/// single `Err` item.
pub struct ChatStream {
    request_id: String,
    inner: UnboundedReceiverStream<Result<ChatChunk, GraphError>>,
}

impl ChatStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Drain the stream into the full reply text
    pub async fn collect_text(mut self) -> Result<String, GraphError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?.text());
        }
        Ok(text)
    }
}

impl Stream for ChatStream {
    type Item = Result<ChatChunk, GraphError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Exposes a [`ConversationGraph`] as a streaming chat model
#[derive(Clone)]
pub struct GraphLlm {
    graph: Arc<ConversationGraph>,
    system_policy: SystemMessagePolicy,
}

impl GraphLlm {
    pub fn new(graph: Arc<ConversationGraph>) -> Self {
        Self {
            graph,
            system_policy: SystemMessagePolicy::default(),
        }
    }

    pub fn with_system_policy(mut self, policy: SystemMessagePolicy) -> Self {
        self.system_policy = policy;
        self
    }

    /// Start one turn. The context must end with a user message; that is
    /// checked here, before the model is called.
    pub fn chat(&self, ctx: &ChatContext, options: ChatOptions) -> Result<ChatStream, GraphError> {
        if let Some(functions) = &options.functions {
            tracing::warn!(
                functions = functions.names.len(),
                "Function context is not supported by the graph adapter; ignoring it"
            );
        }

        let history = self.to_conversation(ctx)?;
        let request_id = uuid::Uuid::new_v4().to_string();

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let graph = Arc::clone(&self.graph);
        let task_request_id = request_id.clone();
        tokio::spawn(async move {
            forward_turn(graph, options.session, history, task_request_id, chunk_tx).await;
        });

        Ok(ChatStream {
            request_id,
            inner: UnboundedReceiverStream::new(chunk_rx),
        })
    }

    fn to_conversation(&self, ctx: &ChatContext) -> Result<Conversation, ConversationError> {
        let (last, prior) = ctx.messages.split_last().ok_or(ConversationError::Empty)?;
        if last.role != ChatRole::User {
            return Err(ConversationError::LastMessageNotFromUser {
                role: last.role.into(),
            });
        }

        let mut conversation: Conversation = prior
            .iter()
            .filter_map(|msg| match msg.role {
                ChatRole::User => Some(Message::user(&msg.content)),
                ChatRole::Assistant => Some(Message::assistant(&msg.content)),
                ChatRole::System => match self.system_policy {
                    SystemMessagePolicy::Forward => Some(Message::system(&msg.content)),
                    SystemMessagePolicy::Drop => None,
                },
                ChatRole::Tool => None,
            })
            .collect();
        conversation.push(Message::user(&last.content));
        Ok(conversation)
    }
}

/// Run one turn, turning model deltas into chunks as they arrive
async fn forward_turn(
    graph: Arc<ConversationGraph>,
    session: Option<ThreadId>,
    history: Conversation,
    request_id: String,
    chunks: mpsc::UnboundedSender<Result<ChatChunk, GraphError>>,
) {
    let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
    let run = async {
        match &session {
            Some(thread_id) => graph.invoke(thread_id, history, Some(delta_tx)).await,
            None => graph.invoke_detached(history, Some(delta_tx)).await,
        }
    };
    tokio::pin!(run);

    let mut streamed = false;
    let mut forward = |delta: String| {
        if !delta.is_empty() {
            streamed = true;
            let _ = chunks.send(Ok(ChatChunk::assistant(&request_id, delta)));
        }
    };

    let result = loop {
        tokio::select! {
            biased;
            Some(delta) = delta_rx.recv() => forward(delta),
            result = &mut run => break result,
        }
    };
    while let Ok(delta) = delta_rx.try_recv() {
        forward(delta);
    }

    match result {
        Ok(reply) => {
            if !streamed {
                let _ = chunks.send(Ok(ChatChunk::assistant(&request_id, reply.content)));
            }
        }
        Err(e) => {
            tracing::error!(
                session = session.as_ref().map(ThreadId::as_str),
                request_id = %request_id,
                error = %e,
                "Error processing through graph"
            );
            let _ = chunks.send(Err(e));
        }
    }
}
