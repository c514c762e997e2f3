//! Conversation graph
//!
//! Nodes run over a shared [`GraphState`] whose messages only grow. Edges are
//! direct or conditional, and a run stops when routing reaches [`Route::End`].
//! Every run is bound to a thread: the thread's checkpoint stays locked for the
//! whole run and is written back only when the run succeeds.

mod node;
mod state;

pub use node::{AgentNode, Node, NodeContext, ToolsNode};
pub use state::{GraphState, StateUpdate};

use crate::checkpoint::{Checkpoint, CheckpointStore, ThreadId};
use crate::conversation::{Conversation, ConversationError, Message, Role};
use crate::llm::{DeltaSink, LlmError, LlmService};
use crate::tools::ToolRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const AGENT_NODE: &str = "agent";
pub const TOOLS_NODE: &str = "tools";

pub const DEFAULT_MAX_STEPS: usize = 25;

/// Where control goes after a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Node(String),
    End,
}

impl Route {
    pub fn to(node: impl Into<String>) -> Self {
        Route::Node(node.into())
    }
}

/// Routing decision computed from the state after a node ran
pub type Condition = Arc<dyn Fn(&GraphState) -> Route + Send + Sync>;

#[derive(Clone)]
enum Edge {
    Direct(Route),
    Conditional(Condition),
}

/// Route to the tools node while the latest assistant message asks for tools
pub fn tools_condition(state: &GraphState) -> Route {
    match state.last_message() {
        Some(message) if message.role == Role::Assistant && message.has_tool_calls() => {
            Route::to(TOOLS_NODE)
        }
        _ => Route::End,
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Upstream(#[from] LlmError),
    #[error("graph did not finish within {limit} steps")]
    StepLimit { limit: usize },
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("graph has no entry node")]
    NoEntry,
    #[error("graph finished without an assistant reply")]
    NoReply,
    #[error("unknown thread: {0}")]
    UnknownThread(ThreadId),
}

/// Assembles nodes and edges into a [`ConversationGraph`]
pub struct GraphBuilder {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: Option<String>,
    max_steps: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            entry: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl GraphBuilder {
    pub fn add_node(mut self, name: impl Into<String>, node: Arc<dyn Node>) -> Self {
        self.nodes.insert(name.into(), node);
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Always continue from `from` to `to`. Nodes without an edge end the run.
    pub fn add_edge(mut self, from: impl Into<String>, to: Route) -> Self {
        self.edges.insert(from.into(), Edge::Direct(to));
        self
    }

    pub fn add_conditional_edge<F>(mut self, from: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&GraphState) -> Route + Send + Sync + 'static,
    {
        self.edges
            .insert(from.into(), Edge::Conditional(Arc::new(condition)));
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn compile(self, checkpoints: Arc<CheckpointStore>) -> Result<ConversationGraph, GraphError> {
        let entry = self.entry.ok_or(GraphError::NoEntry)?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::UnknownNode(entry));
        }
        for (from, edge) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
            if let Edge::Direct(Route::Node(to)) = edge {
                if !self.nodes.contains_key(to) {
                    return Err(GraphError::UnknownNode(to.clone()));
                }
            }
        }

        Ok(ConversationGraph {
            nodes: self.nodes,
            edges: self.edges,
            entry,
            max_steps: self.max_steps,
            checkpoints,
        })
    }
}

/// A compiled graph bound to a checkpoint store
pub struct ConversationGraph {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: String,
    max_steps: usize,
    checkpoints: Arc<CheckpointStore>,
}

impl ConversationGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// The contract assistant: an agent node, plus a tools node when any
    /// tools are registered.
    pub fn assistant(
        llm: Arc<dyn LlmService>,
        system_prompt: &str,
        tools: Arc<ToolRegistry>,
        checkpoints: Arc<CheckpointStore>,
        max_steps: usize,
    ) -> Result<Self, GraphError> {
        let agent = AgentNode::new(llm, system_prompt).with_tools(tools.definitions());
        let mut builder = Self::builder()
            .add_node(AGENT_NODE, Arc::new(agent))
            .entry(AGENT_NODE)
            .max_steps(max_steps);

        if !tools.is_empty() {
            builder = builder
                .add_node(TOOLS_NODE, Arc::new(ToolsNode::new(tools)))
                .add_conditional_edge(AGENT_NODE, tools_condition)
                .add_edge(TOOLS_NODE, Route::to(AGENT_NODE));
        }
        builder.compile(checkpoints)
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Run the graph over `history` and store the result as the thread's
    /// checkpoint, replacing whatever was there. Assistant text goes to
    /// `deltas` as the model produces it.
    pub async fn invoke(
        &self,
        thread_id: &ThreadId,
        history: Conversation,
        deltas: Option<DeltaSink>,
    ) -> Result<Message, GraphError> {
        history.ensure_user_turn()?;
        let mut checkpoint = self.checkpoints.checkout(thread_id).await;
        let (conversation, reply) = self.run(thread_id, history, deltas).await?;
        checkpoint.commit(conversation);
        Ok(reply)
    }

    /// Run the graph over `history` without reading or writing any
    /// checkpoint. The caller owns the transcript.
    pub async fn invoke_detached(
        &self,
        history: Conversation,
        deltas: Option<DeltaSink>,
    ) -> Result<Message, GraphError> {
        history.ensure_user_turn()?;
        // Only labels logs and tool calls; never registered in the store
        let run_id = ThreadId::generate();
        let (_, reply) = self.run(&run_id, history, deltas).await?;
        Ok(reply)
    }

    /// Register an empty thread so later [`send`](Self::send) calls can find it
    pub async fn open(&self, thread_id: &ThreadId) {
        drop(self.checkpoints.checkout(thread_id).await);
    }

    /// Append `text` to the thread's stored conversation and run the graph.
    ///
    /// The thread must already exist. It stays locked from load to store, so
    /// concurrent sends on one thread are applied one after another.
    pub async fn send(
        &self,
        thread_id: &ThreadId,
        text: &str,
        deltas: Option<DeltaSink>,
    ) -> Result<Message, GraphError> {
        if text.trim().is_empty() {
            return Err(ConversationError::EmptyUserMessage.into());
        }
        let mut checkpoint = self
            .checkpoints
            .checkout_existing(thread_id)
            .await
            .ok_or_else(|| GraphError::UnknownThread(thread_id.clone()))?;
        let mut history = checkpoint.conversation.clone();
        history.push(Message::user(text));

        let (conversation, reply) = self.run(thread_id, history, deltas).await?;
        checkpoint.commit(conversation);
        Ok(reply)
    }

    /// The thread's latest checkpoint, if the thread exists
    pub async fn checkpoint(&self, thread_id: &ThreadId) -> Option<Checkpoint> {
        self.checkpoints.snapshot(thread_id).await
    }

    /// Drop the thread's stored conversation
    pub fn reset(&self, thread_id: &ThreadId) -> bool {
        self.checkpoints.remove(thread_id)
    }

    async fn run(
        &self,
        thread_id: &ThreadId,
        history: Conversation,
        deltas: Option<DeltaSink>,
    ) -> Result<(Conversation, Message), GraphError> {
        let ctx = NodeContext {
            thread_id: thread_id.clone(),
            deltas,
        };
        let mut state = GraphState::new(history);
        let mut current = self.entry.clone();
        let mut steps = 0;

        loop {
            if steps == self.max_steps {
                tracing::warn!(thread_id = %thread_id, limit = self.max_steps, "Graph step limit reached");
                return Err(GraphError::StepLimit {
                    limit: self.max_steps,
                });
            }
            steps += 1;

            let node = self
                .nodes
                .get(&current)
                .ok_or_else(|| GraphError::UnknownNode(current.clone()))?;
            let update = node.run(&state, &ctx).await?;
            tracing::debug!(
                thread_id = %thread_id,
                node = %current,
                appended = update.messages.len(),
                "Node completed"
            );
            state.apply(update);

            match self.next_route(&current, &state) {
                Route::Node(next) => current = next,
                Route::End => break,
            }
        }

        let reply = state
            .last_message()
            .filter(|m| m.role == Role::Assistant)
            .cloned()
            .ok_or(GraphError::NoReply)?;
        tracing::info!(
            thread_id = %thread_id,
            steps,
            messages = state.messages.len(),
            "Graph run completed"
        );
        Ok((state.into_conversation(), reply))
    }

    fn next_route(&self, from: &str, state: &GraphState) -> Route {
        match self.edges.get(from) {
            Some(Edge::Direct(route)) => route.clone(),
            Some(Edge::Conditional(condition)) => condition(state),
            None => Route::End,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::EvictionPolicy;
    use crate::llm::testing::MockLlmService;
    use crate::llm::{ContentBlock, LlmErrorKind, LlmResponse};
    use crate::tools::{ContractTool, CONTRACT_TOOL_NAME};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn graph_with(mock: Arc<MockLlmService>, tools: ToolRegistry) -> ConversationGraph {
        ConversationGraph::assistant(
            mock,
            "collect contract terms",
            Arc::new(tools),
            Arc::new(CheckpointStore::new(EvictionPolicy::default())),
            DEFAULT_MAX_STEPS,
        )
        .unwrap()
    }

    fn plain_graph(mock: Arc<MockLlmService>) -> ConversationGraph {
        graph_with(mock, ToolRegistry::empty())
    }

    fn contract_graph(mock: Arc<MockLlmService>) -> ConversationGraph {
        graph_with(mock, ToolRegistry::standard(ContractTool::new("contracts")))
    }

    #[tokio::test]
    async fn test_invoke_appends_one_assistant_reply() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_text("Which property is this for?");
        let graph = plain_graph(mock);
        let thread = ThreadId::new("t1");

        let history: Conversation = vec![Message::user("I need a sales contract")].into();
        let reply = graph.invoke(&thread, history.clone(), None).await.unwrap();

        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Which property is this for?");
        let stored = graph.checkpoint(&thread).await.unwrap().conversation;
        assert_eq!(stored.len(), history.len() + 1);
        assert_eq!(stored.last(), Some(&reply));
    }

    #[tokio::test]
    async fn test_assistant_last_fails_before_model_call() {
        let mock = Arc::new(MockLlmService::new("mock"));
        let graph = plain_graph(mock.clone());
        let thread = ThreadId::new("t1");

        let history: Conversation =
            vec![Message::user("hi"), Message::assistant("hello")].into();
        let err = graph.invoke(&thread, history, None).await.unwrap_err();

        assert!(matches!(
            err,
            GraphError::Conversation(ConversationError::LastMessageNotFromUser { .. })
        ));
        assert_eq!(mock.request_count(), 0);
        assert!(!graph.checkpoints().contains(&thread));
    }

    #[tokio::test]
    async fn test_empty_history_is_rejected() {
        let mock = Arc::new(MockLlmService::new("mock"));
        let graph = plain_graph(mock.clone());

        let err = graph
            .invoke(&ThreadId::new("t"), Conversation::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::Conversation(ConversationError::Empty)
        ));
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_prompt_is_instruction_then_full_history() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_text("ok");
        let graph = plain_graph(mock.clone());

        let history: Conversation = vec![
            Message::user("first"),
            Message::assistant("second"),
            Message::user("third"),
        ]
        .into();
        graph.invoke(&ThreadId::new("t"), history, None).await.unwrap();

        let request = &mock.recorded_requests()[0];
        assert_eq!(request.system[0].text, "collect contract terms");
        let texts: Vec<_> = request
            .messages
            .iter()
            .map(|m| match &m.content[0] {
                ContentBlock::Text { text } => text.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert!(request.tools.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_error_leaves_checkpoint_untouched() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_text("first reply");
        mock.queue_error(LlmError::rate_limit("slow down"));
        let graph = plain_graph(mock);
        let thread = ThreadId::new("t1");
        graph.open(&thread).await;

        graph.send(&thread, "hello", None).await.unwrap();
        let err = graph.send(&thread, "again", None).await.unwrap_err();

        match err {
            GraphError::Upstream(e) => {
                assert_eq!(e.kind, LlmErrorKind::RateLimit);
                assert_eq!(e.message, "slow down");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert_eq!(graph.checkpoint(&thread).await.unwrap().conversation.len(), 2);
    }

    #[tokio::test]
    async fn test_send_accumulates_thread_history() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_text("What is the address?");
        mock.queue_text("Got it, 123 Main St.");
        let graph = plain_graph(mock.clone());
        let thread = ThreadId::new("t1");
        graph.open(&thread).await;

        graph.send(&thread, "I want to buy a house", None).await.unwrap();
        graph.send(&thread, "123 Main St", None).await.unwrap();

        let stored = graph.checkpoint(&thread).await.unwrap().conversation;
        let roles: Vec<_> = stored.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(mock.recorded_requests()[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_send_rejects_blank_text() {
        let mock = Arc::new(MockLlmService::new("mock"));
        let graph = plain_graph(mock.clone());
        let err = graph
            .send(&ThreadId::new("t"), "   ", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::Conversation(ConversationError::EmptyUserMessage)
        ));
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_thread_does_not_create_it() {
        let mock = Arc::new(MockLlmService::new("mock"));
        let graph = plain_graph(mock.clone());
        let thread = ThreadId::new("evicted");

        let err = graph.send(&thread, "hello", None).await.unwrap_err();
        assert!(matches!(err, GraphError::UnknownThread(id) if id == thread));
        assert!(!graph.checkpoints().contains(&thread));
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_detached_invoke_leaves_store_untouched() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_text("What is the offer price?");
        let graph = plain_graph(mock);

        let reply = graph
            .invoke_detached(vec![Message::user("123 Main St")].into(), None)
            .await
            .unwrap();
        assert_eq!(reply.content, "What is the offer price?");
        assert!(graph.checkpoints().is_empty());
    }

    #[tokio::test]
    async fn test_threads_do_not_share_history() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_text("a");
        mock.queue_text("b");
        let graph = plain_graph(mock.clone());
        let (one, two) = (ThreadId::new("one"), ThreadId::new("two"));
        graph.open(&one).await;
        graph.open(&two).await;

        graph.send(&one, "hi", None).await.unwrap();
        graph.send(&two, "hi", None).await.unwrap();

        assert_eq!(mock.recorded_requests()[1].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_lose_messages() {
        let mock = Arc::new(MockLlmService::new("mock").with_delay(Duration::from_millis(5)));
        for i in 0..8 {
            mock.queue_text(&format!("reply {i}"));
        }
        let graph = Arc::new(plain_graph(mock));
        let thread = ThreadId::new("shared");
        graph.open(&thread).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let graph = Arc::clone(&graph);
            let thread = thread.clone();
            handles.push(tokio::spawn(async move {
                graph.send(&thread, &format!("msg {i}"), None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = graph.checkpoint(&thread).await.unwrap().conversation;
        assert_eq!(stored.len(), 16);
        for pair in stored.messages().chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
        }
    }

    #[tokio::test]
    async fn test_tool_call_routes_through_tools_node() {
        let mock = Arc::new(MockLlmService::new("mock"));
        mock.queue_response(LlmResponse {
            content: vec![ContentBlock::tool_use(
                "call_1",
                CONTRACT_TOOL_NAME,
                json!({
                    "property_address": "123 Main St",
                    "offer_price": 300000,
                    "down_payment": 60000,
                    "financing_type": "conventional",
                    "financing_amount": 240000,
                    "buyer_deposit": 5000
                }),
            )],
            end_turn: false,
            usage: crate::llm::Usage::default(),
        });
        mock.queue_text("Your contract is ready. Any changes?");
        let graph = contract_graph(mock.clone());
        let thread = ThreadId::new("t1");
        graph.open(&thread).await;

        let reply = graph
            .send(&thread, "Everything is in the previous messages", None)
            .await
            .unwrap();
        assert_eq!(reply.content, "Your contract is ready. Any changes?");

        let stored = graph.checkpoint(&thread).await.unwrap().conversation;
        let roles: Vec<_> = stored.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        let tool_message = &stored.messages()[2];
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_message.content.contains("\"status\":\"success\""));

        let requests = mock.recorded_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        assert!(matches!(
            requests[1].messages.last().map(|m| &m.content[..]),
            Some([ContentBlock::ToolResult { .. }])
        ));
    }

    #[tokio::test]
    async fn test_streaming_invoke_forwards_deltas() {
        let mock = Arc::new(MockLlmService::new("mock").streaming(5));
        mock.queue_text("What is the offer price?");
        let graph = plain_graph(mock);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = graph
            .invoke(
                &ThreadId::new("t"),
                vec![Message::user("123 Main St")].into(),
                Some(tx),
            )
            .await
            .unwrap();

        let mut deltas = Vec::new();
        while let Some(delta) = rx.recv().await {
            deltas.push(delta);
        }
        assert!(deltas.len() > 1);
        assert_eq!(deltas.concat(), reply.content);
    }

    struct Echo;

    #[async_trait]
    impl Node for Echo {
        async fn run(
            &self,
            _state: &GraphState,
            _ctx: &NodeContext,
        ) -> Result<StateUpdate, GraphError> {
            Ok(StateUpdate::message(Message::assistant("again")))
        }
    }

    #[tokio::test]
    async fn test_step_limit_stops_loops() {
        let graph = ConversationGraph::builder()
            .add_node("echo", Arc::new(Echo))
            .entry("echo")
            .add_edge("echo", Route::to("echo"))
            .max_steps(3)
            .compile(Arc::new(CheckpointStore::default()))
            .unwrap();
        let thread = ThreadId::new("loop");

        let err = graph
            .invoke(&thread, vec![Message::user("go")].into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::StepLimit { limit: 3 }));
        assert_eq!(graph.checkpoint(&thread).await.map(|c| c.conversation), Some(Conversation::new()));
    }

    #[test]
    fn test_compile_validates_structure() {
        let store = Arc::new(CheckpointStore::default());

        let missing_entry = ConversationGraph::builder()
            .add_node("echo", Arc::new(Echo))
            .compile(Arc::clone(&store));
        assert!(matches!(missing_entry, Err(GraphError::NoEntry)));

        let dangling = ConversationGraph::builder()
            .add_node("echo", Arc::new(Echo))
            .entry("echo")
            .add_edge("echo", Route::to("nowhere"))
            .compile(store);
        assert!(matches!(dangling, Err(GraphError::UnknownNode(name)) if name == "nowhere"));
    }

    #[test]
    fn test_tools_condition() {
        let plain = GraphState::new(vec![Message::assistant("done")].into());
        assert_eq!(tools_condition(&plain), Route::End);

        let call = crate::conversation::ToolCall {
            id: "c".to_string(),
            name: CONTRACT_TOOL_NAME.to_string(),
            arguments: json!({}),
        };
        let wants_tools = GraphState::new(vec![Message::assistant_with_tools("", vec![call])].into());
        assert_eq!(tools_condition(&wants_tools), Route::to(TOOLS_NODE));
    }
}
