//! `InkIt` - conversational assistant for real-estate sales contracts
//!
//! Collects contract terms through chat or voice, backed by an LLM
//! conversation graph with a contract-generation tool.

mod adapter;
mod api;
mod checkpoint;
mod config;
mod conversation;
mod graph;
mod llm;
mod system_prompt;
mod tools;
mod voice;

use adapter::GraphLlm;
use api::{create_router, AppState};
use checkpoint::{CheckpointStore, ThreadId};
use config::AppConfig;
use graph::ConversationGraph;
use llm::{LlmService, LoggingService, OpenAIService};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tools::{ContractTool, ToolRegistry};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice::{ConsoleSpeaker, Transcript, VoiceAssistant};

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkit=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let config = AppConfig::from_env()?;
    tracing::info!(
        model = %config.llm.model,
        base_url = %config.llm.base_url,
        "Configuration loaded"
    );

    // LLM and graph
    let provider: Arc<dyn LlmService> = Arc::new(OpenAIService::new(config.llm.clone())?);
    let llm: Arc<dyn LlmService> = Arc::new(LoggingService::new(provider));

    let contracts = ContractTool::new(config.contracts_dir.clone());
    let checkpoints = Arc::new(CheckpointStore::new(config.eviction_policy()));
    let graph = Arc::new(ConversationGraph::assistant(
        llm,
        system_prompt::SYSTEM_PROMPT,
        Arc::new(ToolRegistry::standard(contracts.clone())),
        Arc::clone(&checkpoints),
        config.max_graph_steps,
    )?);

    spawn_eviction(checkpoints);

    if std::env::args().nth(1).as_deref() == Some("console") {
        let llm = GraphLlm::new(graph).with_system_policy(config.system_messages);
        return run_console(llm).await;
    }

    // Create router
    let state = AppState::new(graph, contracts);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new().gzip(true).br(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("InkIt server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically drop idle sessions
fn spawn_eviction(checkpoints: Arc<CheckpointStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            interval.tick().await;
            if checkpoints.is_empty() {
                continue;
            }
            let evicted = checkpoints.evict();
            tracing::debug!(evicted, threads = checkpoints.len(), "Eviction pass");
        }
    });
}

/// Drive the voice assistant from stdin lines, one transcript per line.
///
/// The whole console conversation is checkpointed on one thread.
async fn run_console(llm: GraphLlm) -> Result<(), Box<dyn std::error::Error>> {
    let session = ThreadId::generate();
    tracing::info!(session = %session, "Console session started");

    let (tx, rx) = mpsc::channel(16);
    let assistant = VoiceAssistant::new(llm, ConsoleSpeaker).with_session(session);
    let assistant = tokio::spawn(assistant.run(rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if tx.send(Transcript::final_text(line)).await.is_err() {
            break;
        }
    }
    drop(tx);

    assistant.await??;
    Ok(())
}
