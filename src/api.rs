//! Text-chat HTTP API
//!
//! Sessions map one-to-one onto graph threads; the checkpoint store is the
//! session registry.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::graph::ConversationGraph;
use crate::tools::ContractTool;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub graph: Arc<ConversationGraph>,
    pub contracts: Arc<ContractTool>,
}

impl AppState {
    pub fn new(graph: Arc<ConversationGraph>, contracts: ContractTool) -> Self {
        Self {
            graph,
            contracts: Arc::new(contracts),
        }
    }
}
