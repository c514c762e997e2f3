//! Tools the assistant can call
//!
//! Tools are stateless singletons. Everything a call needs beyond its JSON
//! input arrives through [`ToolContext`].

mod contract;
mod mls;

pub use contract::{ContractResult, ContractTool, CONTRACT_TOOL_NAME};

use crate::checkpoint::ThreadId;
use crate::llm::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            display_data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            display_data: None,
        }
    }

    pub fn with_display(mut self, data: Value) -> Self {
        self.display_data = Some(data);
        self
    }
}

/// Per-call context handed to a tool
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The conversation thread the call belongs to
    pub thread_id: ThreadId,
}

impl ToolContext {
    pub fn new(thread_id: ThreadId) -> Self {
        Self { thread_id }
    }
}

/// Trait for tools that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool. Failures are reported in the output, never raised.
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Collection of tools available to conversations
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// A registry with no tools; the graph then never routes to a tools node
    pub fn empty() -> Self {
        Self::default()
    }

    /// The contract-collection tool set
    pub fn standard(contract_tool: ContractTool) -> Self {
        Self::empty().with_tool(Arc::new(contract_tool))
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get all tool definitions for LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name, or `None` if no such tool is registered
    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        let tool = self.tools.iter().find(|t| t.name() == name)?;
        tracing::debug!(tool = name, thread_id = %ctx.thread_id, "Running tool");
        Some(tool.run(input, ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext::new(ThreadId::new("test-thread"))
    }

    #[test]
    fn test_standard_registry_advertises_contract_tool() {
        let registry = ToolRegistry::standard(ContractTool::new("contracts"));
        let defs = registry.definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();

        assert_eq!(names, vec![CONTRACT_TOOL_NAME]);
        assert_eq!(defs[0].input_schema["type"], "object");
    }

    #[tokio::test]
    async fn test_unknown_tool_returns_none() {
        let registry = ToolRegistry::standard(ContractTool::new("contracts"));
        assert!(registry.execute("bash", json!({}), ctx()).await.is_none());
    }

    #[tokio::test]
    async fn test_execute_dispatches_by_name() {
        let registry = ToolRegistry::standard(ContractTool::new("contracts"));
        let output = registry
            .execute(CONTRACT_TOOL_NAME, json!({"property_address": ""}), ctx())
            .await
            .unwrap();
        assert!(!output.success);
        assert!(output.output.contains("Invalid contract information"));
    }

    #[test]
    fn test_empty_registry() {
        assert!(ToolRegistry::empty().is_empty());
        assert!(ToolRegistry::empty().definitions().is_empty());
    }
}
