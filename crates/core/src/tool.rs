//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what let the agent act: look something up, compute, touch files.
//! The loop only knows a tool through this trait; it never spawns tool work
//! concurrently, one call runs to completion before the next starts.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::event::{Event, EventSink};
use crate::message::ToolCall;
use crate::model::ToolDefinition;

/// Policy hook consulted once per call before execution.
///
/// Receives the run's cancellation token so a prompt waiting on a user can
/// give up when the run is aborted. Returning an error denies the call.
/// Denials are policy decisions and never count as tool failures.
pub type PermissionFunc = Arc<
    dyn Fn(ToolCall, CancellationToken) -> BoxFuture<'static, Result<(), ToolError>>
        + Send
        + Sync,
>;

/// Lets a long-running tool publish partial output before it completes.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tool_call_id: String,
    tool_name: String,
    sink: Option<EventSink>,
}

impl ProgressReporter {
    pub fn new(tool_call_id: impl Into<String>, tool_name: impl Into<String>, sink: EventSink) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            sink: Some(sink),
        }
    }

    /// A reporter that discards everything.
    pub fn disabled() -> Self {
        Self {
            tool_call_id: String::new(),
            tool_name: String::new(),
            sink: None,
        }
    }

    /// Emit a `tool_exec_update` event carrying `partial`.
    pub async fn report(&self, partial: serde_json::Value) {
        if let Some(sink) = &self.sink {
            sink.emit(Event::ToolExecUpdate {
                tool_call_id: self.tool_call_id.clone(),
                tool_name: self.tool_name.clone(),
                partial,
            })
            .await;
        }
    }
}

/// Per-call execution context handed to [`Tool::execute`].
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tool_call_id: String,
    /// Cancelled when the run is aborted
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

impl ToolContext {
    /// A detached context, handy for calling a tool outside a run.
    pub fn detached(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            cancel: CancellationToken::new(),
            progress: ProgressReporter::disabled(),
        }
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name the model calls this tool by.
    fn name(&self) -> &str;

    /// Human-readable display name.
    fn label(&self) -> &str {
        self.name()
    }

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool. `Err` becomes an error result fed back to the model.
    async fn execute(
        &self,
        ctx: ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// An ordered set of tools, looked up by name.
///
/// Registration order is preserved so tool definitions reach the model in a
/// stable order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(i) => self.tools[i] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Get all tool definitions (for sending to the model).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl From<Vec<Arc<dyn Tool>>> for ToolRegistry {
    fn from(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool);
        }
        registry
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
