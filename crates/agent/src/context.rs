//! Per-run working state and loop parameterization.
//!
//! An [`AgentContext`] and a [`LoopConfig`] are built fresh for every run and
//! owned exclusively by the loop task; nothing outside the task mutates them.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use turnloop_core::{
    AgentMessage, ChatModel, EventChannelConfig, HookError, Message, ModelRequest, ModelResult,
    ModelStream, PermissionFunc, ThinkingLevel, ToolRegistry,
};

/// Default turn limit for one run.
pub const DEFAULT_MAX_TURNS: u32 = 10;

/// Prunes, injects or compacts history before each model call.
pub type TransformContextFn = Arc<
    dyn Fn(Vec<AgentMessage>, CancellationToken) -> BoxFuture<'static, Result<Vec<AgentMessage>, HookError>>
        + Send
        + Sync,
>;

/// Filters agent-level history down to provider-ready messages.
pub type ConvertToLlmFn = Arc<dyn Fn(&[AgentMessage]) -> Vec<Message> + Send + Sync>;

/// Pulls queued messages (steering or follow-up) at loop checkpoints.
pub type MessageBatchFn = Arc<dyn Fn() -> Vec<AgentMessage> + Send + Sync>;

/// Replaces the model's streaming API, e.g. to proxy a provider or script a test.
///
/// The returned stream is consumed exactly like the model's own.
pub type StreamFn = Arc<
    dyn Fn(ModelRequest, CancellationToken) -> BoxFuture<'static, ModelResult<ModelStream>>
        + Send
        + Sync,
>;

/// Keep only concrete provider messages.
pub fn default_convert_to_llm(messages: &[AgentMessage]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|m| m.as_message().cloned())
        .collect()
}

/// The conversation state one run works on.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub system_prompt: String,
    pub messages: Vec<AgentMessage>,
    pub tools: ToolRegistry,
}

impl AgentContext {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_messages(mut self, messages: Vec<AgentMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }
}

/// Full parameterization of one loop invocation.
#[derive(Clone)]
pub struct LoopConfig {
    pub model: Arc<dyn ChatModel>,
    /// When set, used instead of the model's streaming API
    pub stream_fn: Option<StreamFn>,
    pub max_turns: u32,
    /// 0 = no retry
    pub max_retries: u32,
    /// 0 = circuit breaker disabled
    pub max_tool_errors: u32,
    pub thinking: ThinkingLevel,
    pub transform_context: Option<TransformContextFn>,
    pub convert_to_llm: Option<ConvertToLlmFn>,
    pub permission: Option<PermissionFunc>,
    pub get_steering_messages: Option<MessageBatchFn>,
    pub get_follow_up_messages: Option<MessageBatchFn>,
    pub events: EventChannelConfig,
}

impl LoopConfig {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            stream_fn: None,
            max_turns: DEFAULT_MAX_TURNS,
            max_retries: 0,
            max_tool_errors: 0,
            thinking: ThinkingLevel::Off,
            transform_context: None,
            convert_to_llm: None,
            permission: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
            events: EventChannelConfig::default(),
        }
    }

    pub fn with_stream_fn(mut self, f: StreamFn) -> Self {
        self.stream_fn = Some(f);
        self
    }

    pub fn with_max_turns(mut self, max: u32) -> Self {
        self.max_turns = max;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_max_tool_errors(mut self, max: u32) -> Self {
        self.max_tool_errors = max;
        self
    }

    pub fn with_thinking(mut self, level: ThinkingLevel) -> Self {
        self.thinking = level;
        self
    }

    pub fn with_transform_context(mut self, f: TransformContextFn) -> Self {
        self.transform_context = Some(f);
        self
    }

    pub fn with_convert_to_llm(mut self, f: ConvertToLlmFn) -> Self {
        self.convert_to_llm = Some(f);
        self
    }

    pub fn with_permission(mut self, f: PermissionFunc) -> Self {
        self.permission = Some(f);
        self
    }

    pub fn with_steering_messages(mut self, f: MessageBatchFn) -> Self {
        self.get_steering_messages = Some(f);
        self
    }

    pub fn with_follow_up_messages(mut self, f: MessageBatchFn) -> Self {
        self.get_follow_up_messages = Some(f);
        self
    }

    pub fn with_events(mut self, events: EventChannelConfig) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn convert(&self, messages: &[AgentMessage]) -> Vec<Message> {
        match &self.convert_to_llm {
            Some(f) => f(messages),
            None => default_convert_to_llm(messages),
        }
    }

    pub(crate) fn steering(&self) -> Vec<AgentMessage> {
        self.get_steering_messages
            .as_ref()
            .map(|f| f())
            .unwrap_or_default()
    }

    pub(crate) fn follow_ups(&self) -> Vec<AgentMessage> {
        self.get_follow_up_messages
            .as_ref()
            .map(|f| f())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for LoopConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopConfig")
            .field("model", &self.model.name())
            .field("stream_fn", &self.stream_fn.is_some())
            .field("max_turns", &self.max_turns)
            .field("max_retries", &self.max_retries)
            .field("max_tool_errors", &self.max_tool_errors)
            .field("thinking", &self.thinking)
            .field("transform_context", &self.transform_context.is_some())
            .field("convert_to_llm", &self.convert_to_llm.is_some())
            .field("permission", &self.permission.is_some())
            .field("events", &self.events)
            .finish()
    }
}
