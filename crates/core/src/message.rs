//! Message and content domain types.
//!
//! These are the value objects that flow through the whole loop:
//! prompt → model call → assistant message → tool calls → tool results → next call.
//! A [`Message`] is an ordered list of [`ContentBlock`]s; once appended to a
//! history it is never mutated again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use uuid::Uuid;

const META_TOOL_CALL_ID: &str = "tool_call_id";
const META_IS_ERROR: &str = "is_error";
const META_ERROR: &str = "error";

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID, echoed back by the matching [`ToolResult`]
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as an opaque JSON value
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result answers
    pub tool_call_id: String,

    /// Output as an opaque JSON value
    pub content: serde_json::Value,

    /// Whether the call failed (error, denial, breaker, skip)
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content,
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: serde_json::Value::String(message.into()),
            is_error: true,
        }
    }

    /// The content rendered as plain text for the model.
    pub fn text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One typed piece of message content.
///
/// Exactly one payload exists per block; block order defines replay order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolCall(ToolCall),
    /// Base64-encoded image data
    Image { data: String, mime_type: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Thinking { .. } => ContentKind::Thinking,
            Self::ToolCall(_) => ContentKind::ToolCall,
            Self::Image { .. } => ContentKind::Image,
        }
    }
}

/// The tag of a [`ContentBlock`], used by streaming deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentKind {
    Text,
    Thinking,
    ToolCall,
    Image,
}

/// Additive token ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub total: u64,
}

impl Usage {
    /// Field-wise sum, saturating at `u64::MAX`.
    pub fn add(&self, other: &Usage) -> Usage {
        Usage {
            input: self.input.saturating_add(other.input),
            output: self.output.saturating_add(other.output),
            cache_read: self.cache_read.saturating_add(other.cache_read),
            cache_write: self.cache_write.saturating_add(other.cache_write),
            total: self.total.saturating_add(other.total),
        }
    }
}

impl AddAssign<&Usage> for Usage {
    fn add_assign(&mut self, rhs: &Usage) {
        *self = self.add(rhs);
    }
}

/// A single provider-ready message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// Ordered content blocks
    #[serde(default)]
    pub content: Vec<ContentBlock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Free-form metadata (carries `tool_call_id`/`is_error` for tool results)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create an empty message with the given role.
    pub fn new(role: Role) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: Vec::new(),
            stop_reason: None,
            usage: None,
            metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User).with_block(ContentBlock::text(text))
    }

    /// Create a new assistant text message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant)
            .with_block(ContentBlock::text(text))
            .with_stop_reason(StopReason::Stop)
    }

    /// Create a new system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System).with_block(ContentBlock::text(text))
    }

    /// Create a tool-result message answering one tool call.
    pub fn tool_result(result: &ToolResult) -> Self {
        let mut msg = Self::new(Role::Tool).with_block(ContentBlock::text(result.text()));
        msg.metadata.insert(
            META_TOOL_CALL_ID.into(),
            serde_json::Value::String(result.tool_call_id.clone()),
        );
        msg.metadata
            .insert(META_IS_ERROR.into(), serde_json::Value::Bool(result.is_error));
        msg
    }

    /// Create a terminal assistant message describing a failure.
    pub fn assistant_error(error: impl Into<String>, stop_reason: StopReason) -> Self {
        let error = error.into();
        let mut msg = Self::new(Role::Assistant)
            .with_block(ContentBlock::text(error.clone()))
            .with_stop_reason(stop_reason);
        msg.metadata
            .insert(META_ERROR.into(), serde_json::Value::String(error));
        msg
    }

    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.content.push(block);
        self
    }

    pub fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Concatenation of every text block, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Thinking { .. }
                | ContentBlock::ToolCall(_)
                | ContentBlock::Image { .. } => None,
            })
            .collect()
    }

    /// Concatenation of every thinking block, in order.
    pub fn thinking(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking { thinking } => Some(thinking.as_str()),
                ContentBlock::Text { .. } | ContentBlock::ToolCall(_) | ContentBlock::Image { .. } => {
                    None
                }
            })
            .collect()
    }

    /// Every tool call, in emission order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall(call) => Some(call),
                ContentBlock::Text { .. } | ContentBlock::Thinking { .. } | ContentBlock::Image { .. } => {
                    None
                }
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall(_)))
    }

    /// "Empty" means zero content blocks.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// For tool-result messages: the call this message answers.
    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata.get(META_TOOL_CALL_ID).and_then(|v| v.as_str())
    }

    /// For tool-result messages: whether the result is an error.
    pub fn is_error(&self) -> bool {
        self.metadata
            .get(META_IS_ERROR)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Error text attached to an error/aborted assistant turn.
    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get(META_ERROR).and_then(|v| v.as_str())
    }
}

/// An application-defined message variant.
///
/// Flows through history and events but is dropped before reaching the model
/// by the default conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMessage {
    /// Application tag, e.g. `"notice"`
    pub kind: String,
    pub role: Role,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl CustomMessage {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            role: Role::User,
            text: text.into(),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }
}

/// Anything that can live in an agent's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum AgentMessage {
    Llm(Message),
    Custom(CustomMessage),
}

impl AgentMessage {
    pub fn role(&self) -> Role {
        match self {
            Self::Llm(m) => m.role,
            Self::Custom(c) => c.role,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Llm(m) => m.timestamp,
            Self::Custom(c) => c.timestamp,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::Llm(m) => m.text(),
            Self::Custom(c) => c.text.clone(),
        }
    }

    pub fn thinking(&self) -> String {
        match self {
            Self::Llm(m) => m.thinking(),
            Self::Custom(_) => String::new(),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        match self {
            Self::Llm(m) => m.has_tool_calls(),
            Self::Custom(_) => false,
        }
    }

    /// The provider-ready message, if this is one.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Llm(m) => Some(m),
            Self::Custom(_) => None,
        }
    }

    /// Whether this carries no content at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Llm(m) => m.is_empty(),
            Self::Custom(c) => c.text.is_empty() && c.data.is_null(),
        }
    }
}

impl From<Message> for AgentMessage {
    fn from(message: Message) -> Self {
        Self::Llm(message)
    }
}

impl From<CustomMessage> for AgentMessage {
    fn from(message: CustomMessage) -> Self {
        Self::Custom(message)
    }
}
