//! ChatModel trait: the abstraction over LLM backends.
//!
//! A model knows how to turn a list of provider-ready messages into an
//! assistant message, either in one blocking call or as a stream of
//! fine-grained content events. Transport and request mapping live in the
//! implementations; the loop only sees this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent::ThinkingLevel;
use crate::error::{ModelError, ModelResult};
use crate::message::{ContentBlock, ContentKind, Message};

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Per-call generation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default)]
    pub thinking: ThinkingLevel,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Everything one model call needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Provider-ready messages, system prompt first when set
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default)]
    pub options: GenerateOptions,
}

/// One fine-grained event from a streaming model call.
///
/// Content events carry the partially assembled message so far; `Done`
/// carries the final message.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start { partial: Message },
    TextStart { index: usize, partial: Message },
    TextDelta { index: usize, delta: String, partial: Message },
    TextEnd { index: usize, partial: Message },
    ThinkingStart { index: usize, partial: Message },
    ThinkingDelta { index: usize, delta: String, partial: Message },
    ThinkingEnd { index: usize, partial: Message },
    ToolCallStart { index: usize, partial: Message },
    ToolCallDelta { index: usize, delta: String, partial: Message },
    ToolCallEnd { index: usize, partial: Message },
    Done { message: Message },
    Error { error: ModelError },
}

impl StreamEvent {
    /// The partial message carried by a content event.
    pub fn partial(&self) -> Option<&Message> {
        match self {
            Self::Start { partial }
            | Self::TextStart { partial, .. }
            | Self::TextDelta { partial, .. }
            | Self::TextEnd { partial, .. }
            | Self::ThinkingStart { partial, .. }
            | Self::ThinkingDelta { partial, .. }
            | Self::ThinkingEnd { partial, .. }
            | Self::ToolCallStart { partial, .. }
            | Self::ToolCallDelta { partial, .. }
            | Self::ToolCallEnd { partial, .. } => Some(partial),
            Self::Done { .. } | Self::Error { .. } => None,
        }
    }

    /// `(kind, index, delta)` for delta events.
    pub fn delta(&self) -> Option<(ContentKind, usize, &str)> {
        match self {
            Self::TextDelta { index, delta, .. } => Some((ContentKind::Text, *index, delta.as_str())),
            Self::ThinkingDelta { index, delta, .. } => {
                Some((ContentKind::Thinking, *index, delta.as_str()))
            }
            Self::ToolCallDelta { index, delta, .. } => {
                Some((ContentKind::ToolCall, *index, delta.as_str()))
            }
            _ => None,
        }
    }
}

/// Receiving half of a model stream.
pub type ModelStream = mpsc::Receiver<StreamEvent>;

/// The core ChatModel trait.
///
/// Every backend implements this. The loop calls `generate_stream()` and falls
/// back to `generate()` when stream setup fails.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider name (e.g. "anthropic", "openai"), used for per-provider key lookup.
    fn name(&self) -> &str;

    /// Whether this model accepts tool definitions.
    fn supports_tools(&self) -> bool {
        true
    }

    /// Whether an error from this model is worth retrying.
    fn is_retryable(&self, error: &ModelError) -> bool {
        error.is_retryable()
    }

    /// Send a request and get the complete assistant message.
    async fn generate(&self, request: ModelRequest) -> ModelResult<Message>;

    /// Send a request and get a stream of content events.
    ///
    /// Default implementation calls `generate()` and replays the result as
    /// one start/delta/end triple per content block followed by `Done`. A
    /// failed `generate()` is delivered in-stream as `StreamEvent::Error`,
    /// so stream setup itself never fails.
    async fn generate_stream(&self, request: ModelRequest) -> ModelResult<ModelStream> {
        let events = match self.generate(request).await {
            Ok(message) => replay_as_stream(&message),
            Err(error) => vec![StreamEvent::Error { error }],
        };
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.send(event).await;
        }
        Ok(rx)
    }
}

/// Decompose a finished message into the stream events a provider would emit.
pub fn replay_as_stream(message: &Message) -> Vec<StreamEvent> {
    let mut events = Vec::with_capacity(message.content.len() * 3 + 2);
    let mut partial = Message {
        content: Vec::new(),
        ..message.clone()
    };
    events.push(StreamEvent::Start {
        partial: partial.clone(),
    });

    for (index, block) in message.content.iter().enumerate() {
        partial.content.push(block.clone());
        let snapshot = partial.clone();
        match block {
            ContentBlock::Text { text } => {
                events.push(StreamEvent::TextStart { index, partial: snapshot.clone() });
                events.push(StreamEvent::TextDelta {
                    index,
                    delta: text.clone(),
                    partial: snapshot.clone(),
                });
                events.push(StreamEvent::TextEnd { index, partial: snapshot });
            }
            ContentBlock::Thinking { thinking } => {
                events.push(StreamEvent::ThinkingStart { index, partial: snapshot.clone() });
                events.push(StreamEvent::ThinkingDelta {
                    index,
                    delta: thinking.clone(),
                    partial: snapshot.clone(),
                });
                events.push(StreamEvent::ThinkingEnd { index, partial: snapshot });
            }
            ContentBlock::ToolCall(call) => {
                events.push(StreamEvent::ToolCallStart { index, partial: snapshot.clone() });
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    delta: call.arguments.to_string(),
                    partial: snapshot.clone(),
                });
                events.push(StreamEvent::ToolCallEnd { index, partial: snapshot });
            }
            // Images have no incremental form.
            ContentBlock::Image { .. } => {}
        }
    }

    events.push(StreamEvent::Done {
        message: message.clone(),
    });
    events
}
