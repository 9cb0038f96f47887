//! Shared test utilities for the loop and agent tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use turnloop_core::{
    ChatModel, ContentBlock, Event, Message, ModelError, ModelRequest, ModelResult, ModelStream,
    Role, StopReason, StreamEvent, Tool, ToolCall, ToolContext, ToolError, Usage,
};

/// A model that replays a fixed script of replies, one per call.
///
/// Records every request it receives. Once the script runs out it answers
/// with a plain "done" message.
pub struct ScriptedModel {
    script: Mutex<VecDeque<ModelResult<Message>>>,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<ModelResult<Message>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(messages: Vec<Message>) -> Self {
        Self::new(messages.into_iter().map(Ok).collect())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: ModelRequest) -> ModelResult<Message> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Message::assistant("done")))
    }
}

/// A streaming-only model: each call replays the next scripted event list.
pub struct StreamScriptModel {
    attempts: Mutex<VecDeque<Vec<StreamEvent>>>,
}

impl StreamScriptModel {
    pub fn new(attempts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into()),
        }
    }
}

#[async_trait]
impl ChatModel for StreamScriptModel {
    fn name(&self) -> &str {
        "stream-script"
    }

    async fn generate(&self, _request: ModelRequest) -> ModelResult<Message> {
        Err(ModelError::NotConfigured("stream only".into()))
    }

    async fn generate_stream(&self, _request: ModelRequest) -> ModelResult<ModelStream> {
        let events = self.attempts.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.send(event).await;
        }
        Ok(rx)
    }
}

/// Streams `text` and then fails with [`transient`].
pub fn interrupted_stream(text: &str) -> Vec<StreamEvent> {
    let partial = Message::new(Role::Assistant).with_block(ContentBlock::text(text));
    vec![
        StreamEvent::Start {
            partial: Message::new(Role::Assistant),
        },
        StreamEvent::TextDelta {
            index: 0,
            delta: text.to_string(),
            partial,
        },
        StreamEvent::Error { error: transient() },
    ]
}

/// An assistant message requesting the given tool calls.
pub fn tool_call_message(calls: &[(&str, &str, Value)]) -> Message {
    let mut msg = Message::new(Role::Assistant).with_stop_reason(StopReason::ToolUse);
    for (id, name, args) in calls {
        msg = msg.with_block(ContentBlock::ToolCall(ToolCall::new(*id, *name, args.clone())));
    }
    msg
}

/// An assistant text reply carrying usage.
pub fn reply_with_usage(text: &str, input: u64, output: u64) -> Message {
    Message::assistant(text).with_usage(Usage {
        input,
        output,
        total: input + output,
        ..Usage::default()
    })
}

type ToolFn = dyn Fn(Value) -> Result<Value, ToolError> + Send + Sync;

/// A tool backed by a closure.
pub struct FnTool {
    name: String,
    f: Box<ToolFn>,
}

impl FnTool {
    pub fn new(
        name: &str,
        f: impl Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    ) -> Arc<dyn Tool> {
        Arc::new(Self {
            name: name.to_string(),
            f: Box::new(f),
        })
    }

    /// Adds `a` and `b`.
    pub fn add() -> Arc<dyn Tool> {
        Self::new("add", |args| {
            let a = args["a"].as_f64().ok_or_else(|| ToolError::InvalidArguments("a".into()))?;
            let b = args["b"].as_f64().ok_or_else(|| ToolError::InvalidArguments("b".into()))?;
            Ok(serde_json::json!(a + b))
        })
    }

    /// Always fails.
    pub fn failing(name: &str) -> Arc<dyn Tool> {
        let tool_name = name.to_string();
        Self::new(name, move |_| {
            Err(ToolError::ExecutionFailed {
                tool_name: tool_name.clone(),
                reason: "boom".into(),
            })
        })
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test tool"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(&self, _ctx: ToolContext, arguments: Value) -> Result<Value, ToolError> {
        (self.f)(arguments)
    }
}

/// Drain a loop's event channel to completion.
pub async fn collect_events(mut rx: mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

pub fn event_types(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::event_type).collect()
}

/// A retryable failure.
pub fn transient() -> ModelError {
    ModelError::Api {
        status_code: 503,
        message: "overloaded".into(),
    }
}
