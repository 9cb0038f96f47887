//! A [`ChatModel`] that replays scripted assistant turns.
//!
//! Script format:
//!
//! ```json
//! {
//!   "turns": [
//!     { "error": { "status": 503, "message": "overloaded" } },
//!     { "tool_calls": [{ "id": "call_1", "name": "add", "arguments": { "a": 2, "b": 3 } }] },
//!     { "text": "2 + 3 = 5", "usage": { "input": 40, "output": 8, "total": 48 } }
//!   ]
//! }
//! ```
//!
//! Each model call consumes one turn. Text is streamed word by word.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use turnloop_core::model::replay_as_stream;
use turnloop_core::{
    ChatModel, ContentBlock, Message, ModelError, ModelRequest, ModelResult, ModelStream, Role,
    StopReason, StreamEvent, ToolCall, Usage,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayScript {
    pub turns: Vec<ReplayTurn>,
}

/// One scripted model response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayTurn {
    pub thinking: Option<String>,
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    /// Fail this call with an API error instead of answering
    pub error: Option<ReplayError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayError {
    pub status: u16,
    pub message: String,
}

impl ReplayTurn {
    fn into_result(self) -> ModelResult<Message> {
        if let Some(error) = self.error {
            return Err(ModelError::Api {
                status_code: error.status,
                message: error.message,
            });
        }

        let mut message = Message::new(Role::Assistant);
        if let Some(thinking) = self.thinking {
            message = message.with_block(ContentBlock::thinking(thinking));
        }
        if let Some(text) = self.text {
            message = message.with_block(ContentBlock::text(text));
        }
        let stop = if self.tool_calls.is_empty() {
            StopReason::Stop
        } else {
            StopReason::ToolUse
        };
        for call in self.tool_calls {
            message = message.with_block(ContentBlock::ToolCall(call));
        }
        if let Some(usage) = self.usage {
            message = message.with_usage(usage);
        }
        Ok(message.with_stop_reason(stop))
    }
}

pub struct ReplayModel {
    turns: Mutex<VecDeque<ReplayTurn>>,
}

impl ReplayModel {
    pub fn new(script: ReplayScript) -> Self {
        Self {
            turns: Mutex::new(script.turns.into()),
        }
    }

    /// Load a script from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay script {}", path.display()))?;
        let script: ReplayScript = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse replay script {}", path.display()))?;
        Ok(Self::new(script))
    }

    pub fn remaining(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ReplayTurn>> {
        self.turns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_turn(&self) -> ModelResult<Message> {
        match self.lock().pop_front() {
            Some(turn) => turn.into_result(),
            None => Err(ModelError::InvalidResponse(
                "replay script exhausted".into(),
            )),
        }
    }
}

#[async_trait]
impl ChatModel for ReplayModel {
    fn name(&self) -> &str {
        "replay"
    }

    async fn generate(&self, _request: ModelRequest) -> ModelResult<Message> {
        self.next_turn()
    }

    async fn generate_stream(&self, _request: ModelRequest) -> ModelResult<ModelStream> {
        let events = match self.next_turn() {
            Ok(message) => word_by_word(replay_as_stream(&message)),
            Err(error) => vec![StreamEvent::Error { error }],
        };
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.send(event).await;
        }
        Ok(rx)
    }
}

/// Split every text delta into one delta per word.
///
/// Each split delta carries a partial whose text block holds only the words
/// streamed so far.
fn word_by_word(events: Vec<StreamEvent>) -> Vec<StreamEvent> {
    let mut out = Vec::with_capacity(events.len());
    for event in events {
        let StreamEvent::TextDelta {
            index,
            delta,
            partial,
        } = event
        else {
            out.push(event);
            continue;
        };

        let mut sent = String::new();
        for word in delta.split_inclusive(' ') {
            sent.push_str(word);
            let mut snapshot = partial.clone();
            if let Some(block) = snapshot.content.get_mut(index) {
                *block = ContentBlock::text(sent.clone());
            }
            out.push(StreamEvent::TextDelta {
                index,
                delta: word.to_string(),
                partial: snapshot,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn script(value: serde_json::Value) -> ReplayModel {
        ReplayModel::new(serde_json::from_value(value).unwrap())
    }

    async fn drain(mut rx: ModelStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn turns_are_consumed_in_order() {
        let model = script(json!({
            "turns": [
                { "tool_calls": [{ "id": "c1", "name": "add", "arguments": { "a": 1, "b": 2 } }] },
                { "text": "3", "usage": { "input": 10, "output": 1, "total": 11 } }
            ]
        }));

        let first = model.generate(ModelRequest::default()).await.unwrap();
        assert_eq!(first.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(first.tool_calls()[0].name, "add");

        let second = model.generate(ModelRequest::default()).await.unwrap();
        assert_eq!(second.text(), "3");
        assert_eq!(second.usage.unwrap().total, 11);
        assert_eq!(model.remaining(), 0);

        let err = model.generate(ModelRequest::default()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn scripted_error_is_retryable_api_failure() {
        let model = script(json!({
            "turns": [{ "error": { "status": 503, "message": "overloaded" } }]
        }));
        let err = model.generate(ModelRequest::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "API request failed: overloaded (status: 503)"
        );
    }

    #[tokio::test]
    async fn text_streams_one_word_per_delta() {
        let model = script(json!({ "turns": [{ "text": "two plus three" }] }));
        let events = drain(model.generate_stream(ModelRequest::default()).await.unwrap()).await;

        let deltas: Vec<(&str, String)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta, partial, .. } => {
                    Some((delta.as_str(), partial.text()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            deltas,
            vec![
                ("two ", "two ".to_string()),
                ("plus ", "two plus ".to_string()),
                ("three", "two plus three".to_string()),
            ]
        );
        match events.last() {
            Some(StreamEvent::Done { message }) => assert_eq!(message.text(), "two plus three"),
            other => panic!("Expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_reports_scripted_error() {
        let model = script(json!({
            "turns": [{ "error": { "status": 500, "message": "boom" } }]
        }));
        let events = drain(model.generate_stream(ModelRequest::default()).await.unwrap()).await;
        assert!(matches!(events.as_slice(), [StreamEvent::Error { .. }]));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ReplayModel::load(Path::new("/nonexistent/replay.json"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to read replay script"));
    }
}
