//! Single model call: context pipeline, streaming decomposition and retry.
//!
//! One call runs the history through the transform hook, converts it to
//! provider messages, repairs tool-call pairing, and then either invokes the
//! configured stream override or consumes the model's stream. Fine-grained
//! stream events become `message_start` (once, on first content) and
//! `message_update` (once per delta) events.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use turnloop_core::{
    Event, EventSink, GenerateOptions, LoopError, Message, MessageDelta, ModelError, ModelRequest,
    StopReason, StreamEvent,
};

use crate::context::{AgentContext, LoopConfig};
use crate::repair::repair_message_sequence;

/// First retry delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on any retry delay, including provider hints.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The outcome of one model call.
#[derive(Debug)]
pub(crate) struct LlmOutput {
    pub message: Message,
    /// Whether `message_start` was already emitted while streaming
    pub started: bool,
}

/// Delay before retry `attempt` (0-indexed).
///
/// A provider retry-after hint wins over the exponential schedule; both are
/// capped at [`MAX_BACKOFF`].
pub fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(hint) = retry_after {
        return hint.min(MAX_BACKOFF);
    }
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Build the provider request for the current context.
pub(crate) async fn build_request(
    context: &AgentContext,
    config: &LoopConfig,
    cancel: &CancellationToken,
) -> Result<ModelRequest, LoopError> {
    let history = match &config.transform_context {
        Some(transform) => tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoopError::Aborted),
            result = transform(context.messages.clone(), cancel.clone()) => {
                result.map_err(|e| LoopError::Transform(e.to_string()))?
            }
        },
        None => context.messages.clone(),
    };

    let mut messages = repair_message_sequence(config.convert(&history));
    if !context.system_prompt.is_empty() {
        messages.insert(0, Message::system(context.system_prompt.as_str()));
    }

    let tools = if config.model.supports_tools() {
        context.tools.definitions()
    } else {
        Vec::new()
    };

    Ok(ModelRequest {
        messages,
        tools,
        options: GenerateOptions {
            thinking: config.thinking,
            ..GenerateOptions::default()
        },
    })
}

/// Run one model call without retry.
pub(crate) async fn call_llm(
    context: &AgentContext,
    config: &LoopConfig,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<LlmOutput, LoopError> {
    let request = build_request(context, config, cancel).await?;
    debug!(
        model = config.model.name(),
        messages = request.messages.len(),
        tools = request.tools.len(),
        "Calling model"
    );

    if let Some(stream_fn) = &config.stream_fn {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoopError::Aborted),
            result = stream_fn(request, cancel.clone()) => result?,
        };
        return consume_stream(&mut stream, sink, cancel).await;
    }

    let setup = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(LoopError::Aborted),
        result = config.model.generate_stream(request.clone()) => result,
    };

    match setup {
        Ok(mut stream) => consume_stream(&mut stream, sink, cancel).await,
        Err(error) => {
            warn!(
                model = config.model.name(),
                error = %error,
                "Stream setup failed, falling back to a blocking call"
            );
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LoopError::Aborted),
                result = config.model.generate(request) => result?,
            };
            Ok(LlmOutput {
                message,
                started: false,
            })
        }
    }
}

/// Turn a model stream into message events and the final message.
async fn consume_stream(
    stream: &mut mpsc::Receiver<StreamEvent>,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<LlmOutput, LoopError> {
    let mut started = false;
    let mut last_partial: Option<Message> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoopError::Aborted),
            next = stream.recv() => next,
        };
        let Some(event) = next else { break };

        let event = match event {
            StreamEvent::Done { message } => return Ok(LlmOutput { message, started }),
            StreamEvent::Error { error } => return Err(error.into()),
            content => content,
        };
        let Some(partial) = event.partial().cloned() else {
            continue;
        };

        // The initial empty partial is recorded but is not content yet.
        if !started && !matches!(event, StreamEvent::Start { .. }) {
            sink.emit(Event::MessageStart {
                message: partial.clone().into(),
            })
            .await;
            started = true;
        }

        if let Some((kind, index, delta)) = event.delta() {
            sink.emit(Event::MessageUpdate {
                message: partial.clone().into(),
                delta: MessageDelta {
                    kind,
                    index,
                    delta: delta.to_string(),
                },
            })
            .await;
        }

        last_partial = Some(partial);
    }

    match last_partial.filter(|m| !m.is_empty()) {
        Some(mut message) => {
            warn!(
                blocks = message.content.len(),
                "Stream closed without a final message, using last partial"
            );
            if message.stop_reason.is_none() {
                message.stop_reason = Some(if message.has_tool_calls() {
                    StopReason::ToolUse
                } else {
                    StopReason::Stop
                });
            }
            Ok(LlmOutput { message, started })
        }
        None => Err(ModelError::StreamInterrupted("stream closed before any content".into()).into()),
    }
}

/// Run one model call, retrying transient failures with backoff.
///
/// A partial message streamed by a failed attempt is abandoned: the `retry`
/// event stands in for its `message_end`.
pub(crate) async fn call_llm_with_retry(
    context: &AgentContext,
    config: &LoopConfig,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<LlmOutput, LoopError> {
    let mut attempt: u32 = 0;
    loop {
        let error = match call_llm(context, config, sink, cancel).await {
            Ok(output) => return Ok(output),
            Err(LoopError::Model(error))
                if attempt < config.max_retries && config.model.is_retryable(&error) =>
            {
                error
            }
            Err(other) => return Err(other),
        };

        let delay = backoff_delay(attempt, error.retry_after());
        attempt += 1;
        let delay_ms = delay.as_millis() as u64;
        warn!(
            attempt,
            max_retries = config.max_retries,
            delay_ms,
            error = %error,
            "Model call failed, retrying"
        );
        sink.emit(Event::Retry {
            attempt,
            max_retries: config.max_retries,
            delay_ms,
            error: error.to_string(),
        })
        .await;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoopError::Aborted),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
