//! Sequential execution of one turn's tool calls.
//!
//! Calls run one at a time in the order the model emitted them. Every call,
//! including denied, unknown, short-circuited and skipped ones, produces a
//! `tool_exec_start`/`tool_exec_end` pair and exactly one tool-result message,
//! so history never holds an unanswered call.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use turnloop_core::{
    AgentMessage, Event, EventSink, Message, ProgressReporter, ToolCall, ToolContext, ToolError,
    ToolRegistry, ToolResult,
};

use crate::context::LoopConfig;

/// Result text for calls skipped because a steering message arrived.
pub const SKIPPED_FOR_STEERING: &str = "Skipped due to queued user message.";

/// Result text for calls skipped because the run was aborted.
pub const SKIPPED_FOR_ABORT: &str = "Skipped: run aborted.";

/// Consecutive-failure counters, keyed by tool name. Lives for one run.
pub(crate) type ToolErrorCounts = HashMap<String, u32>;

/// Everything one tool batch produced.
#[derive(Debug, Default)]
pub(crate) struct ToolBatch {
    pub results: Vec<ToolResult>,
    /// One tool-result message per call, in call order
    pub messages: Vec<Message>,
    /// Steering messages that interrupted the batch
    pub steering: Vec<AgentMessage>,
}

impl ToolBatch {
    async fn record(&mut self, result: ToolResult, sink: &EventSink) {
        let message = Message::tool_result(&result);
        sink.emit(Event::MessageStart {
            message: message.clone().into(),
        })
        .await;
        sink.emit(Event::MessageEnd {
            message: message.clone().into(),
        })
        .await;
        self.results.push(result);
        self.messages.push(message);
    }
}

/// Execute a turn's tool calls in order.
pub(crate) async fn execute_tool_calls(
    tools: &ToolRegistry,
    calls: &[ToolCall],
    config: &LoopConfig,
    error_counts: &mut ToolErrorCounts,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> ToolBatch {
    let mut batch = ToolBatch::default();

    for (i, call) in calls.iter().enumerate() {
        let result = run_call(tools, call, config, error_counts, sink, cancel).await;
        batch.record(result, sink).await;

        let remaining = &calls[i + 1..];
        if cancel.is_cancelled() {
            skip_calls(&mut batch, tools, remaining, SKIPPED_FOR_ABORT, sink).await;
            break;
        }

        let steering = config.steering();
        if !steering.is_empty() {
            info!(
                queued = steering.len(),
                skipped = remaining.len(),
                "Steering message arrived, skipping remaining tool calls"
            );
            skip_calls(&mut batch, tools, remaining, SKIPPED_FOR_STEERING, sink).await;
            batch.steering = steering;
            break;
        }
    }

    batch
}

fn label_for(tools: &ToolRegistry, call: &ToolCall) -> String {
    tools
        .get(&call.name)
        .map(|t| t.label().to_string())
        .unwrap_or_else(|| call.name.clone())
}

async fn emit_start(tools: &ToolRegistry, call: &ToolCall, sink: &EventSink) {
    sink.emit(Event::ToolExecStart {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        label: label_for(tools, call),
        arguments: call.arguments.clone(),
    })
    .await;
}

async fn emit_end(call: &ToolCall, result: &ToolResult, sink: &EventSink) {
    sink.emit(Event::ToolExecEnd {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result: result.clone(),
    })
    .await;
}

async fn skip_calls(
    batch: &mut ToolBatch,
    tools: &ToolRegistry,
    calls: &[ToolCall],
    reason: &str,
    sink: &EventSink,
) {
    for call in calls {
        emit_start(tools, call, sink).await;
        let result = ToolResult::error(&call.id, reason);
        emit_end(call, &result, sink).await;
        batch.record(result, sink).await;
    }
}

async fn run_call(
    tools: &ToolRegistry,
    call: &ToolCall,
    config: &LoopConfig,
    error_counts: &mut ToolErrorCounts,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> ToolResult {
    emit_start(tools, call, sink).await;
    let result = invoke(tools, call, config, error_counts, sink, cancel).await;
    emit_end(call, &result, sink).await;
    result
}

async fn invoke(
    tools: &ToolRegistry,
    call: &ToolCall,
    config: &LoopConfig,
    error_counts: &mut ToolErrorCounts,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> ToolResult {
    // Circuit breaker: the tool is not invoked once it is open.
    if config.max_tool_errors > 0 {
        let failures = error_counts.get(&call.name).copied().unwrap_or(0);
        if failures >= config.max_tool_errors {
            warn!(tool = %call.name, failures, "Circuit breaker open, not invoking tool");
            return ToolResult::error(
                &call.id,
                format!(
                    "Tool '{}' disabled after {failures} consecutive failures",
                    call.name
                ),
            );
        }
    }

    // Denials are policy, not malfunction: never counted.
    if let Some(permission) = &config.permission {
        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled(call.name.clone())),
            verdict = permission(call.clone(), cancel.clone()) => verdict,
        };
        if let Err(e) = verdict {
            info!(tool = %call.name, reason = %e, "Tool call denied");
            return ToolResult::error(&call.id, e.to_string());
        }
    }

    let Some(tool) = tools.get(&call.name) else {
        warn!(tool = %call.name, "Model called an unknown tool");
        return ToolResult::error(&call.id, ToolError::NotFound(call.name.clone()).to_string());
    };

    let ctx = ToolContext {
        tool_call_id: call.id.clone(),
        cancel: cancel.clone(),
        progress: ProgressReporter::new(&call.id, &call.name, sink.clone()),
    };

    let start = std::time::Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ToolError::Cancelled(call.name.clone())),
        outcome = tool.execute(ctx, call.arguments.clone()) => outcome,
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(value) => {
            debug!(tool = %call.name, duration_ms, "Tool succeeded");
            error_counts.insert(call.name.clone(), 0);
            ToolResult::success(&call.id, value)
        }
        Err(e @ ToolError::Cancelled(_)) => ToolResult::error(&call.id, e.to_string()),
        Err(e) => {
            let failures = error_counts.entry(call.name.clone()).or_insert(0);
            *failures += 1;
            warn!(tool = %call.name, error = %e, failures = *failures, duration_ms, "Tool failed");
            ToolResult::error(&call.id, e.to_string())
        }
    }
}
