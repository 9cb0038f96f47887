//! The agent execution loop.
//!
//! One invocation runs on its own task and reports everything through the
//! returned event channel:
//!
//! ```text
//! agent_start, turn_start
//!   (message_start/end for each prompt)
//!   loop:
//!     [turn_start]            (every turn after the first)
//!     message_start/end       (pending steering/follow-up messages)
//!     message_start, message_update*, message_end   (assistant)
//!     tool_exec_start, tool_exec_update*, tool_exec_end, message_start/end  (per call)
//!     turn_end
//! [turn_end, error]           (turn_end only if the failing turn was open)
//! agent_end
//! ```
//!
//! Every `turn_start` is paired with a `turn_end`. When a run fails inside a
//! turn, that turn is closed with a synthetic assistant error message before
//! the `error` event.
//!
//! The inner loop keeps turning while the model requests tools or messages
//! are waiting to be injected; the outer loop restarts when follow-up
//! messages are queued after the inner loop settles.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use turnloop_core::{
    AgentMessage, Event, EventSink, LoopError, Message, StopReason, ToolCall, ToolResult,
    event_channel,
};

use crate::context::{AgentContext, LoopConfig};
use crate::llm::call_llm_with_retry;
use crate::tool_exec::{ToolErrorCounts, execute_tool_calls};

/// Start a run with new prompt messages.
///
/// The prompts are appended to the context and echoed as message events
/// before the first model call. Must be called within a Tokio runtime.
pub fn agent_loop(
    prompts: Vec<AgentMessage>,
    context: AgentContext,
    config: LoopConfig,
    cancel: CancellationToken,
) -> mpsc::Receiver<Event> {
    let (sink, rx) = event_channel(config.events);
    let mut run = LoopRun::new(context, config, sink, cancel);

    tokio::spawn(async move {
        run.sink.emit(Event::AgentStart).await;
        run.start_turn().await;
        for prompt in prompts {
            run.append(prompt).await;
        }
        run.finish().await;
    });

    rx
}

/// Resume a run from existing history without adding a message.
///
/// Fails synchronously with [`LoopError::EmptyContext`] when there is no
/// history to continue from. Must be called within a Tokio runtime.
pub fn agent_loop_continue(
    context: AgentContext,
    config: LoopConfig,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<Event>, LoopError> {
    if context.messages.is_empty() {
        return Err(LoopError::EmptyContext);
    }

    let (sink, rx) = event_channel(config.events);
    let mut run = LoopRun::new(context, config, sink, cancel);

    tokio::spawn(async move {
        run.sink.emit(Event::AgentStart).await;
        run.start_turn().await;
        run.finish().await;
    });

    Ok(rx)
}

/// State owned by one loop invocation.
struct LoopRun {
    context: AgentContext,
    config: LoopConfig,
    sink: EventSink,
    cancel: CancellationToken,
    /// Everything appended during this invocation, for `agent_end`
    new_messages: Vec<AgentMessage>,
    tool_errors: ToolErrorCounts,
    turn: u32,
    /// `turn_start` emitted without its `turn_end` yet
    turn_open: bool,
}

impl LoopRun {
    fn new(
        context: AgentContext,
        config: LoopConfig,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            config,
            sink,
            cancel,
            new_messages: Vec::new(),
            tool_errors: ToolErrorCounts::new(),
            turn: 0,
            turn_open: false,
        }
    }

    async fn start_turn(&mut self) {
        self.sink.emit(Event::TurnStart { turn: self.turn }).await;
        self.turn_open = true;
    }

    async fn end_turn(&mut self, message: Message, tool_results: Vec<ToolResult>) {
        self.sink
            .emit(Event::TurnEnd {
                turn: self.turn,
                message,
                tool_results,
            })
            .await;
        self.turn_open = false;
        self.turn += 1;
    }

    /// Announce a message and append it to the context.
    async fn append(&mut self, message: AgentMessage) {
        self.sink
            .emit(Event::MessageStart {
                message: message.clone(),
            })
            .await;
        self.sink
            .emit(Event::MessageEnd {
                message: message.clone(),
            })
            .await;
        self.record(message);
    }

    /// Append a message whose events were already emitted.
    fn record(&mut self, message: AgentMessage) {
        self.context.messages.push(message.clone());
        self.new_messages.push(message);
    }

    /// Drive the loop to completion and close the event stream.
    async fn finish(mut self) {
        info!(
            model = self.config.model.name(),
            history = self.context.messages.len(),
            "Agent run started"
        );

        if let Err(error) = self.run_turns().await {
            match &error {
                LoopError::Aborted => info!(turns = self.turn, "Agent run aborted"),
                other => warn!(turns = self.turn, error = %other, "Agent run failed"),
            }
            if self.turn_open {
                let stop_reason = match &error {
                    LoopError::Aborted => StopReason::Aborted,
                    _ => StopReason::Error,
                };
                let message = Message::assistant_error(error.to_string(), stop_reason);
                self.end_turn(message, Vec::new()).await;
            }
            self.sink.emit(Event::Error { error }).await;
        }

        info!(
            turns = self.turn,
            appended = self.new_messages.len(),
            dropped_events = self.sink.dropped(),
            "Agent run finished"
        );
        let messages = std::mem::take(&mut self.new_messages);
        self.sink.emit(Event::AgentEnd { messages }).await;
    }

    async fn run_turns(&mut self) -> Result<(), LoopError> {
        let mut pending = self.config.steering();
        let mut has_more_tool_calls = true;

        loop {
            while has_more_tool_calls || !pending.is_empty() {
                if self.cancel.is_cancelled() {
                    return Err(LoopError::Aborted);
                }
                if self.turn >= self.config.max_turns {
                    return Err(LoopError::MaxTurns(self.config.max_turns));
                }

                // The first turn is opened by the entry point.
                if !self.turn_open {
                    self.start_turn().await;
                }
                debug!(turn = self.turn, pending = pending.len(), "Turn started");

                for message in std::mem::take(&mut pending) {
                    self.append(message).await;
                }

                let output =
                    call_llm_with_retry(&self.context, &self.config, &self.sink, &self.cancel)
                        .await?;
                let message = output.message;
                if !output.started {
                    self.sink
                        .emit(Event::MessageStart {
                            message: message.clone().into(),
                        })
                        .await;
                }
                self.sink
                    .emit(Event::MessageEnd {
                        message: message.clone().into(),
                    })
                    .await;
                self.record(message.clone().into());

                if matches!(
                    message.stop_reason,
                    Some(StopReason::Error | StopReason::Aborted)
                ) {
                    warn!(
                        turn = self.turn,
                        stop_reason = ?message.stop_reason,
                        error = message.error_message().unwrap_or_default(),
                        "Model ended the turn with a terminal stop reason"
                    );
                    self.end_turn(message, Vec::new()).await;
                    return Ok(());
                }

                let calls: Vec<ToolCall> = message.tool_calls().into_iter().cloned().collect();
                has_more_tool_calls = !calls.is_empty();

                let mut tool_results = Vec::new();
                let mut interrupted = Vec::new();
                if has_more_tool_calls {
                    debug!(turn = self.turn, calls = calls.len(), "Executing tool calls");
                    let batch = execute_tool_calls(
                        &self.context.tools,
                        &calls,
                        &self.config,
                        &mut self.tool_errors,
                        &self.sink,
                        &self.cancel,
                    )
                    .await;
                    for result_message in batch.messages {
                        self.record(result_message.into());
                    }
                    tool_results = batch.results;
                    interrupted = batch.steering;
                }

                self.end_turn(message, tool_results).await;

                pending = if interrupted.is_empty() {
                    self.config.steering()
                } else {
                    interrupted
                };
            }

            let follow_ups = self.config.follow_ups();
            if follow_ups.is_empty() {
                return Ok(());
            }
            debug!(count = follow_ups.len(), "Continuing with follow-up messages");
            pending = follow_ups;
        }
    }
}
