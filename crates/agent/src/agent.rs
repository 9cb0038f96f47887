//! Stateful agent wrapper.
//!
//! [`Agent`] owns the conversation history, the configuration that every
//! run is built from, and the steering/follow-up queues. It allows at most
//! one active run. Each run works on a snapshot of the configuration, so
//! `set_*` calls during a run only affect the next one.
//!
//! All mutable state sits behind one mutex. The per-run consumer task is the
//! only writer of history, the streaming message, the pending tool-call set
//! and cumulative usage; it applies each loop event under the lock, then
//! calls listeners with the lock released.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use turnloop_config::AgentSettings;
use turnloop_core::{
    AgentMessage, ChatModel, Event, EventBus, EventChannelConfig, LoopError, Message,
    PermissionFunc, QueueMode, Role, StopReason, ThinkingLevel, Tool, ToolRegistry, Usage,
};

use crate::context::{
    AgentContext, ConvertToLlmFn, DEFAULT_MAX_TURNS, LoopConfig, MessageBatchFn, StreamFn,
    TransformContextFn,
};
use crate::loop_runner::{agent_loop, agent_loop_continue};
use crate::queue::MessageQueue;

/// Handle returned by [`Agent::subscribe`].
pub type SubscriptionId = u64;

/// Synchronous event listener.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Errors returned by [`Agent`] entry points.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent is already running")]
    AlreadyRunning,

    #[error("nothing to continue: history ends with an assistant turn and no messages are queued")]
    NothingToContinue,

    #[error(transparent)]
    Loop(#[from] LoopError),
}

/// A point-in-time copy of the agent's observable state.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub system_prompt: String,
    pub model: String,
    pub thinking_level: ThinkingLevel,
    pub tools: Vec<String>,
    pub messages: Vec<AgentMessage>,
    pub is_running: bool,
    /// The message currently being streamed, if any
    pub stream_message: Option<AgentMessage>,
    /// Tool calls started but not yet finished
    pub pending_tool_calls: BTreeSet<String>,
    /// Error text of the last failed run
    pub error: Option<String>,
    pub total_usage: Usage,
}

/// Configuration applied to every run.
#[derive(Clone)]
struct Settings {
    system_prompt: String,
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    thinking: ThinkingLevel,
    max_turns: u32,
    max_retries: u32,
    max_tool_errors: u32,
    stream_fn: Option<StreamFn>,
    transform_context: Option<TransformContextFn>,
    convert_to_llm: Option<ConvertToLlmFn>,
    permission: Option<PermissionFunc>,
    events: EventChannelConfig,
}

struct Inner {
    settings: Settings,
    messages: Vec<AgentMessage>,
    steering: MessageQueue,
    follow_ups: MessageQueue,
    running: bool,
    cancel: Option<CancellationToken>,
    stream_message: Option<AgentMessage>,
    pending_tool_calls: BTreeSet<String>,
    error: Option<String>,
    total_usage: Usage,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_listener_id: SubscriptionId,
}

impl Inner {
    /// Apply one loop event to the agent state.
    fn apply(&mut self, event: &Event) {
        match event {
            Event::MessageStart { message } | Event::MessageUpdate { message, .. } => {
                self.stream_message = Some(message.clone());
            }
            Event::MessageEnd { message } => {
                self.stream_message = None;
                if let AgentMessage::Llm(m) = message {
                    if m.role == Role::Assistant {
                        if let Some(usage) = &m.usage {
                            self.total_usage += usage;
                        }
                        if let Some(error) = m.error_message() {
                            self.error = Some(error.to_string());
                        }
                    }
                }
                self.messages.push(message.clone());
            }
            Event::ToolExecStart { tool_call_id, .. } => {
                self.pending_tool_calls.insert(tool_call_id.clone());
            }
            Event::ToolExecEnd { tool_call_id, .. } => {
                self.pending_tool_calls.remove(tool_call_id);
            }
            Event::Error { error } => {
                self.flush_partial();
                let stop_reason = match error {
                    LoopError::Aborted => StopReason::Aborted,
                    _ => StopReason::Error,
                };
                let text = error.to_string();
                self.messages
                    .push(Message::assistant_error(text.clone(), stop_reason).into());
                self.error = Some(text);
            }
            // An abandoned attempt never reaches history.
            Event::Retry { .. } | Event::AgentEnd { .. } => {
                self.stream_message = None;
            }
            Event::AgentStart
            | Event::TurnStart { .. }
            | Event::ToolExecUpdate { .. }
            | Event::TurnEnd { .. } => {}
        }
    }

    /// Move a streamed-but-never-finalized message into history.
    fn flush_partial(&mut self) {
        if let Some(partial) = self.stream_message.take() {
            if !partial.is_empty() {
                debug!("Flushing partial message into history");
                self.messages.push(partial);
            }
        }
    }

    fn listeners(&self) -> Vec<Listener> {
        self.listeners.iter().map(|(_, l)| l.clone()).collect()
    }
}

struct Shared {
    state: Mutex<Inner>,
    running: watch::Sender<bool>,
    bus: EventBus,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset run-scoped fields once the event channel is closed.
    fn finish_run(&self) {
        let mut inner = self.lock();
        inner.flush_partial();
        inner.running = false;
        inner.cancel = None;
        inner.pending_tool_calls.clear();
        self.running.send_replace(false);
    }
}

/// The stateful agent.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Agent {
    shared: Arc<Shared>,
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    settings: Settings,
    messages: Vec<AgentMessage>,
    steering_mode: QueueMode,
    follow_up_mode: QueueMode,
}

impl AgentBuilder {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.settings.system_prompt = prompt.into();
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.settings.tools.register(tool);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        for tool in tools {
            self.settings.tools.register(tool);
        }
        self
    }

    /// Seed the history.
    pub fn with_messages(mut self, messages: Vec<AgentMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_thinking(mut self, level: ThinkingLevel) -> Self {
        self.settings.thinking = level;
        self
    }

    pub fn with_max_turns(mut self, max: u32) -> Self {
        self.settings.max_turns = max;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.settings.max_retries = max;
        self
    }

    pub fn with_max_tool_errors(mut self, max: u32) -> Self {
        self.settings.max_tool_errors = max;
        self
    }

    pub fn with_steering_mode(mut self, mode: QueueMode) -> Self {
        self.steering_mode = mode;
        self
    }

    pub fn with_follow_up_mode(mut self, mode: QueueMode) -> Self {
        self.follow_up_mode = mode;
        self
    }

    pub fn with_stream_fn(mut self, f: StreamFn) -> Self {
        self.settings.stream_fn = Some(f);
        self
    }

    pub fn with_transform_context(mut self, f: TransformContextFn) -> Self {
        self.settings.transform_context = Some(f);
        self
    }

    pub fn with_convert_to_llm(mut self, f: ConvertToLlmFn) -> Self {
        self.settings.convert_to_llm = Some(f);
        self
    }

    pub fn with_permission(mut self, f: PermissionFunc) -> Self {
        self.settings.permission = Some(f);
        self
    }

    pub fn with_events(mut self, events: EventChannelConfig) -> Self {
        self.settings.events = events;
        self
    }

    /// Apply loaded settings (limits, thinking level, queue modes, events).
    pub fn with_settings(mut self, settings: &AgentSettings) -> Self {
        self.settings.system_prompt = settings.system_prompt.clone();
        self.settings.max_turns = settings.max_turns;
        self.settings.max_retries = settings.max_retries;
        self.settings.max_tool_errors = settings.max_tool_errors;
        self.settings.thinking = settings.thinking_level;
        self.settings.events = settings.events.channel_config();
        self.steering_mode = settings.steering_mode;
        self.follow_up_mode = settings.follow_up_mode;
        self
    }

    pub fn build(self) -> Agent {
        let (running, _) = watch::channel(false);
        let inner = Inner {
            settings: self.settings,
            messages: self.messages,
            steering: MessageQueue::new(self.steering_mode),
            follow_ups: MessageQueue::new(self.follow_up_mode),
            running: false,
            cancel: None,
            stream_message: None,
            pending_tool_calls: BTreeSet::new(),
            error: None,
            total_usage: Usage::default(),
            listeners: Vec::new(),
            next_listener_id: 0,
        };
        Agent {
            shared: Arc::new(Shared {
                state: Mutex::new(inner),
                running,
                bus: EventBus::default(),
            }),
        }
    }
}

impl Agent {
    pub fn builder(model: Arc<dyn ChatModel>) -> AgentBuilder {
        AgentBuilder {
            settings: Settings {
                system_prompt: String::new(),
                model,
                tools: ToolRegistry::new(),
                thinking: ThinkingLevel::Off,
                max_turns: DEFAULT_MAX_TURNS,
                max_retries: 0,
                max_tool_errors: 0,
                stream_fn: None,
                transform_context: None,
                convert_to_llm: None,
                permission: None,
                events: EventChannelConfig::default(),
            },
            messages: Vec::new(),
            steering_mode: QueueMode::All,
            follow_up_mode: QueueMode::All,
        }
    }

    /// An agent with default settings.
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self::builder(model).build()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock()
    }

    // ── Runs ───────────────────────────────────────────────────────────

    /// Run the agent on new prompt messages and wait for the run to end.
    ///
    /// Fails immediately with [`AgentError::AlreadyRunning`] if a run is
    /// active. Run failures are not errors here: they are recorded in the
    /// history and in [`AgentState::error`].
    pub async fn prompt(&self, messages: Vec<AgentMessage>) -> Result<(), AgentError> {
        let (context, config, cancel) = {
            let mut inner = self.lock();
            self.begin_run(&mut inner)?
        };
        info!(prompts = messages.len(), "Starting agent run");
        let rx = agent_loop(messages, context, config, cancel);
        self.drive(rx).await;
        Ok(())
    }

    /// Run the agent on a single user text message.
    pub async fn prompt_text(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.prompt(vec![Message::user(text).into()]).await
    }

    /// Continue from the current history.
    ///
    /// When the history ends with an assistant turn, queued steering
    /// messages (or, failing that, follow-ups) are dequeued and become the
    /// run's prompts; with nothing queued this fails with
    /// [`AgentError::NothingToContinue`].
    pub async fn continue_run(&self) -> Result<(), AgentError> {
        let (queued, (context, config, cancel)) = {
            let mut inner = self.lock();
            if inner.running {
                return Err(AgentError::AlreadyRunning);
            }
            let queued = match inner.messages.last().map(AgentMessage::role) {
                None => return Err(LoopError::EmptyContext.into()),
                Some(Role::Assistant) => {
                    let mut queued = inner.steering.drain();
                    if queued.is_empty() {
                        queued = inner.follow_ups.drain();
                    }
                    if queued.is_empty() {
                        return Err(AgentError::NothingToContinue);
                    }
                    Some(queued)
                }
                Some(_) => None,
            };
            (queued, self.begin_run(&mut inner)?)
        };

        let rx = match queued {
            Some(prompts) => agent_loop(prompts, context, config, cancel),
            None => match agent_loop_continue(context, config, cancel) {
                Ok(rx) => rx,
                Err(e) => {
                    self.shared.finish_run();
                    return Err(e.into());
                }
            },
        };
        self.drive(rx).await;
        Ok(())
    }

    /// Snapshot history and configuration and mark the agent running.
    fn begin_run(
        &self,
        inner: &mut Inner,
    ) -> Result<(AgentContext, LoopConfig, CancellationToken), AgentError> {
        if inner.running {
            return Err(AgentError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        inner.running = true;
        inner.cancel = Some(cancel.clone());
        inner.error = None;
        self.shared.running.send_replace(true);

        let s = &inner.settings;
        let context = AgentContext {
            system_prompt: s.system_prompt.clone(),
            messages: inner.messages.clone(),
            tools: s.tools.clone(),
        };

        let steering_source = self.shared.clone();
        let steering: MessageBatchFn = Arc::new(move || steering_source.lock().steering.drain());
        let follow_up_source = self.shared.clone();
        let follow_ups: MessageBatchFn =
            Arc::new(move || follow_up_source.lock().follow_ups.drain());

        let mut config = LoopConfig::new(s.model.clone())
            .with_max_turns(s.max_turns)
            .with_max_retries(s.max_retries)
            .with_max_tool_errors(s.max_tool_errors)
            .with_thinking(s.thinking)
            .with_events(s.events)
            .with_steering_messages(steering)
            .with_follow_up_messages(follow_ups);
        config.stream_fn = s.stream_fn.clone();
        config.transform_context = s.transform_context.clone();
        config.convert_to_llm = s.convert_to_llm.clone();
        config.permission = s.permission.clone();

        Ok((context, config, cancel))
    }

    /// Consume the loop's events on a dedicated task and wait for it.
    async fn drive(&self, rx: mpsc::Receiver<Event>) {
        let shared = self.shared.clone();
        let consumer = tokio::spawn(consume_events(shared, rx));
        if let Err(e) = consumer.await {
            error!(error = %e, "Agent event consumer failed");
            self.shared.finish_run();
        }
    }

    /// Cancel the active run, if any. Observed at the next checkpoint.
    pub fn abort(&self) {
        if let Some(cancel) = &self.lock().cancel {
            info!("Aborting agent run");
            cancel.cancel();
        }
    }

    /// Resolve once no run is active.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.shared.running.subscribe();
        // Sender is owned by `self`.
        let _ = rx.wait_for(|running| !*running).await;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    // ── Queues ─────────────────────────────────────────────────────────

    /// Queue a message that interrupts the current run between tool calls.
    pub fn steer(&self, message: impl Into<AgentMessage>) {
        self.lock().steering.push(message.into());
    }

    /// Queue a message that is delivered once the run would otherwise end.
    pub fn follow_up(&self, message: impl Into<AgentMessage>) {
        self.lock().follow_ups.push(message.into());
    }

    pub fn clear_steering_queue(&self) {
        self.lock().steering.clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.lock().follow_ups.clear();
    }

    pub fn clear_all_queues(&self) {
        let mut inner = self.lock();
        inner.steering.clear();
        inner.follow_ups.clear();
    }

    pub fn has_queued_messages(&self) -> bool {
        let inner = self.lock();
        !inner.steering.is_empty() || !inner.follow_ups.is_empty()
    }

    // ── Events ─────────────────────────────────────────────────────────

    /// Register a listener called after each event is applied.
    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// A broadcast receiver of every applied event.
    pub fn events(&self) -> broadcast::Receiver<Arc<Event>> {
        self.shared.bus.subscribe()
    }

    // ── State ──────────────────────────────────────────────────────────

    pub fn state(&self) -> AgentState {
        let inner = self.lock();
        AgentState {
            system_prompt: inner.settings.system_prompt.clone(),
            model: inner.settings.model.name().to_string(),
            thinking_level: inner.settings.thinking,
            tools: inner
                .settings
                .tools
                .names()
                .into_iter()
                .map(String::from)
                .collect(),
            messages: inner.messages.clone(),
            is_running: inner.running,
            stream_message: inner.stream_message.clone(),
            pending_tool_calls: inner.pending_tool_calls.clone(),
            error: inner.error.clone(),
            total_usage: inner.total_usage,
        }
    }

    pub fn messages(&self) -> Vec<AgentMessage> {
        self.lock().messages.clone()
    }

    /// Field-wise sum of usage over every assistant message applied so far.
    pub fn total_usage(&self) -> Usage {
        self.lock().total_usage
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.lock().settings.system_prompt = prompt.into();
    }

    pub fn set_model(&self, model: Arc<dyn ChatModel>) {
        self.lock().settings.model = model;
    }

    pub fn set_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        self.lock().settings.tools = ToolRegistry::from(tools);
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.lock().settings.thinking = level;
    }

    pub fn set_max_turns(&self, max: u32) {
        self.lock().settings.max_turns = max;
    }

    pub fn set_max_retries(&self, max: u32) {
        self.lock().settings.max_retries = max;
    }

    pub fn set_max_tool_errors(&self, max: u32) {
        self.lock().settings.max_tool_errors = max;
    }

    pub fn set_permission(&self, f: Option<PermissionFunc>) {
        self.lock().settings.permission = f;
    }

    pub fn set_steering_mode(&self, mode: QueueMode) {
        self.lock().steering.set_mode(mode);
    }

    pub fn set_follow_up_mode(&self, mode: QueueMode) {
        self.lock().follow_ups.set_mode(mode);
    }

    // History edits are rejected while a run is active: the run's consumer
    // is the only writer until it finishes.

    pub fn replace_messages(&self, messages: Vec<AgentMessage>) -> Result<(), AgentError> {
        self.edit_history(|inner| inner.messages = messages)
    }

    pub fn append_message(&self, message: impl Into<AgentMessage>) -> Result<(), AgentError> {
        let message = message.into();
        self.edit_history(|inner| inner.messages.push(message))
    }

    pub fn clear_messages(&self) -> Result<(), AgentError> {
        self.edit_history(|inner| inner.messages.clear())
    }

    /// Clear history, queues, the last error and accumulated usage.
    pub fn reset(&self) -> Result<(), AgentError> {
        self.edit_history(|inner| {
            inner.messages.clear();
            inner.steering.clear();
            inner.follow_ups.clear();
            inner.stream_message = None;
            inner.pending_tool_calls.clear();
            inner.error = None;
            inner.total_usage = Usage::default();
        })
    }

    fn edit_history(&self, edit: impl FnOnce(&mut Inner)) -> Result<(), AgentError> {
        let mut inner = self.lock();
        if inner.running {
            return Err(AgentError::AlreadyRunning);
        }
        edit(&mut *inner);
        Ok(())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Agent")
            .field("model", &inner.settings.model.name())
            .field("tools", &inner.settings.tools)
            .field("messages", &inner.messages.len())
            .field("running", &inner.running)
            .finish()
    }
}

/// The single writer of run-derived agent state.
async fn consume_events(shared: Arc<Shared>, mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        let listeners = {
            let mut inner = shared.lock();
            inner.apply(&event);
            inner.listeners()
        };
        for listener in &listeners {
            listener(&event);
        }
        shared.bus.publish(event);
    }
    shared.finish_run();
    debug!("Agent event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use turnloop_core::{ModelError, ModelRequest, ModelResult, StreamEvent};

    /// A model that blocks until released.
    struct GatedModel {
        gate: Arc<Notify>,
        calls: AtomicUsize,
    }

    impl GatedModel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Notify::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatModel for GatedModel {
        fn name(&self) -> &str {
            "gated"
        }

        async fn generate(&self, _request: ModelRequest) -> ModelResult<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(Message::assistant("released"))
        }
    }

    async fn until_running(agent: &Agent) {
        while !agent.is_running() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn prompt_appends_prompt_and_reply() {
        let agent = Agent::new(Arc::new(ScriptedModel::replies(vec![Message::assistant(
            "hi there",
        )])));
        agent.prompt_text("hello").await.unwrap();

        let state = agent.state();
        assert!(!state.is_running);
        assert!(state.error.is_none());
        assert!(state.stream_message.is_none());
        let texts: Vec<String> = state.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["hello", "hi there"]);
    }

    #[tokio::test]
    async fn second_prompt_while_running_is_rejected() {
        let model = GatedModel::new();
        let agent = Agent::new(model.clone());
        let runner = agent.clone();
        let first = tokio::spawn(async move { runner.prompt_text("first").await });
        until_running(&agent).await;

        let err = agent.prompt_text("second").await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyRunning));
        assert!(matches!(
            agent.continue_run().await,
            Err(AgentError::AlreadyRunning)
        ));

        model.gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent.messages().len(), 2);
    }

    #[tokio::test]
    async fn history_edits_are_rejected_while_running() {
        let model = GatedModel::new();
        let agent = Agent::new(model.clone());
        let runner = agent.clone();
        let run = tokio::spawn(async move { runner.prompt_text("hello").await });
        until_running(&agent).await;

        assert!(matches!(agent.clear_messages(), Err(AgentError::AlreadyRunning)));
        assert!(matches!(
            agent.append_message(Message::user("injected")),
            Err(AgentError::AlreadyRunning)
        ));
        assert!(matches!(
            agent.replace_messages(vec![Message::user("injected").into()]),
            Err(AgentError::AlreadyRunning)
        ));
        assert!(matches!(agent.reset(), Err(AgentError::AlreadyRunning)));

        model.gate.notify_one();
        run.await.unwrap().unwrap();
        let texts: Vec<String> = agent.messages().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["hello", "released"]);

        agent.append_message(Message::user("between runs")).unwrap();
        assert_eq!(agent.messages().len(), 3);
    }

    #[tokio::test]
    async fn abort_records_aborted_assistant_turn() {
        let model = GatedModel::new();
        let agent = Agent::new(model.clone());
        let runner = agent.clone();
        let run = tokio::spawn(async move { runner.prompt_text("wait forever").await });
        until_running(&agent).await;

        agent.abort();
        run.await.unwrap().unwrap();
        agent.wait_for_idle().await;

        let state = agent.state();
        assert_eq!(state.error.as_deref(), Some("run aborted"));
        let last = state.messages.last().and_then(AgentMessage::as_message).unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.stop_reason, Some(StopReason::Aborted));
        assert!(state.pending_tool_calls.is_empty());
    }

    #[tokio::test]
    async fn fatal_error_synthesizes_terminal_assistant_message() {
        let agent = Agent::new(Arc::new(ScriptedModel::new(vec![Err(transient())])));
        agent.prompt_text("hi").await.unwrap();

        let state = agent.state();
        let error = state.error.unwrap();
        assert!(error.contains("overloaded"));
        let last = state.messages.last().and_then(AgentMessage::as_message).unwrap();
        assert_eq!(last.stop_reason, Some(StopReason::Error));
        assert_eq!(last.error_message(), Some(error.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_abandoned_by_retry_is_not_recorded() {
        let model = StreamScriptModel::new(vec![
            interrupted_stream("half an ans"),
            vec![StreamEvent::Error {
                error: ModelError::Authentication("key revoked".into()),
            }],
        ]);
        let agent = Agent::builder(Arc::new(model)).with_max_retries(1).build();
        let retries = Arc::new(AtomicUsize::new(0));
        let counter = retries.clone();
        agent.subscribe(move |e| {
            if matches!(e, Event::Retry { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        agent.prompt_text("hi").await.unwrap();

        assert_eq!(retries.load(Ordering::SeqCst), 1);
        let state = agent.state();
        assert!(state.stream_message.is_none());
        assert_eq!(state.messages.len(), 2);
        assert!(state.messages.iter().all(|m| !m.text().contains("half")));
        let last = state.messages.last().and_then(AgentMessage::as_message).unwrap();
        assert_eq!(last.stop_reason, Some(StopReason::Error));
        assert!(last.error_message().unwrap().contains("key revoked"));
    }

    #[tokio::test]
    async fn usage_is_summed_across_assistant_messages() {
        let agent = Agent::builder(Arc::new(ScriptedModel::replies(vec![
            tool_call_message(&[("c1", "add", serde_json::json!({"a": 1, "b": 1}))])
                .with_usage(Usage {
                    input: 10,
                    output: 4,
                    total: 14,
                    ..Usage::default()
                }),
            reply_with_usage("2", 20, 1),
        ])))
        .with_tool(FnTool::add())
        .build();
        agent.prompt_text("1+1").await.unwrap();

        let usage = agent.total_usage();
        assert_eq!(usage.input, 30);
        assert_eq!(usage.output, 5);
        assert_eq!(usage.total, 35);
    }

    #[tokio::test]
    async fn listeners_see_every_event_until_unsubscribed() {
        let agent = Agent::new(Arc::new(ScriptedModel::replies(vec![])));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = agent.subscribe(move |e| sink.lock().unwrap().push(e.event_type()));
        let mut bus = agent.events();

        agent.prompt_text("one").await.unwrap();
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.first(), Some(&"agent_start"));
            assert_eq!(seen.last(), Some(&"agent_end"));
        }
        assert_eq!(bus.recv().await.unwrap().event_type(), "agent_start");

        assert!(agent.unsubscribe(id));
        assert!(!agent.unsubscribe(id));
        let count = seen.lock().unwrap().len();
        agent.prompt_text("two").await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), count);
    }

    #[tokio::test]
    async fn continue_after_assistant_uses_queued_messages() {
        let model = Arc::new(ScriptedModel::replies(vec![
            Message::assistant("first"),
            Message::assistant("second"),
        ]));
        let agent = Agent::new(model.clone());
        agent.prompt_text("start").await.unwrap();

        assert!(matches!(
            agent.continue_run().await,
            Err(AgentError::NothingToContinue)
        ));

        agent.follow_up(Message::user("and then?"));
        assert!(agent.has_queued_messages());
        agent.continue_run().await.unwrap();
        assert!(!agent.has_queued_messages());

        let texts: Vec<String> = agent.messages().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["start", "first", "and then?", "second"]);
    }

    #[tokio::test]
    async fn continue_after_user_message_resumes_directly() {
        let model = Arc::new(ScriptedModel::replies(vec![Message::assistant("answer")]));
        let agent = Agent::builder(model.clone())
            .with_messages(vec![Message::user("pending question").into()])
            .build();
        agent.continue_run().await.unwrap();
        assert_eq!(model.request_count(), 1);
        assert_eq!(agent.messages().len(), 2);
    }

    #[tokio::test]
    async fn continue_on_empty_history_fails() {
        let agent = Agent::new(Arc::new(ScriptedModel::replies(vec![])));
        assert!(matches!(
            agent.continue_run().await,
            Err(AgentError::Loop(LoopError::EmptyContext))
        ));
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn settings_shape_the_run() {
        let settings = AgentSettings {
            system_prompt: "Answer in French.".into(),
            max_turns: 3,
            ..AgentSettings::default()
        };
        let model = Arc::new(ScriptedModel::replies(vec![Message::assistant("oui")]));
        let agent = Agent::builder(model.clone()).with_settings(&settings).build();
        agent.prompt_text("yes?").await.unwrap();

        let request = &model.requests.lock().unwrap()[0];
        assert_eq!(request.messages[0].text(), "Answer in French.");
        assert_eq!(agent.state().system_prompt, "Answer in French.");
    }

    #[tokio::test]
    async fn reset_clears_history_queues_and_usage() {
        let agent = Agent::new(Arc::new(ScriptedModel::replies(vec![reply_with_usage(
            "x", 1, 1,
        )])));
        agent.prompt_text("go").await.unwrap();
        agent.steer(Message::user("later"));
        agent.reset().unwrap();

        let state = agent.state();
        assert!(state.messages.is_empty());
        assert_eq!(state.total_usage, Usage::default());
        assert!(!agent.has_queued_messages());
    }
}
