//! Loop lifecycle events and the channels that carry them.
//!
//! The loop's only output is a sequence of [`Event`]s written into a bounded
//! channel through an [`EventSink`]. The sink never stalls the loop: with the
//! default [`DeliveryMode::DropOnFull`] a full channel drops the event, and with
//! [`DeliveryMode::Block`] the send waits at most the configured timeout. Every
//! dropped event is counted and logged, so consumers that need an exact audit
//! trail can detect loss via [`EventSink::dropped`].

use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::LoopError;
use crate::message::{AgentMessage, ContentKind, Message, ToolResult};

/// Default bounded-channel capacity for loop events.
pub const DEFAULT_EVENT_CAPACITY: usize = 128;

/// One streamed content delta inside a `message_update` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDelta {
    pub kind: ContentKind,
    pub index: usize,
    pub delta: String,
}

/// Every lifecycle occurrence the loop can report.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AgentStart,

    TurnStart { turn: u32 },

    MessageStart { message: AgentMessage },

    /// A streamed delta; `message` is the partial message so far.
    MessageUpdate {
        message: AgentMessage,
        delta: MessageDelta,
    },

    MessageEnd { message: AgentMessage },

    ToolExecStart {
        tool_call_id: String,
        tool_name: String,
        label: String,
        arguments: serde_json::Value,
    },

    /// Partial output reported by a long-running tool.
    ToolExecUpdate {
        tool_call_id: String,
        tool_name: String,
        partial: serde_json::Value,
    },

    ToolExecEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolResult,
    },

    TurnEnd {
        turn: u32,
        message: Message,
        tool_results: Vec<ToolResult>,
    },

    /// A failed model call is about to be retried.
    ///
    /// If the failed attempt had already streamed content, its
    /// `message_start` gets no `message_end`: this event abandons that
    /// partial message and listeners should drop it. The retried attempt
    /// starts a fresh message.
    Retry {
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        error: String,
    },

    Error {
        #[serde(serialize_with = "serialize_display")]
        error: LoopError,
    },

    /// Always the last event of an invocation; carries every appended message.
    AgentEnd { messages: Vec<AgentMessage> },
}

fn serialize_display<S: Serializer>(error: &LoopError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

impl Event {
    /// Stable tag name for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::TurnStart { .. } => "turn_start",
            Self::MessageStart { .. } => "message_start",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolExecStart { .. } => "tool_exec_start",
            Self::ToolExecUpdate { .. } => "tool_exec_update",
            Self::ToolExecEnd { .. } => "tool_exec_end",
            Self::TurnEnd { .. } => "turn_end",
            Self::Retry { .. } => "retry",
            Self::Error { .. } => "error",
            Self::AgentEnd { .. } => "agent_end",
        }
    }
}

/// What the sink does when the channel is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Drop the event immediately (live-UI default)
    #[default]
    DropOnFull,
    /// Wait up to `timeout` for capacity, then drop
    Block { timeout: Duration },
}

/// Parameters for the loop's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventChannelConfig {
    pub capacity: usize,
    pub delivery: DeliveryMode,
}

impl Default for EventChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
            delivery: DeliveryMode::DropOnFull,
        }
    }
}

/// Non-stalling producer half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    delivery: DeliveryMode,
    dropped: Arc<AtomicU64>,
}

/// Create a bounded event channel.
pub fn event_channel(config: EventChannelConfig) -> (EventSink, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let sink = EventSink {
        tx,
        delivery: config.delivery,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sink, rx)
}

impl EventSink {
    /// Emit one event according to the delivery mode.
    pub async fn emit(&self, event: Event) {
        let kind = event.event_type();
        let delivered = match self.delivery {
            DeliveryMode::DropOnFull => match self.tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => false,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(event = kind, "Event receiver closed, discarding event");
                    return;
                }
            },
            DeliveryMode::Block { timeout } => self.tx.send_timeout(event, timeout).await.is_ok(),
        };

        if !delivered {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(event = kind, dropped, "Event channel full, event dropped");
        }
    }

    /// Number of events dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A broadcast-based bus for republishing events to many consumers.
///
/// Uses `tokio::sync::broadcast`; lagging receivers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
