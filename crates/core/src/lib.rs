//! # turnloop core
//!
//! Domain types, capability traits, and error definitions for the turnloop
//! agent SDK. This crate holds no loop policy: it defines the data model and
//! the boundaries (`ChatModel`, `Tool`, `PermissionFunc`, `Event`) that the
//! loop in `turnloop-agent` is written against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is a trait here. Implementations live elsewhere, which
//! keeps the loop testable with scripted doubles and lets applications plug in
//! any model transport or tool set.

pub mod agent;
pub mod error;
pub mod event;
pub mod message;
pub mod model;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{QueueMode, ThinkingLevel};
pub use error::{HookError, LoopError, ModelError, ModelResult, ToolError};
pub use event::{
    DeliveryMode, Event, EventBus, EventChannelConfig, EventSink, MessageDelta, event_channel,
};
pub use message::{
    AgentMessage, ContentBlock, ContentKind, CustomMessage, Message, Role, StopReason, ToolCall,
    ToolResult, Usage,
};
pub use model::{ChatModel, GenerateOptions, ModelRequest, ModelStream, StreamEvent, ToolDefinition};
pub use tool::{PermissionFunc, ProgressReporter, Tool, ToolContext, ToolRegistry};
