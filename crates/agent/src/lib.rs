//! The agent execution loop, the heart of turnloop.
//!
//! A run follows a **call → act → observe** cycle:
//!
//! 1. **Prepare** the history (transform hook, provider conversion, repair)
//! 2. **Call** the model, streaming deltas out as events
//! 3. **If tool calls**: execute them in order, append results, loop back to 2
//! 4. **If steering arrives**: skip the rest of the batch and inject it
//! 5. **When settled**: pull follow-ups and keep going, or end the run
//!
//! [`agent_loop`] and [`agent_loop_continue`] are the stateless entry points;
//! [`Agent`] wraps them with history, queues and single-flight enforcement.

pub mod agent;
pub mod context;
pub mod llm;
pub mod loop_runner;
pub mod queue;
pub mod repair;
pub mod tool_exec;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use agent::{Agent, AgentBuilder, AgentError, AgentState, Listener, SubscriptionId};
pub use context::{
    AgentContext, ConvertToLlmFn, DEFAULT_MAX_TURNS, LoopConfig, MessageBatchFn, StreamFn,
    TransformContextFn, default_convert_to_llm,
};
pub use llm::{INITIAL_BACKOFF, MAX_BACKOFF, backoff_delay};
pub use loop_runner::{agent_loop, agent_loop_continue};
pub use queue::MessageQueue;
pub use repair::{MISSING_RESULT_TEXT, repair_message_sequence};
pub use tool_exec::{SKIPPED_FOR_ABORT, SKIPPED_FOR_STEERING};
