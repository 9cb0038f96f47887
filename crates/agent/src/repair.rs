//! Tool-call/tool-result pairing repair.
//!
//! Strict providers reject a history in which an assistant tool call has no
//! result, or a tool result answers a call that does not exist. Histories get
//! that way through aborts, crashes mid-batch or manual edits, so the sequence
//! is repaired before every model call instead of surfacing an error.
//!
//! Guarantees after [`repair_message_sequence`]:
//! - every tool call of an assistant message has exactly one tool-result
//!   message in the run of tool messages directly after it;
//! - no tool-result message references an id that no assistant message calls.
//!
//! The repair is idempotent.

use std::collections::HashSet;
use tracing::warn;
use turnloop_core::{Message, Role, ToolResult};

/// Content of a synthetic result inserted for an unanswered call.
pub const MISSING_RESULT_TEXT: &str = "No result: conversation truncated or interrupted.";

/// Repair tool-call/tool-result pairing in a provider-ready message sequence.
pub fn repair_message_sequence(messages: Vec<Message>) -> Vec<Message> {
    let (patched, inserted, duplicates) = insert_missing_results(messages);
    let (repaired, orphans) = remove_orphan_results(patched);

    if inserted + duplicates + orphans > 0 {
        warn!(
            inserted,
            duplicates, orphans, "Repaired tool-call/tool-result sequence"
        );
    }
    repaired
}

/// Pass 1: make sure each assistant's tool calls are answered by the tool
/// messages that immediately follow it.
fn insert_missing_results(messages: Vec<Message>) -> (Vec<Message>, usize, usize) {
    let mut out = Vec::with_capacity(messages.len());
    let mut inserted = 0;
    let mut duplicates = 0;
    let mut iter = messages.into_iter().peekable();

    while let Some(message) = iter.next() {
        let mut call_ids: Vec<String> = Vec::new();
        if message.role == Role::Assistant {
            for call in message.tool_calls() {
                if !call_ids.contains(&call.id) {
                    call_ids.push(call.id.clone());
                }
            }
        }
        out.push(message);
        if call_ids.is_empty() {
            continue;
        }

        let mut answered: HashSet<String> = HashSet::new();
        while let Some(next) = iter.next_if(|m| m.role == Role::Tool) {
            match next.tool_call_id() {
                Some(id) if call_ids.iter().any(|c| c == id) => {
                    if answered.insert(id.to_string()) {
                        out.push(next);
                    } else {
                        duplicates += 1;
                    }
                }
                // Left for the orphan pass to judge.
                _ => out.push(next),
            }
        }

        for id in call_ids.iter().filter(|id| !answered.contains(*id)) {
            out.push(Message::tool_result(&ToolResult::error(
                id.clone(),
                MISSING_RESULT_TEXT,
            )));
            inserted += 1;
        }
    }

    (out, inserted, duplicates)
}

/// Pass 2: drop tool results whose id matches no call anywhere.
fn remove_orphan_results(messages: Vec<Message>) -> (Vec<Message>, usize) {
    let known: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls().into_iter().map(|c| c.id.clone()))
        .collect();

    let before = messages.len();
    let kept: Vec<Message> = messages
        .into_iter()
        .filter(|m| {
            m.role != Role::Tool || m.tool_call_id().is_some_and(|id| known.contains(id))
        })
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}
