//! Error types for the turnloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each boundary (model, tool, loop) has its own error type so that the loop
//! can classify failures without string matching.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by application hooks (context transforms and the like).
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by a [`ChatModel`](crate::model::ChatModel).
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider{}", retry_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Model not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),
}

fn retry_hint(secs: &Option<u64>) -> String {
    match secs {
        Some(s) => format!(", retry after {s}s"),
        None => String::new(),
    }
}

impl ModelError {
    /// Built-in transient-failure classifier.
    ///
    /// Rate limits, timeouts, network failures, interrupted streams and
    /// HTTP 408/429/5xx are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Timeout(_)
            | Self::Network(_)
            | Self::StreamInterrupted(_) => true,
            Self::Api { status_code, .. } => {
                matches!(status_code, 408 | 429) || (500..600).contains(status_code)
            }
            Self::Authentication(_) | Self::NotConfigured(_) | Self::InvalidResponse(_) => false,
        }
    }

    /// Provider-supplied retry-after hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Errors raised while running a [`Tool`](crate::tool::Tool).
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool cancelled: {0}")]
    Cancelled(String),
}

/// Errors that end one loop invocation.
///
/// These never cross the event boundary as panics; they travel inside
/// [`Event::Error`](crate::event::Event::Error).
#[derive(Debug, Clone, Error)]
pub enum LoopError {
    #[error("run aborted")]
    Aborted,

    #[error("max turns ({0}) reached")]
    MaxTurns(u32),

    #[error("model call failed: {0}")]
    Model(#[from] ModelError),

    #[error("context transform failed: {0}")]
    Transform(String),

    #[error("cannot continue from an empty context")]
    EmptyContext,
}

/// Result alias for model calls.
pub type ModelResult<T> = std::result::Result<T, ModelError>;
