//! Demo tools available to replayed runs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use turnloop_core::{Tool, ToolContext, ToolError};

/// Every demo tool, in registration order.
pub fn demo_tools() -> Vec<Arc<dyn Tool>> {
    vec![Arc::new(AddTool), Arc::new(EchoTool)]
}

/// Adds two numbers.
pub struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn label(&self) -> &str {
        "Add"
    }

    fn description(&self) -> &str {
        "Add two numbers and return the sum"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": { "type": "number" }
            },
            "required": ["a", "b"]
        })
    }

    async fn execute(&self, _ctx: ToolContext, arguments: Value) -> Result<Value, ToolError> {
        let operand = |key: &str| {
            arguments[key]
                .as_f64()
                .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' must be a number")))
        };
        let (a, b) = (operand("a")?, operand("b")?);

        // Keep integer sums integral in the transcript.
        match (arguments["a"].as_i64(), arguments["b"].as_i64()) {
            (Some(a), Some(b)) => Ok(json!(a.saturating_add(b))),
            _ => Ok(json!(a + b)),
        }
    }
}

/// Returns its `text` argument unchanged, reporting it as progress first.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, ctx: ToolContext, arguments: Value) -> Result<Value, ToolError> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'text' must be a string".into()))?;
        ctx.progress.report(json!({ "echoing": text })).await;
        Ok(Value::String(text.to_string()))
    }
}
