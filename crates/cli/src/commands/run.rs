//! `turnloop run`: one prompt through an agent backed by a replay script.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use turnloop_agent::Agent;
use turnloop_config::AgentSettings;
use turnloop_core::{ContentKind, Event, Role};

use crate::replay::ReplayModel;
use crate::tools::demo_tools;

pub async fn run(script: &Path, config: &Path, json: bool, prompt: String) -> anyhow::Result<()> {
    let settings = AgentSettings::load_from_with_env(config)
        .with_context(|| format!("Failed to load settings from {}", config.display()))?;
    let model = Arc::new(ReplayModel::load(script)?);

    let agent = Agent::builder(model.clone())
        .with_settings(&settings)
        .with_tools(demo_tools())
        .build();

    agent.subscribe(move |event| {
        if json {
            print_json(event);
        } else {
            print_human(event);
        }
    });

    agent.prompt_text(prompt).await?;

    let state = agent.state();
    let usage = state.total_usage;
    tracing::info!(
        messages = state.messages.len(),
        unused_turns = model.remaining(),
        "Run finished"
    );
    if !json {
        println!(
            "usage: input={} output={} cache_read={} cache_write={} total={}",
            usage.input, usage.output, usage.cache_read, usage.cache_write, usage.total
        );
    }

    match state.error {
        Some(error) => anyhow::bail!("run failed: {error}"),
        None => Ok(()),
    }
}

fn print_json(event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(event = event.event_type(), "Failed to serialize event: {e}"),
    }
}

fn print_human(event: &Event) {
    match event {
        Event::TurnStart { turn } => println!("── turn {turn} ──"),
        Event::MessageStart { message } if message.role() == Role::User => {
            println!("you: {}", message.text());
        }
        Event::MessageUpdate { delta, .. } if delta.kind == ContentKind::Text => {
            print!("{}", delta.delta);
            let _ = std::io::stdout().flush();
        }
        Event::MessageEnd { message }
            if message.role() == Role::Assistant && !message.text().is_empty() =>
        {
            println!();
        }
        Event::ToolExecStart {
            label, arguments, ..
        } => println!("  → {label} {arguments}"),
        Event::ToolExecUpdate { partial, .. } => println!("  … {partial}"),
        Event::ToolExecEnd { result, .. } => {
            let marker = if result.is_error { "✗" } else { "←" };
            println!("  {marker} {}", result.text());
        }
        Event::Retry {
            attempt,
            max_retries,
            delay_ms,
            error,
        } => println!("  retry {attempt}/{max_retries} in {delay_ms}ms: {error}"),
        Event::Error { error } => println!("error: {error}"),
        Event::AgentEnd { messages } => println!("── done: {} new messages ──", messages.len()),
        _ => {}
    }
}
