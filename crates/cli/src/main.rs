//! turnloop CLI: drive the agent loop offline.
//!
//! Commands:
//! - `run`     Run one prompt against a scripted replay model
//! - `config`  Print the effective agent settings

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod replay;
mod tools;

#[derive(Parser, Debug)]
#[command(
    name = "turnloop",
    about = "turnloop: drive the agent execution loop offline",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one prompt through an agent backed by a replay script
    Run {
        /// JSON file with the scripted assistant turns
        #[arg(short, long)]
        script: PathBuf,

        /// Agent settings (TOML); defaults apply when absent
        #[arg(short, long, default_value = "agent.toml")]
        config: PathBuf,

        /// Print events as JSON lines instead of text
        #[arg(long)]
        json: bool,

        /// The prompt text
        #[arg(required = true)]
        prompt: Vec<String>,
    },

    /// Print the effective settings as TOML
    Config {
        /// Settings file to load
        #[arg(short, long, default_value = "agent.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the event stream; logs go to stderr
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            script,
            config,
            json,
            prompt,
        } => commands::run::run(&script, &config, json, prompt.join(" ")).await?,
        Commands::Config { path } => commands::config_cmd::show(&path)?,
    }

    Ok(())
}
