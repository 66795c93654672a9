mod assistant;
mod chat;
mod chat_context;
mod cli;
mod commands;
mod config;
mod fs_tools;
mod history;
mod language;
mod llm;
mod render;
mod util;
mod workspace;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::assistant::Assistant;
use crate::chat::run_chat;
use crate::cli::{Cli, Commands};
use crate::commands::{handle_config, run_models, run_test};
use crate::config::{Config, config_path, load_config_or_default};
use crate::workspace::Workspace;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { command }) => handle_config(command)?,
        Some(Commands::Models) => {
            let cfg = session_config(&cli)?;
            run_models(&cfg, cfg.active_provider).await?;
        }
        Some(Commands::Test) => {
            let cfg = session_config(&cli)?;
            run_test(&cfg, cfg.active_provider).await?;
        }
        Some(Commands::Chat) | None => {
            let cfg = session_config(&cli)?;
            let root = match &cli.root {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().context("Cannot determine current directory")?,
            };
            if !root.is_dir() {
                anyhow::bail!("Root is not a directory: {}", root.display());
            }
            let workspace = Workspace::new(&root)
                .with_context(|| format!("Cannot open working root {}", root.display()))?;
            debug!(root = %workspace.root().display(), "workspace ready");
            let assistant = Assistant::new(workspace, cfg, Some(config_path()?))?;
            run_chat(assistant).await?;
        }
    }

    Ok(())
}

/// Stored config with command-line overrides applied. Overrides last for this
/// run only unless a chat command persists them.
fn session_config(cli: &Cli) -> Result<Config> {
    let mut cfg = load_config_or_default()?;
    if let Some(kind) = cli.provider {
        cfg.active_provider = kind;
        cfg.active_model = cfg.providers.get(kind).default_model.clone();
    }
    if let Some(model) = &cli.model {
        cfg.active_model = model.clone();
    }
    if cli.no_stream {
        cfg.chat.streaming = false;
    }
    Ok(cfg)
}

/// Logs go to stderr so they never mix with the chat transcript.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
