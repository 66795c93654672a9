use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ProviderKind;

#[derive(Parser, Debug)]
#[command(
    name = "codemate",
    version,
    about = "Terminal assistant for reading, searching and discussing code with an LLM"
)]
pub struct Cli {
    /// Directory the assistant may read from (defaults to the current one)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
    /// Provider for this session
    #[arg(long, value_enum, global = true)]
    pub provider: Option<ProviderKind>,
    /// Model for this session
    #[arg(long, global = true)]
    pub model: Option<String>,
    /// Print answers in one piece instead of streaming them
    #[arg(long, global = true)]
    pub no_stream: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive chat (default)
    Chat,
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// List models offered by the provider (`--provider` or the active one)
    Models,
    /// Check that the provider answers
    Test,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a default config, replacing the existing one
    Init,
    /// Show current config
    Show,
    /// Print the config file location
    Path,
}
