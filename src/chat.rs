use std::io::{self, Write};

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::assistant::{Assistant, Reply};
use crate::render;

const EXIT_WORDS: &[&str] = &["exit", "quit", "выход", "!exit"];

enum Turn {
    Line(io::Result<Option<String>>),
    Interrupted,
}

pub fn is_exit_word(input: &str) -> bool {
    let lower = input.trim().to_lowercase();
    EXIT_WORDS.contains(&lower.as_str())
}

/// Interactive loop. Ctrl-C while waiting for input or for a model answer
/// saves history and ends the session.
pub async fn run_chat(mut assistant: Assistant) -> Result<()> {
    render::banner(env!("CARGO_PKG_VERSION"));
    render::info(&assistant.status_line());
    println!(
        "History: {} messages in {}",
        assistant.history().len(),
        assistant.history().path().display()
    );
    println!("Type !help for commands, exit to quit.");
    render::separator();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        let _ = io::stdout().flush();

        let turn = tokio::select! {
            line = lines.next_line() => Turn::Line(line),
            _ = tokio::signal::ctrl_c() => Turn::Interrupted,
        };
        let input = match turn {
            Turn::Line(Ok(Some(line))) => line,
            Turn::Line(Ok(None)) => break,
            Turn::Line(Err(err)) => {
                error!("failed to read input: {err}");
                break;
            }
            Turn::Interrupted => {
                println!();
                render::notice("Interrupted");
                break;
            }
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if is_exit_word(input) {
            break;
        }

        let reply = tokio::select! {
            reply = assistant.chat(input) => Some(reply),
            _ = tokio::signal::ctrl_c() => None,
        };
        match reply {
            Some(Reply::Local(text)) => println!("{text}"),
            Some(Reply::Model { text, streamed }) => {
                if !streamed {
                    render::ai_label();
                    println!("{text}");
                }
            }
            Some(Reply::Failed(msg)) => render::error(&msg),
            None => {
                println!();
                render::notice("Request interrupted");
                break;
            }
        }
        render::separator();
    }

    match assistant.save_history() {
        Ok(()) => info!(count = assistant.history().len(), "history saved on exit"),
        Err(err) => {
            error!("{err:#}");
            warn!("history may be incomplete");
        }
    }
    render::info("Goodbye!");
    Ok(())
}
