use std::io::{self, Write};
use std::time::{Duration, Instant};

use crossterm::cursor::MoveToColumn;
use crossterm::execute;
use crossterm::style::Stylize;
use crossterm::terminal::{Clear, ClearType};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub const SEPARATOR_WIDTH: usize = 70;
const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

/// Prints streamed deltas one character at a time. Runs beside the network
/// read loop, so pacing never throttles the connection.
pub async fn paced_print(mut rx: UnboundedReceiver<String>, delay: Duration) -> usize {
    let mut printed = 0usize;
    let mut stdout = io::stdout();
    while let Some(chunk) = rx.recv().await {
        for ch in chunk.chars() {
            print!("{ch}");
            let _ = stdout.flush();
            printed += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
    println!();
    printed
}

pub fn ai_label() {
    println!("{}", "AI:".green().bold());
}

pub fn info(text: &str) {
    println!("{}", text.blue());
}

pub fn notice(text: &str) {
    println!("{}", text.yellow());
}

pub fn error(text: &str) {
    println!("{}", text.red());
}

pub fn separator() {
    println!("{}", "-".repeat(SEPARATOR_WIDTH).cyan());
}

pub fn banner(version: &str) {
    println!("{}", format!("codemate v{version}").cyan().bold());
    println!("{}", "Terminal assistant for working with code through a local or cloud LLM".cyan());
}

/// Spinner with elapsed seconds, shown while a non-streamed answer is pending.
/// Dropping it stops the ticker and clears the line.
pub struct WorkingStatus {
    ticker: JoinHandle<()>,
}

impl WorkingStatus {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        let started = Instant::now();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(200));
            for frame in SPINNER.iter().cycle() {
                interval.tick().await;
                print!(
                    "\r{frame} {} {}s",
                    label.as_str().dark_grey(),
                    started.elapsed().as_secs()
                );
                let _ = io::stdout().flush();
            }
        });
        Self { ticker }
    }
}

impl Drop for WorkingStatus {
    fn drop(&mut self) {
        self.ticker.abort();
        let _ = execute!(io::stdout(), MoveToColumn(0), Clear(ClearType::CurrentLine));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paced_print_drains_until_sender_drops() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send("ab".to_string()).unwrap();
        tx.send("вг".to_string()).unwrap();
        drop(tx);
        assert_eq!(paced_print(rx, Duration::ZERO).await, 4);
    }

    #[tokio::test]
    async fn working_status_stops_on_drop() {
        let status = WorkingStatus::start("ollama llama3.1:8b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(status);
    }
}
