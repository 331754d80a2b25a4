//! Line command console.
//!
//! Case-insensitive, line-delimited control surface. The source of lines is
//! a seam: the binary feeds stdin through a reader thread, the embedded
//! port feeds its serial port, tests feed a vector. The orchestrator polls
//! one line per tick and executes it; unknown input prints the help text.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use crate::error::RelayResult;

/// Non-blocking source of command lines.
pub trait CommandSource {
    fn poll_line(&mut self) -> Option<String>;
}

/// Recognized console commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Stats,
    Health,
    ConfigShow,
    Connect,
    Disconnect,
    Restart,
    Help,
}

impl Command {
    /// Parse one input line. `None` for blank lines; `Err` echoes the
    /// offending token for the error report.
    pub fn parse(line: &str) -> Option<Result<Command, String>> {
        let upper = line.trim().to_uppercase();
        if upper.is_empty() {
            return None;
        }

        let mut words = upper.split_whitespace();
        let head = words.next()?;
        let cmd = match head {
            "STATUS" => Command::Status,
            "STATS" => Command::Stats,
            "HEALTH" => Command::Health,
            "CONFIG" => match words.next() {
                Some("SHOW") => Command::ConfigShow,
                other => {
                    return Some(Err(format!(
                        "CONFIG {} (usage: CONFIG SHOW)",
                        other.unwrap_or("")
                    )))
                }
            },
            "CONNECT" => Command::Connect,
            "DISCONNECT" => Command::Disconnect,
            "RESTART" => Command::Restart,
            "HELP" => Command::Help,
            other => return Some(Err(other.to_string())),
        };
        Some(Ok(cmd))
    }

    pub fn help_text() -> &'static [&'static str] {
        &[
            "STATUS      - link, session and state summary",
            "STATS       - counters since boot",
            "HEALTH      - capture and memory health",
            "CONFIG SHOW - active configuration",
            "CONNECT     - attempt a receiver connection now",
            "DISCONNECT  - close the receiver connection",
            "RESTART     - orderly restart",
            "HELP        - this text",
        ]
    }
}

/// Stdin-backed source for the host binary. A reader thread owns the
/// blocking stdin handle and hands lines over a channel, so the tick loop
/// never blocks on the console.
pub struct StdinSource {
    lines: Receiver<String>,
}

impl StdinSource {
    /// Spawn the reader thread. Failure means running without a console,
    /// never taking the node down.
    pub fn spawn() -> RelayResult<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("console-stdin".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                let mut line = String::new();
                loop {
                    line.clear();
                    match stdin.read_line(&mut line) {
                        Ok(0) => break, // EOF
                        Ok(_) => {
                            if tx.send(line.trim_end().to_string()).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })?;
        Ok(Self { lines: rx })
    }
}

impl CommandSource for StdinSource {
    fn poll_line(&mut self) -> Option<String> {
        match self.lines.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
