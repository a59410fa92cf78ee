use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use warden_core::{Command, CommandSurface};

use crate::cli::OperatorCommand;
use crate::output;

const PROMPT: &str = "warden> ";

/// One console line: an operator command plus an optional token.
#[derive(Parser, Debug)]
#[command(name = "warden>", no_binary_name = true, disable_version_flag = true)]
struct ConsoleLine {
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: OperatorCommand,
}

pub enum ConsoleAction {
    Execute(Command, Option<String>),
    Help,
    Quit,
}

/// Split a line into words with shell quoting rules.
pub fn split_words(line: &str) -> Result<Vec<String>> {
    match shlex::split(line) {
        Some(words) => Ok(words),
        None => bail!("unterminated quote or trailing escape"),
    }
}

pub fn parse_line(line: &str) -> Result<Option<ConsoleAction>> {
    let words = split_words(line)?;
    match words.first().map(String::as_str) {
        None => return Ok(None),
        Some("quit" | "exit") => return Ok(Some(ConsoleAction::Quit)),
        Some("help") => return Ok(Some(ConsoleAction::Help)),
        Some(_) => {}
    }
    let parsed = ConsoleLine::try_parse_from(words)?;
    Ok(Some(ConsoleAction::Execute(parsed.command.into(), parsed.token)))
}

/// Read operator lines with a line editor on a dedicated thread, so a
/// pending read never holds up runtime shutdown.
pub fn console_lines() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("warden-console".into())
        .spawn(move || {
            // The editor is not Send, so it lives on this thread.
            let mut editor = match DefaultEditor::new() {
                Ok(editor) => editor,
                Err(e) => {
                    output::print_error(&format!("Console unavailable: {e}"));
                    return;
                }
            };
            loop {
                match editor.readline(PROMPT) {
                    Ok(line) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            let _ = editor.add_history_entry(trimmed);
                        }
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(ReadlineError::Interrupted) => {
                        output::print_info("Use `quit` to stop the daemon.");
                    }
                    Err(ReadlineError::Eof) => break,
                    Err(e) => {
                        output::print_error(&format!("Console input failed: {e}"));
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Execute operator lines until `quit`, end of input or shutdown. Returns
/// true only when the operator asked to stop.
pub async fn run(
    surface: Arc<CommandSurface>,
    json: bool,
    mut lines: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> bool {
    let mut quit = false;
    output::print_info("Console ready. Type `help` for commands, `quit` to stop.");
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    debug!("Console input closed");
                    break;
                };
                match parse_line(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleAction::Quit)) => {
                        quit = true;
                        break;
                    }
                    Ok(Some(ConsoleAction::Help)) => {
                        use clap::CommandFactory;
                        let _ = ConsoleLine::command().print_help();
                    }
                    Ok(Some(ConsoleAction::Execute(command, token))) => {
                        match surface.execute(command, token.as_deref()).await {
                            Ok(out) => {
                                if let Err(e) = output::print_output(&out, json) {
                                    output::print_error(&format!("{e:#}"));
                                }
                            }
                            Err(e) => output::print_error(&e.to_string()),
                        }
                    }
                    Err(e) => output::print_error(&format!("{e:#}")),
                }
            }
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    info!("Console closed");
    quit
}
