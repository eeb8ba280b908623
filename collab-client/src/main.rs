//! `collab` -- line-oriented client for the collaboration relay.
//!
//! Every line read from stdin must be a JSON object and is sent to the relay;
//! every message received from other peers is printed to stdout as one JSON
//! line. Logs go to a file so stdout stays machine-readable.
//!
//! ```bash
//! # Interactive session against a local relay
//! cargo run --bin collab -- --host 127.0.0.1 --port 8888
//!
//! # Fire a single message and exit
//! cargo run --bin collab -- --send '{"type":"ping","n":1}'
//! ```

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use collab_client::config::{CliArgs, ClientConfig};
use collab_client::{Message, RelayClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

/// How often the stdin loop checks whether the relay went away.
const LIVENESS_POLL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let client = RelayClient::with_options(print_message, config.client_options());
    if !client.connect(&config.host, config.port).await {
        eprintln!("could not connect to relay at {}:{}", config.host, config.port);
        return ExitCode::FAILURE;
    }

    let code = match cli.send.as_deref() {
        Some(json) => send_once(&client, json).await,
        None => pump_stdin(&client).await,
    };
    client.disconnect().await;
    code
}

/// Message handler: one JSON object per stdout line.
fn print_message(message: Message) {
    let mut stdout = std::io::stdout().lock();
    match serde_json::to_string(&message) {
        Ok(line) => {
            if writeln!(stdout, "{line}").and_then(|()| stdout.flush()).is_err() {
                tracing::warn!("stdout closed, dropping received message");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to render received message"),
    }
}

fn parse_line(line: &str) -> Result<Message, String> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    Message::from_value(value).map_err(|e| e.to_string())
}

async fn send_once(client: &RelayClient, json: &str) -> ExitCode {
    let message = match parse_line(json) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("invalid message: {e}");
            return ExitCode::FAILURE;
        }
    };
    if client.send(&message).await {
        ExitCode::SUCCESS
    } else {
        eprintln!("relay connection lost before the message was sent");
        ExitCode::FAILURE
    }
}

/// Sends stdin lines until EOF or until the relay connection is lost.
async fn pump_stdin(client: &RelayClient) -> ExitCode {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut liveness = tokio::time::interval(LIVENESS_POLL);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(message) => {
                        if !client.send(&message).await {
                            eprintln!("relay connection lost");
                            return ExitCode::FAILURE;
                        }
                    }
                    Err(e) => eprintln!("skipping invalid message: {e}"),
                },
                Ok(None) => return ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("failed to read stdin: {e}");
                    return ExitCode::FAILURE;
                }
            },
            _ = liveness.tick() => {
                if !client.is_connected() {
                    eprintln!("relay closed the connection");
                    return ExitCode::FAILURE;
                }
            }
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("collab.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
