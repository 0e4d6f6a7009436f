use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::{unbounded, Sender};
use tracing_subscriber::EnvFilter;

use throng::config::Config;
use throng::host::{HostEvent, LogBroadcast, LogPresence};
use throng::runtime::Runtime;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,throng=debug")),
        )
        .init();

    let config = Config::load();
    let (event_tx, event_rx) = unbounded();

    let runtime = Arc::new(Runtime::bootstrap(
        config,
        Arc::new(LogPresence),
        Arc::new(LogBroadcast),
    ));

    tracing::info!("Standalone mode: feed host events on stdin ('join NAME', 'leave NAME', 'NAME: text')");
    spawn_stdin_adapter(event_tx);

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    rt.block_on(runtime.run(event_rx));
    Ok(())
}

/// Minimal host adapter: one line of stdin per host event. Closing stdin
/// shuts the service down.
fn spawn_stdin_adapter(event_tx: Sender<HostEvent>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event = if let Some(name) = line.strip_prefix("join ") {
                HostEvent::ParticipantJoined {
                    name: name.trim().to_string(),
                }
            } else if let Some(name) = line.strip_prefix("leave ") {
                HostEvent::ParticipantLeft {
                    name: name.trim().to_string(),
                }
            } else if let Some((sender, text)) = line.split_once(": ") {
                HostEvent::Chat {
                    sender: sender.trim().to_string(),
                    text: text.trim().to_string(),
                }
            } else {
                tracing::debug!("Unrecognized host line: {}", line);
                continue;
            };

            if event_tx.send(event).is_err() {
                break;
            }
        }
    });
}
