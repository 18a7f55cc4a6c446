use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::io::IsTerminal;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::config::ServerArgs;
use crate::signaling::SignalingEnvelope;

#[derive(Parser, Debug)]
#[command(name = "beach-signal")]
#[command(about = "Beach Signal WebRTC signaling relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a fresh random secret suitable for SECRET_KEY
    GenerateSecret,

    /// Connect as a client and print every signal routed to it
    Watch {
        /// Relay base URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Access token for the watching identity
        #[arg(short, long, env = "BEACH_SIGNAL_TOKEN", hide_env_values = true)]
        token: String,

        /// Stop after this many seconds (runs until the relay closes otherwise)
        #[arg(long)]
        duration: Option<u64>,
    },
}

fn watch_url(base: &str, token: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = base.strip_suffix("/ws").unwrap_or(base);
    format!("{base}/ws?token={token}")
}

/// Renders one inbound frame. Frames that parse as signaling envelopes are
/// summarized on a header line; anything else is printed raw.
pub fn format_frame(text: &str, pretty: bool) -> String {
    let Ok(envelope) = serde_json::from_str::<SignalingEnvelope>(text) else {
        return format!("[raw] {text}");
    };
    let sender = envelope
        .user_message
        .sender
        .as_ref()
        .map(|s| s.as_str())
        .unwrap_or("?");
    let body = if pretty {
        serde_json::to_string_pretty(&envelope)
    } else {
        serde_json::to_string(&envelope)
    }
    .unwrap_or_else(|_| text.to_string());
    format!("[{}] from {}\n{}", envelope.kind.as_str(), sender, body)
}

pub async fn run_watch_client(url: String, token: String, duration: Option<u64>) -> Result<()> {
    let ws_url = watch_url(&url, &token);
    debug!("Connecting to {}", watch_url(&url, "<redacted>"));

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(ws_url.as_str())).await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();
    let pretty = std::io::stdout().is_terminal();
    info!("watching signals on {}", url);

    let watch = async {
        while let Some(frame) = read.next().await {
            match frame? {
                Message::Text(text) => println!("{}", format_frame(text.as_str(), pretty)),
                Message::Ping(payload) => {
                    // Pongs do not count as activity; the relay still closes idle watchers.
                    write.send(Message::Pong(payload)).await?;
                }
                Message::Close(frame) => {
                    match frame {
                        Some(frame) => println!(
                            "relay closed: {} {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        ),
                        None => println!("relay closed"),
                    }
                    break;
                }
                _ => {}
            }
        }
        Ok::<_, anyhow::Error>(())
    };

    match duration {
        Some(secs) => match timeout(Duration::from_secs(secs), watch).await {
            Ok(result) => result,
            Err(_) => {
                debug!("watch window elapsed");
                Ok(())
            }
        },
        None => watch.await,
    }
}
