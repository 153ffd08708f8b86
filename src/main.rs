//! Parley node binary.
//!
//! Runs the chat service as a long-lived process. Peer and message
//! events are rendered to the log; an interactive terminal front-end
//! talks to the same service through its event/command channels.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use parley::config::Config;
use parley::protocol::PresenceStatus;
use parley::service::{ChatEvent, ChatService, ServiceError};

#[derive(Parser)]
#[command(name = "parley", about = "Serverless LAN chat node")]
struct Cli {
    /// Display name, overriding the config file.
    #[arg(long)]
    username: Option<String>,

    /// Preferred listen port, overriding the config file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load().await {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config, using defaults: {e}");
            Config::default()
        }
    };
    if let Some(username) = cli.username {
        config.username = username;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let mut service = ChatService::new(&config);
    service.start().await?;

    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            render(event);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, leaving the network");
    service.shutdown().await;

    // Give the departure notice and session teardown a moment to flush.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

/// Stand-in for the interactive front-end: one log line per event.
fn render(event: ChatEvent) {
    match event {
        ChatEvent::PeerFound { username, id } => {
            info!("* {username} is on the network ({id})");
        }
        ChatEvent::PeerLost { id } => {
            info!("* peer {id} left the network");
        }
        ChatEvent::PeerConnected { username, .. } => {
            info!("* connected to {username}");
        }
        ChatEvent::PeerDisconnected { id } => {
            info!("* disconnected from {id}");
        }
        ChatEvent::Broadcast {
            username, content, ..
        } => {
            info!("<{username}> {content}");
        }
        ChatEvent::Direct {
            username, content, ..
        } => {
            info!("[dm from {username}] {content}");
        }
        ChatEvent::Typing { username, .. } => {
            info!("* {username} is typing...");
        }
        ChatEvent::Presence {
            username, status, ..
        } => match status {
            PresenceStatus::Joined => info!("* {username} joined the chat"),
            PresenceStatus::Leaving => info!("* {username} is leaving"),
        },
        ChatEvent::Error { message } => {
            error!("{message}");
        }
    }
}
