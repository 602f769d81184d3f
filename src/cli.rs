use crate::config::{ChatConfig, Deployment, ProtocolVariant};
use crate::error::{Error, Result};
use crate::media::StaticTrackBackend;
use crate::pairing::{ChatClient, ChatCommand, ChatStatus};
use crate::peer::connection::RtcPeerFactory;
use crate::signaling::WebSocketConnector;
use crate::utils::random_hex;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sayonara")]
#[command(version)]
#[command(about = "Anonymous one-to-one video chat client")]
pub struct Cli {
    /// Display name sent to the relay
    #[arg(long, env = "SAYONARA_NAME")]
    pub name: Option<String>,

    /// Relay WebSocket base URL
    #[arg(long)]
    pub relay: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Use the production relay
    #[arg(long)]
    pub prod: bool,

    /// Talk to a relay that tags messages with "event"
    #[arg(long)]
    pub evented: bool,
}

impl Cli {
    pub fn chat_config(&self) -> Result<ChatConfig> {
        let mut config = match &self.config {
            Some(path) => ChatConfig::load(path)?,
            None => ChatConfig::from_env()?,
        };
        if self.prod {
            config.relay_url = Deployment::Production.relay_url().to_string();
        }
        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        if self.evented {
            config.protocol = ProtocolVariant::Evented;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn identity(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("Guest-{}", random_hex(3)),
        }
    }
}

fn parse_command(line: &str) -> Option<ChatCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "next" | "skip" | "n" => Some(ChatCommand::Skip),
        "stop" | "exit" | "quit" | "q" => Some(ChatCommand::Stop),
        "reconnect" | "r" => Some(ChatCommand::Reconnect),
        _ => None,
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.chat_config()?;
    let identity = cli.identity();
    info!("Starting as {identity}, relay {}", config.relay_url);

    let connector = Arc::new(WebSocketConnector::new(&config.relay_url)?);
    let factory = Arc::new(RtcPeerFactory::new(config.ice_servers.clone()));

    let handle = match ChatClient::start(
        &identity,
        config,
        connector,
        factory,
        Arc::new(StaticTrackBackend),
    )
    .await
    {
        Ok(handle) => handle,
        Err(e @ Error::MediaAccess(_)) => {
            println!("{}", ChatStatus::MediaUnavailable);
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let mut view = handle.view();
    let printer = tokio::spawn(async move {
        let mut last = String::new();
        while view.changed().await.is_ok() {
            let status = view.borrow_and_update().status.to_string();
            if status != last {
                println!("[{}] {status}", chrono::Local::now().format("%H:%M:%S"));
                last = status;
            }
        }
    });

    println!("Commands: next, stop, reconnect");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(ChatCommand::Stop) => break,
                    Some(command) => handle.command(command),
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command `{}`", line.trim()),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    handle.stop();
    handle.join().await;
    let _ = printer.await;
    Ok(())
}
