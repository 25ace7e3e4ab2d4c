//! CLI commands for agentmesh using clap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{load_settings_from, load_settings_or_default, Settings};
use crate::container::Container;
use crate::demo::{self, PingInitiator, PingResponder, Transcript};
use crate::protocol::AgentId;

/// agentmesh - distributed multi-agent runtime.
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(version)]
#[command(about = "agentmesh - agents, containers and a shared address directory", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.agentmesh/settings.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a container and keep it running until interrupted
    Start {
        /// Host the address directory
        #[arg(long, default_value_t = false)]
        main: bool,

        /// Host to listen on
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Address of the main container
        #[arg(long)]
        main_address: Option<String>,

        /// Agent the regular node's initiator plays ping-pong with
        #[arg(long, default_value_t = 1)]
        peer: AgentId,
    },

    /// Run a single-process demo on a main container
    Demo {
        #[command(subcommand)]
        mode: DemoCommand,
    },

    /// Print the effective settings
    Config,
}

#[derive(Subcommand)]
pub enum DemoCommand {
    /// Mailbox ping-pong between two agents
    Async {
        #[arg(long, default_value_t = demo::DEFAULT_ROUNDS)]
        rounds: u32,
    },
    /// Ping-pong over a synchronous channel
    Sync {
        #[arg(long, default_value_t = demo::DEFAULT_ROUNDS)]
        rounds: u32,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let settings = self.settings()?;
        match &self.command {
            Command::Start {
                main,
                host,
                port,
                main_address,
                peer,
            } => {
                let settings = apply_overrides(settings, *main, host.as_deref(), *port, main_address.as_deref())?;
                cmd_start(settings, *peer).await
            }
            Command::Demo { mode } => cmd_demo(settings, mode).await,
            Command::Config => cmd_config(&settings),
        }
    }

    fn settings(&self) -> Result<Settings> {
        match &self.config {
            Some(path) => load_settings_from(path)
                .with_context(|| format!("Failed to load settings from {}", path.display())),
            None => Ok(load_settings_or_default()),
        }
    }
}

fn apply_overrides(
    mut settings: Settings,
    main: bool,
    host: Option<&str>,
    port: Option<u16>,
    main_address: Option<&str>,
) -> Result<Settings> {
    if host.is_some() || port.is_some() {
        let (current_host, current_port) = settings
            .node
            .listen_address
            .rsplit_once(':')
            .map(|(h, p)| (h.to_string(), p.to_string()))
            .ok_or_else(|| anyhow::anyhow!("Invalid listen address {}", settings.node.listen_address))?;
        let host = host.map(str::to_string).unwrap_or(current_host);
        let port = port.map(|p| p.to_string()).unwrap_or(current_port);
        settings.node.listen_address = format!("{}:{}", host, port);
    }
    if main {
        settings.node.is_main = true;
    }
    if let Some(address) = main_address {
        settings.node.main_address = address.to_string();
    }
    Ok(settings)
}

// Command implementations

async fn cmd_start(settings: Settings, peer: AgentId) -> Result<()> {
    let container = Container::start(settings).await?;
    println!(
        "Container {} listening on {} ({})",
        container.id(),
        container.local_address(),
        if container.is_main() { "main" } else { "regular" }
    );

    let transcript = Transcript::default();
    let agent = container.add_agent().await?;
    let agent_id = agent.id();
    if container.is_main() {
        demo::launch(&container, agent, PingResponder::new(transcript))?;
        println!("Agent {} answers mailbox pings", agent_id);
    } else {
        demo::launch(&container, agent, PingInitiator::new(peer, demo::DEFAULT_ROUNDS, transcript))?;
        println!("Agent {} plays ping-pong with agent {}", agent_id, peer);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    container.shutdown().await;
    Ok(())
}

async fn cmd_demo(mut settings: Settings, mode: &DemoCommand) -> Result<()> {
    settings.node.is_main = true;
    let container = Container::start(settings).await?;
    let timeout = Duration::from_secs(60);

    let (initiator, responder) = match mode {
        DemoCommand::Async { rounds } => demo::run_async_local(&container, *rounds, timeout).await?,
        DemoCommand::Sync { rounds } => demo::run_sync_local(&container, *rounds, timeout).await?,
    };
    container.shutdown().await;

    println!("Initiator received: {}", initiator.lines().join(", "));
    println!("Responder received: {}", responder.lines().join(", "));
    if responder.count(demo::STOP) == 0 {
        anyhow::bail!("Demo did not finish within {}s", timeout.as_secs());
    }
    Ok(())
}

fn cmd_config(settings: &Settings) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}
