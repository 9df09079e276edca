use anyhow::Result;
use clap::{Parser, Subcommand};
use meshlink::mesh::{relay_task, EngineSettings, MeshEngine, RtcTransportFactory};
use meshlink::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Peer-to-peer mesh client over relay-signaled data channels", long_about = None)]
struct Cli {
    #[arg(long, default_value = "./meshlink.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the relay and join the mesh
    Start {
        /// Relay URL, overrides the config file
        #[arg(long)]
        relay: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Start { relay } => {
            let relay_url = relay.unwrap_or_else(|| config.relay.url.clone());

            let settings = EngineSettings {
                channel_label: config.mesh.channel_label.clone(),
                role_tag: config.relay.role_tag.clone(),
                negotiation_timeout: Duration::from_millis(config.mesh.negotiation_timeout_ms),
            };
            let factory = Arc::new(RtcTransportFactory::new(config.ice.stun_servers.clone()));
            let mut engine = MeshEngine::new(settings, factory);

            let handle = engine.handle();
            let outbound = engine.take_outbound();
            let events = engine.events_sender();
            let shutdown_rx = engine.shutdown_watch();
            let reconnect = Duration::from_millis(config.relay.reconnect_delay_ms);

            tokio::spawn(relay_task(
                relay_url.clone(),
                events,
                outbound,
                shutdown_rx,
                reconnect,
            ));

            // Re-render the peer list on every status change
            let mut peers = engine.peers();
            tokio::spawn(async move {
                while peers.changed().await.is_ok() {
                    let snapshot = peers.borrow().clone();
                    println!("Connected peers ({}):", snapshot.len());
                    for peer in &snapshot {
                        println!("  {}: {}", peer.peer_id, peer.status);
                    }
                }
            });

            // Print inbound payloads
            let mut messages = engine.messages();
            tokio::spawn(async move {
                while let Ok((peer, text)) = messages.recv().await {
                    println!("[{}] {}", peer.short(), text);
                }
            });

            println!("Joining mesh via {}", relay_url);

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.shutdown();
                }
            });

            engine.run().await?;
        }
    }

    Ok(())
}
