use agent::instance::{parse_instance_arg, InstanceRegistry};
use agent::network::{Server, ServerConfig, ServerMessage};
use clap::Parser;
use log::{error, info};
use shared::DEFAULT_AGENT_PORT;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Node agent hosting simulated game server instances")]
struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value_t = DEFAULT_AGENT_PORT)]
    port: u16,
    /// Milliseconds between scenario ticks
    #[clap(short, long, default_value = "250")]
    tick_ms: u64,
    /// Maximum number of attached monitors
    #[clap(short, long, default_value = "32")]
    max_sessions: usize,
    /// Hosted instance as key=scenario (steady, install, install-failed,
    /// suspended, transfer, maintenance, restore, pid-limit). Repeatable.
    #[clap(short, long = "instance", default_value = "srv-1=pid-limit")]
    instances: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let args = Args::parse();

    let mut instances = InstanceRegistry::new();
    for arg in &args.instances {
        let (key, scenario) = parse_instance_arg(arg)?;
        instances.add(key, scenario);
    }

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        tick_duration: Duration::from_millis(args.tick_ms.max(1)),
        max_sessions: args.max_sessions,
        ..ServerConfig::default()
    };
    let mut server = Server::new(config, instances).await?;
    let shutdown = server.shutdown_sender();

    let agent = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Agent error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    let _ = shutdown.send(ServerMessage::Shutdown);
    agent.await?;

    Ok(())
}
