use clap::Parser;
use log::info;
use monitor::classifier::ViewerCapability;
use monitor::network::{MonitorClient, MonitorConfig};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node agent address to connect to
    #[arg(short = 'a', long, default_value = "127.0.0.1:8080")]
    agent: String,

    /// Key of the instance to monitor
    #[arg(short = 'i', long)]
    instance: String,

    /// View as an administrator (shows remediation hints in alerts)
    #[arg(long)]
    admin: bool,

    /// Seconds between snapshot polls
    #[arg(short = 'p', long, default_value = "30")]
    poll_secs: u64,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Ask the agent to reinstall the instance after connecting
    #[arg(long)]
    reinstall: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting monitor...");
    info!("Agent: {}, instance: {}", args.agent, args.instance);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }
    info!("Commands: d = dismiss alert, r = refresh snapshot, q = quit");

    let config = MonitorConfig {
        agent_addr: args.agent,
        instance_key: args.instance,
        capability: if args.admin {
            ViewerCapability::Elevated
        } else {
            ViewerCapability::Standard
        },
        fake_ping_ms: args.fake_ping,
        poll_interval: Duration::from_secs(args.poll_secs.max(1)),
        reinstall_on_start: args.reinstall,
        ..MonitorConfig::default()
    };

    let mut client = MonitorClient::new(config).await?;
    client.run().await?;

    Ok(())
}
