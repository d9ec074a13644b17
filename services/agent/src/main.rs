// agent: Subscribes to the master's broadcast channel, executes named
// actions, and pushes replies to the collector channel.

use clap::Parser;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "agent", version, about = "fleetbus worker agent")]
struct Args {
    /// Broadcast channel to subscribe to, e.g. tcp://127.0.0.1:1234
    #[arg(long)]
    subscribe_url: String,
    /// Collector channel to push replies to, e.g. tcp://127.0.0.1:1235
    #[arg(long)]
    push_url: String,
    /// Stable agent identity; a fresh UUID is minted when omitted.
    #[arg(long)]
    agent_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let agent_id = args
        .agent_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_id = %agent_id,
        "agent starting"
    );

    match agent::run(&args.subscribe_url, &args.push_url, agent_id).await {
        Ok(()) => {
            // The broadcast stream only ends when the master is gone.
            eprintln!("FATAL: broadcast stream ended");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    }
}
