// master: Owns both bus listeners and serves the operator HTTP front.

use clap::Parser;
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "master", version, about = "fleetbus coordinator")]
struct Args {
    /// HTTP listen host for the operator front.
    #[arg(long, default_value = "127.0.0.1")]
    http_host: String,
    /// HTTP listen port for the operator front.
    #[arg(long, default_value_t = 8080)]
    http_port: u16,
    /// Broadcast channel bind address, e.g. tcp://0.0.0.0:1234
    #[arg(long, default_value = "tcp://127.0.0.1:1234")]
    publish_url: String,
    /// Collector channel bind address, e.g. tcp://0.0.0.0:1235
    #[arg(long, default_value = "tcp://127.0.0.1:1235")]
    pull_url: String,
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
    info!(version = env!("CARGO_PKG_VERSION"), "master starting");

    let fanout = master::PublishFanout::bind(&args.publish_url)
        .await
        .unwrap_or_else(|e| {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        });
    let (pull, collector) = master::collector::bind(&args.pull_url)
        .await
        .unwrap_or_else(|e| {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        });
    info!(
        publish = %fanout.local_addr(),
        pull = %pull.local_addr(),
        "bus listeners bound"
    );

    let publish = fanout.handle();
    tokio::spawn(fanout.run());
    tokio::spawn(pull.run());

    let state = master::AppState::new(master::Engine::new(publish, collector));
    let router = master::build_router(state);

    let http_addr = format!("{}:{}", args.http_host, args.http_port);
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("FATAL: failed to bind {http_addr}: {e}");
            std::process::exit(1);
        });
    info!(http = %http_addr, "operator front listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await
    .unwrap_or_else(|e| {
        eprintln!("FATAL: http server error: {e}");
        std::process::exit(1);
    });
}
