use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use drink_cam_relay::config::{Config, PORT_ENV};
use drink_cam_relay::TopicHub;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "drink-cam-relay", about = "Signaling relay for drink-cam rooms")]
struct Cli {
    #[arg(long, short = 'p', env = PORT_ENV)]
    port: Option<u16>,

    #[arg(long)]
    bind: Option<std::net::IpAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to warn, with our own lifecycle at info, when RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,drink_cam_relay=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let addr = SocketAddr::new(config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("drink-cam relay listening on {}", listener.local_addr()?);

    axum::serve(listener, drink_cam_relay::router(TopicHub::new()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    info!("drink-cam relay stopped");
    Ok(())
}
