use anyhow::Context;
use clap::Parser;
use eventstream_gateway::{
    client::{HttpUpstream, StaticCredentials},
    config::{LogFormat, ProtocolMode, ProxyConfig},
    handler::{AppState, router},
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "eventstream-gateway",
    about = "Event-stream to Anthropic/OpenAI streaming gateway"
)]
struct Args {
    /// Path to a TOML config file; environment variables are used otherwise
    #[arg(long)]
    config: Option<String>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<String>,

    /// Reject out-of-order outbound events instead of correcting them
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::from_env()?,
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if args.strict {
        config.stream.protocol_mode = ProtocolMode::Strict;
    }
    config.validate()?;

    init_tracing(config.server.log_format);

    tracing::info!(
        listen = %config.server.listen_addr,
        upstream = %config.upstream.endpoint,
        protocol_mode = ?config.stream.protocol_mode,
        "Starting eventstream gateway"
    );

    let credentials = Arc::new(StaticCredentials::new(config.upstream.token.clone()));
    let provider = Arc::new(HttpUpstream::new(&config.upstream, credentials)?);
    let listen_addr = config.server.listen_addr.clone();
    let state = Arc::new(AppState::new(config, provider));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;

    tracing::info!(addr = %listen_addr, "Gateway ready");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!(usage = %state.stats.snapshot(), "Gateway stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
