//! # Dreamweave Gateway Binary
//!
//! Entry point for the gateway server.
//!
//! ```bash
//! # Default configuration path (config.toml, optional)
//! dreamweave-gateway
//!
//! # Explicit configuration
//! dreamweave-gateway --config deploy/gateway.toml
//!
//! # Host/port overrides
//! dreamweave-gateway --host 0.0.0.0 --port 8080
//! ```
//!
//! Environment overrides: `GATEWAY_HOST`, `GATEWAY_PORT`, `GATEWAY_TIMEOUT`,
//! and `<PROVIDER>_API_KEY` per configured provider. Configuration errors
//! are fatal: the process exits rather than serving with a bad config.

use clap::Parser;
use dreamweave_gateway::{config::Config, server::create_server};
use std::net::SocketAddr;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Port to listen on (overrides configuration)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host address to bind (overrides configuration)
    #[arg(long)]
    host: Option<String>,

    /// Logging filter, e.g. info or dreamweave_gateway=debug
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    // Fatal on invalid configuration; a missing file at the default path
    // falls back to built-in defaults with a local Ollama provider.
    let mut config = Config::load_or_default(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let app = create_server(config).await?;

    tracing::info!("dreamweave gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install shutdown handler: {e}");
        return;
    }
    tracing::info!("shutdown signal received");
}
