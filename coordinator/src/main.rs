// coordinator/src/main.rs

//! Dataset Cache RW Coordinator
//!
//! This binary runs the reader/writer lock server that dataset cache clients
//! use to build each cache at most once across machines.
//!
//! # Usage
//!
//! ```bash
//! # Start coordinator with default settings
//! rw-coordinator
//!
//! # Serve wss:// on a custom port
//! rw-coordinator --port 10443 --tls-cert server.pem --tls-key server.key
//!
//! # Allow stopping the server with `curl -X POST http://host:port/shutdown`
//! rw-coordinator --enable-shutdown-endpoint
//! ```

use std::sync::Arc;

use cache_core::coordinator::{tls, CoordinatorServer, ServerOptions};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Dataset Cache RW Coordinator
#[derive(Parser, Debug)]
#[command(name = "rw-coordinator")]
#[command(about = "Reader/writer lock coordinator for the dataset cache")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "10245")]
    port: u16,

    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,

    /// PEM certificate chain; serves wss:// together with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<std::path::PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<std::path::PathBuf>,

    /// Expose the /shutdown endpoint
    #[arg(long)]
    enable_shutdown_endpoint: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(Arc::new(tls::server_config(cert, key)?)),
        _ => None,
    };

    tracing::info!("Starting RW coordinator");
    tracing::info!("  TLS: {}", if tls.is_some() { "enabled" } else { "disabled" });
    tracing::info!("  Shutdown endpoint: {}", args.enable_shutdown_endpoint);

    let options = ServerOptions {
        tls,
        enable_shutdown_endpoint: args.enable_shutdown_endpoint,
    };
    let server = CoordinatorServer::bind((args.address.as_str(), args.port), options)?;

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for CTRL+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down coordinator...");
        })
        .await?;

    Ok(())
}
