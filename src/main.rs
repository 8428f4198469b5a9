//! Idemgate - Idempotency enforcement gateway
//!
//! At-most-once execution and response replay for HTTP APIs.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use idemgate::{
    cli::Cli,
    config::Config,
    server::{Server, demo_router},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        wait_policy = ?config.idempotency.wait_policy,
        default_ttl_seconds = config.idempotency.default_ttl_seconds,
        "Starting idemgate"
    );

    let server = Server::new(config);
    if let Err(e) = server.run(demo_router()).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
