//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Idempotency enforcement gateway - at-most-once execution for HTTP APIs
#[derive(Parser, Debug)]
#[command(name = "idemgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "IDEMGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "IDEMGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "IDEMGATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "IDEMGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "IDEMGATE_LOG_FORMAT")]
    pub log_format: Option<String>,
}
