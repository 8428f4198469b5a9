//! Idemgate Library
//!
//! Idempotency enforcement layer for HTTP APIs: for any two requests
//! bearing the same `Idempotency-Key` within a configured window, the
//! downstream handler executes at most once and later callers observe an
//! identical replayed response - or a well-defined conflict when the two
//! requests disagree on content.
//!
//! # Components
//!
//! - **Fingerprint**: canonicalizes a request into a SHA-256 digest that
//!   tells duplicate retries apart from conflicting key reuse.
//! - **Store**: keyed records with atomic lease acquisition, completion,
//!   and TTL expiry; in-process implementation included.
//! - **Replay**: rebuilds a stored response with header filtering and
//!   replay annotations.
//! - **StateEngine**: the per-key `NEW → RUNNING → COMPLETED | FAILED`
//!   state machine with single-flight execution and a wait policy.
//! - **Middleware**: axum admission layer - key validation, body caps,
//!   fingerprinting, dispatch.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod middleware;
pub mod record;
pub mod replay;
pub mod server;
pub mod stats;
pub mod store;
pub mod trace;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
