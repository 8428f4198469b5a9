//! Configuration management

use std::path::Path;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Idempotency layer configuration
    pub idempotency: IdempotencyConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Precedence: defaults, then the YAML file, then `IDEMGATE_`-prefixed
    /// environment variables (`__` separates sections, e.g.
    /// `IDEMGATE_SERVER__PORT=9000`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be
    /// parsed, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("IDEMGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        self.idempotency.validate()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Behavior when a concurrent request observes a RUNNING record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WaitPolicy {
    /// Poll until the record reaches a terminal state, then replay.
    #[default]
    Wait,
    /// Return 409 with a `Retry-After` hint immediately.
    NoWait,
}

/// Idempotency layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// HTTP methods the layer engages on. Safe methods pass through.
    pub enabled_methods: Vec<String>,
    /// Record TTL when the client sends no `Idempotency-TTL` header.
    pub default_ttl_seconds: u64,
    /// Lower clamp for client-requested TTLs.
    pub min_ttl_seconds: u64,
    /// Upper clamp for client-requested TTLs.
    pub max_ttl_seconds: u64,
    /// Behavior for concurrent requests on a RUNNING key.
    pub wait_policy: WaitPolicy,
    /// Bound on handler execution and on wait-policy polling.
    pub execution_timeout_seconds: u64,
    /// Maximum request body size; `0` disables the cap.
    pub max_body_bytes: usize,
    /// Header names included in the request fingerprint.
    pub fingerprint_headers: Vec<String>,
    /// Poll interval while waiting on a RUNNING record.
    pub wait_poll_interval_ms: u64,
    /// Interval between expiry sweeps.
    pub cleanup_interval_seconds: u64,
    /// Status returned on a wait timeout: 425 (Too Early) or 503.
    pub timeout_status: u16,
    /// Drop `Set-Cookie` from replayed responses.
    pub strip_set_cookie: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled_methods: ["POST", "PUT", "PATCH", "DELETE"]
                .map(String::from)
                .to_vec(),
            default_ttl_seconds: 86_400,
            min_ttl_seconds: 1,
            max_ttl_seconds: 604_800,
            wait_policy: WaitPolicy::Wait,
            execution_timeout_seconds: 30,
            max_body_bytes: 1_048_576,
            fingerprint_headers: vec!["content-type".to_string(), "content-length".to_string()],
            wait_poll_interval_ms: 100,
            cleanup_interval_seconds: 300,
            timeout_status: 425,
            strip_set_cookie: true,
        }
    }
}

impl IdempotencyConfig {
    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.enabled_methods.is_empty() {
            return Err(Error::Config("enabled_methods must not be empty".to_string()));
        }
        for method in &self.enabled_methods {
            if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(Error::Config(format!("Invalid HTTP method token: {method:?}")));
            }
        }
        if self.default_ttl_seconds == 0 {
            return Err(Error::Config("default_ttl_seconds must be positive".to_string()));
        }
        if self.min_ttl_seconds == 0 || self.min_ttl_seconds > self.max_ttl_seconds {
            return Err(Error::Config(
                "min_ttl_seconds must be positive and not exceed max_ttl_seconds".to_string(),
            ));
        }
        if self.execution_timeout_seconds == 0 {
            return Err(Error::Config(
                "execution_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(Error::Config("wait_poll_interval_ms must be positive".to_string()));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(Error::Config(
                "cleanup_interval_seconds must be positive".to_string(),
            ));
        }
        if !matches!(self.timeout_status, 425 | 503) {
            return Err(Error::Config(format!(
                "timeout_status must be 425 or 503, got {}",
                self.timeout_status
            )));
        }
        Ok(())
    }

    /// Return `true` when the layer engages on `method`.
    #[must_use]
    pub fn applies_to(&self, method: &Method) -> bool {
        self.enabled_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Default record TTL as a `Duration`.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// Clamp a client-requested TTL into the configured band.
    #[must_use]
    pub fn clamp_ttl(&self, requested_seconds: u64) -> Duration {
        Duration::from_secs(requested_seconds.clamp(self.min_ttl_seconds, self.max_ttl_seconds))
    }

    /// Execution/wait timeout as a `Duration`.
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    /// Wait-policy poll interval as a `Duration`.
    #[must_use]
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    /// Expiry sweep interval as a `Duration`.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    /// Status code for wait-policy timeouts.
    #[must_use]
    pub fn timeout_status(&self) -> StatusCode {
        StatusCode::from_u16(self.timeout_status).unwrap_or(StatusCode::TOO_EARLY)
    }
}
