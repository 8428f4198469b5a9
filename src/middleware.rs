//! Request admission and dispatch
//!
//! The axum middleware that fronts the idempotency layer. Admission rules,
//! in order:
//!
//! 1. Methods outside `enabled_methods` pass through untouched.
//! 2. Requests without an `Idempotency-Key` header pass through untouched.
//! 3. The key must be 1-255 printable ASCII chars; otherwise 422.
//! 4. Bodies over `max_body_bytes` are rejected with 413 before any
//!    fingerprint or store work.
//! 5. The fingerprint and trace id are derived and the request is handed
//!    to the state engine; the buffered body is made available to the
//!    downstream handler exactly once.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::json;
use tracing::{debug, error};

use crate::config::IdempotencyConfig;
use crate::engine::{Outcome, StateEngine};
use crate::error::Error;
use crate::fingerprint::fingerprint;
use crate::record::StoredResponse;
use crate::replay::{self, IDEMPOTENCY_KEY_HEADER};
use crate::stats::IdempotencyStats;
use crate::store::IdempotencyStore;
use crate::trace;

/// Request header carrying a client-requested TTL in seconds.
pub const IDEMPOTENCY_TTL_HEADER: &str = "idempotency-ttl";

/// Shared state for the idempotency middleware.
#[derive(Clone)]
pub struct IdempotencyService {
    engine: Arc<StateEngine>,
    config: Arc<IdempotencyConfig>,
    stats: Arc<IdempotencyStats>,
}

impl IdempotencyService {
    /// Build the middleware state over `store` configured per `config`.
    #[must_use]
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            engine: Arc::new(StateEngine::new(store, &config)),
            config: Arc::new(config),
            stats: Arc::new(IdempotencyStats::new()),
        }
    }

    /// Counters tracked by this middleware instance.
    #[must_use]
    pub fn stats(&self) -> &IdempotencyStats {
        &self.stats
    }

    /// Layer configuration.
    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }
}

/// Axum middleware enforcing at-most-once execution per idempotency key.
///
/// Apply with `axum::middleware::from_fn_with_state`; see
/// [`crate::server`] for the wiring.
pub async fn idempotency_middleware(
    State(service): State<IdempotencyService>,
    request: Request,
    next: Next,
) -> Response {
    // Safe methods and keyless requests bypass the layer entirely.
    if !service.config.applies_to(request.method()) {
        return next.run(request).await;
    }
    let Some(raw_key) = request.headers().get(IDEMPOTENCY_KEY_HEADER) else {
        return next.run(request).await;
    };

    let key = match raw_key.to_str() {
        Ok(key) => key.to_string(),
        Err(_) => {
            service.stats.record_rejected();
            return invalid_key_response("idempotency key is not ASCII");
        }
    };
    if let Err(reason) = validate_key(&key) {
        service.stats.record_rejected();
        return invalid_key_response(reason);
    }

    let ttl = requested_ttl(request.headers(), &service.config);
    let trace_id = trace::extract(request.headers()).unwrap_or_else(trace::generate);

    // Buffer the body, bounded by the configured cap, to fingerprint it.
    let limit = if service.config.max_body_bytes == 0 {
        usize::MAX
    } else {
        service.config.max_body_bytes
    };
    if content_length_exceeds(request.headers(), limit) {
        service.stats.record_rejected();
        return too_large_response(&key, limit);
    }
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            service.stats.record_rejected();
            return too_large_response(&key, limit);
        }
    };

    let digest = fingerprint(
        parts.method.as_str(),
        parts.uri.path(),
        parts.uri.query(),
        &parts.headers,
        &body_bytes,
        &service.config.fingerprint_headers,
    );
    debug!(key = %key, fingerprint = %digest, trace_id = %trace_id, "Admitted idempotent request");
    service.stats.record_admission();

    // Rebuild the request with the buffered body for the handler.
    let request = Request::from_parts(parts, Body::from(body_bytes));
    let handler = move || capture_handler(next, request);

    match service
        .engine
        .handle(&key, &digest, ttl, Some(trace_id), handler)
        .await
    {
        Ok(Outcome::Executed(stored)) => {
            service.stats.record_execution();
            replay::first_response(&stored, &key)
        }
        Ok(Outcome::Replayed(stored)) => {
            service.stats.record_replay();
            replay::replay_response(&stored, &key, service.config.strip_set_cookie)
        }
        Ok(Outcome::Conflict) => {
            service.stats.record_conflict();
            conflict_response(&key)
        }
        Ok(Outcome::InProgress { retry_after }) => {
            service.stats.record_conflict();
            in_progress_response(&key, retry_after)
        }
        Ok(Outcome::TimedOut { retry_after }) => {
            service.stats.record_timeout();
            timeout_response(&key, retry_after, service.config.timeout_status())
        }
        Err(e) => {
            error!(key = %key, error = %e, "Idempotency layer error");
            error_response(&e)
        }
    }
}

/// Run the downstream handler and capture its response for storage.
async fn capture_handler(next: Next, request: Request) -> StoredResponse {
    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    // The artifact must hold the full body; bodies here are the
    // application's own responses, not untrusted input.
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_else(|_| Bytes::new());
    StoredResponse::capture(parts.status, &parts.headers, bytes)
}

/// Validate a client-supplied idempotency key.
///
/// Keys are opaque: 1-255 characters, printable ASCII only (which excludes
/// CR, LF, and other control characters).
pub fn validate_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("idempotency key must not be empty");
    }
    if key.len() > 255 {
        return Err("idempotency key exceeds 255 characters");
    }
    if !key.chars().all(|c| matches!(c, ' '..='~')) {
        return Err("idempotency key must be printable ASCII");
    }
    Ok(())
}

/// Resolve the record TTL: the client's `Idempotency-TTL` clamped into the
/// configured band, or the configured default. Unparseable values are
/// ignored.
fn requested_ttl(headers: &HeaderMap, config: &IdempotencyConfig) -> std::time::Duration {
    headers
        .get(IDEMPOTENCY_TTL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map_or_else(|| config.default_ttl(), |seconds| config.clamp_ttl(seconds))
}

/// Fast-path 413 on a declared content length over the cap.
fn content_length_exceeds(headers: &HeaderMap, limit: usize) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .is_some_and(|length| length > limit)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, axum::Json(body)).into_response()
}

fn with_key(mut response: Response, key: &str) -> Response {
    if let Ok(value) = HeaderValue::try_from(key) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(IDEMPOTENCY_KEY_HEADER), value);
    }
    response
}

fn with_retry_after(mut response: Response, seconds: u64) -> Response {
    if let Ok(value) = HeaderValue::try_from(seconds.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn invalid_key_response(reason: &str) -> Response {
    json_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        json!({ "error": reason, "code": "invalid_idempotency_key" }),
    )
}

fn too_large_response(key: &str, limit: usize) -> Response {
    let response = json_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        json!({
            "error": format!("request body exceeds {limit} bytes"),
            "code": "payload_too_large",
        }),
    );
    with_key(response, key)
}

fn conflict_response(key: &str) -> Response {
    let response = json_response(
        StatusCode::CONFLICT,
        json!({
            "error": "idempotency key reused with a different request fingerprint",
            "code": "fingerprint_mismatch",
        }),
    );
    with_key(response, key)
}

fn in_progress_response(key: &str, retry_after: u64) -> Response {
    let response = json_response(
        StatusCode::CONFLICT,
        json!({
            "error": "a request with this idempotency key is still in progress",
            "code": "in_progress",
        }),
    );
    with_retry_after(with_key(response, key), retry_after)
}

fn timeout_response(key: &str, retry_after: u64, status: StatusCode) -> Response {
    let response = json_response(
        status,
        json!({
            "error": "timed out waiting for the in-progress request to finish",
            "code": "wait_timeout",
        }),
    );
    with_retry_after(with_key(response, key), retry_after)
}

fn error_response(error: &Error) -> Response {
    json_response(
        error.status(),
        json!({ "error": error.to_string(), "code": error.code() }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── validate_key ──────────────────────────────────────────────────────────

    #[test]
    fn plain_keys_are_accepted() {
        assert!(validate_key("order-2024-11-05-0001").is_ok());
        assert!(validate_key("a").is_ok());
        assert!(validate_key(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(validate_key("").is_err());
    }

    #[test]
    fn oversized_key_is_rejected() {
        assert!(validate_key(&"x".repeat(256)).is_err());
    }

    #[test]
    fn control_characters_are_rejected() {
        assert!(validate_key("\r\n").is_err());
        assert!(validate_key("key\nwith-newline").is_err());
        assert!(validate_key("key\twith-tab").is_err());
        assert!(validate_key("\u{7f}").is_err());
    }

    #[test]
    fn non_ascii_keys_are_rejected() {
        assert!(validate_key("clé").is_err());
    }

    // ── requested_ttl ─────────────────────────────────────────────────────────

    fn config_with_band(min: u64, max: u64) -> IdempotencyConfig {
        IdempotencyConfig {
            min_ttl_seconds: min,
            max_ttl_seconds: max,
            default_ttl_seconds: 100,
            ..Default::default()
        }
    }

    #[test]
    fn absent_ttl_header_uses_the_default() {
        let config = config_with_band(1, 1000);
        let ttl = requested_ttl(&HeaderMap::new(), &config);
        assert_eq!(ttl, std::time::Duration::from_secs(100));
    }

    #[test]
    fn requested_ttl_is_clamped() {
        let config = config_with_band(10, 50);
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_TTL_HEADER, HeaderValue::from_static("9999"));
        assert_eq!(
            requested_ttl(&headers, &config),
            std::time::Duration::from_secs(50)
        );
    }

    #[test]
    fn garbage_ttl_header_falls_back_to_the_default() {
        let config = config_with_band(1, 1000);
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_TTL_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(
            requested_ttl(&headers, &config),
            std::time::Duration::from_secs(100)
        );
    }

    // ── content_length_exceeds ────────────────────────────────────────────────

    #[test]
    fn declared_length_over_the_cap_is_detected() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("2048"));
        assert!(content_length_exceeds(&headers, 1024));
        assert!(!content_length_exceeds(&headers, 4096));
    }

    #[test]
    fn missing_length_is_not_rejected_up_front() {
        assert!(!content_length_exceeds(&HeaderMap::new(), 1024));
    }
}
