//! Idempotency records and captured responses
//!
//! The unit of storage is an [`IdempotencyRecord`]: one per idempotency key,
//! created in the `Running` state by an atomic lease reservation and
//! transitioned exactly once to `Completed` or `Failed` by the lease owner.
//! Terminal records carry the captured handler response so later requests
//! with the same key can be served without re-executing the handler.
//!
//! Serialized form (for stores that persist): timestamps are RFC 3339 UTC
//! via `chrono`, the response body is base64 under `body_b64`.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Request state ─────────────────────────────────────────────────────────────

/// State of a request tracked under an idempotency key.
///
/// `NEW` has no variant: it is the absence of a record in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestState {
    /// The handler is executing; the record carries a lease token.
    Running,
    /// The handler returned (any status, including non-2xx).
    Completed,
    /// The handler panicked or timed out; a synthesized artifact is stored.
    Failed,
}

impl RequestState {
    /// Return `true` for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ── Stored response ───────────────────────────────────────────────────────────

/// A captured handler outcome, replayable to later callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code (100-599).
    pub status: u16,
    /// Headers with lowercased names. Order is preserved only for
    /// multiple values of the same name.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Response body bytes, base64 in serialized form.
    #[serde(rename = "body_b64", with = "body_b64")]
    pub body: Bytes,
    /// Wall-clock handler execution time in milliseconds.
    pub execution_time_ms: u64,
}

impl StoredResponse {
    /// Capture a response from its status, headers, and buffered body.
    ///
    /// Header names are lowercased; values that are not valid UTF-8 are
    /// skipped. Multi-valued headers keep their received order.
    #[must_use]
    pub fn capture(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut captured: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            let Ok(value) = value.to_str() else { continue };
            captured
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
        Self {
            status: status.as_u16(),
            headers: captured,
            body,
            execution_time_ms: 0,
        }
    }

    /// Synthesize a minimal `500` artifact for a handler that panicked or
    /// timed out. The artifact is stored as `Failed` and replayed like any
    /// other outcome.
    #[must_use]
    pub fn internal_error(reason: &str) -> Self {
        let body = serde_json::json!({ "error": reason }).to_string();
        let mut headers = BTreeMap::new();
        headers.insert(
            "content-type".to_string(),
            vec!["application/json".to_string()],
        );
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            headers,
            body: Bytes::from(body),
            execution_time_ms: 0,
        }
    }
}

mod body_b64 {
    use super::{BASE64, Bytes};
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ── Idempotency record ────────────────────────────────────────────────────────

/// The record stored under an idempotency key.
///
/// Invariants, upheld by the store:
/// - `Running` records carry a `lease_token` and no `response`.
/// - Terminal records carry a `response` and no `lease_token`.
/// - A record is reachable iff `now < expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Client-supplied idempotency key (1-255 printable ASCII chars).
    pub key: String,
    /// Request fingerprint, 64 lowercase hex chars.
    pub fingerprint: String,
    /// Current request state.
    pub state: RequestState,
    /// Captured response, present for terminal states only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<StoredResponse>,
    /// When the record was created (UTC).
    pub created_at: DateTime<Utc>,
    /// When the record becomes unreachable (UTC, strictly after `created_at`).
    pub expires_at: DateTime<Utc>,
    /// Proof of ownership held by the executor while `Running`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lease_token: Option<String>,
    /// Optional correlation id extracted from the request.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace_id: Option<String>,
}

impl IdempotencyRecord {
    /// Create a fresh `Running` record with a new unique lease token.
    #[must_use]
    pub fn new_running(
        key: &str,
        fingerprint: &str,
        ttl: Duration,
        trace_id: Option<String>,
    ) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(1));
        Self {
            key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            state: RequestState::Running,
            response: None,
            created_at,
            expires_at: created_at + ttl,
            lease_token: Some(Uuid::new_v4().to_string()),
            trace_id,
        }
    }

    /// Return `true` once `expires_at` has been reached.
    ///
    /// An expired record behaves as if absent even before the sweeper
    /// removes it.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whole seconds until `expires_at`, saturating at zero.
    #[must_use]
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((self.expires_at - now).num_seconds()).unwrap_or(0)
    }
}

// ── Lease result ──────────────────────────────────────────────────────────────

/// Outcome of an atomic lease reservation attempt.
#[derive(Debug, Clone)]
pub enum LeaseResult {
    /// No unexpired record existed; a `Running` record was written.
    Acquired {
        /// Token required to transition the record to a terminal state.
        lease_token: String,
    },
    /// An unexpired record already holds the key.
    Held {
        /// The existing record, for the caller to inspect.
        record: IdempotencyRecord,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn sample_response() -> StoredResponse {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.append("Set-Cookie", HeaderValue::from_static("a=1"));
        headers.append("Set-Cookie", HeaderValue::from_static("b=2"));
        StoredResponse::capture(
            StatusCode::CREATED,
            &headers,
            Bytes::from_static(b"{\"id\":\"p-1\"}"),
        )
    }

    // ── RequestState ──────────────────────────────────────────────────────────

    #[test]
    fn running_is_not_terminal() {
        assert!(!RequestState::Running.is_terminal());
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Failed.is_terminal());
    }

    #[test]
    fn state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&RequestState::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }

    // ── StoredResponse ────────────────────────────────────────────────────────

    #[test]
    fn capture_lowercases_names_and_keeps_multi_value_order() {
        let response = sample_response();
        assert_eq!(
            response.headers.get("content-type"),
            Some(&vec!["application/json".to_string()])
        );
        assert_eq!(
            response.headers.get("set-cookie"),
            Some(&vec!["a=1".to_string(), "b=2".to_string()])
        );
    }

    #[test]
    fn body_round_trips_through_base64() {
        let response = sample_response();
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"body_b64\""));
        let decoded: StoredResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn internal_error_is_minimal_json_500() {
        let artifact = StoredResponse::internal_error("handler panicked");
        assert_eq!(artifact.status, 500);
        let body: serde_json::Value = serde_json::from_slice(&artifact.body).unwrap();
        assert_eq!(body["error"], "handler panicked");
    }

    // ── IdempotencyRecord ─────────────────────────────────────────────────────

    #[test]
    fn new_running_holds_lease_and_future_expiry() {
        let record =
            IdempotencyRecord::new_running("k1", "ab".repeat(32).as_str(), Duration::from_secs(60), None);
        assert_eq!(record.state, RequestState::Running);
        assert!(record.lease_token.is_some());
        assert!(record.response.is_none());
        assert!(record.expires_at > record.created_at);
    }

    #[test]
    fn lease_tokens_are_unique() {
        let a = IdempotencyRecord::new_running("k", "f", Duration::from_secs(1), None);
        let b = IdempotencyRecord::new_running("k", "f", Duration::from_secs(1), None);
        assert_ne!(a.lease_token, b.lease_token);
    }

    #[test]
    fn expiry_is_inclusive_at_the_boundary() {
        let record = IdempotencyRecord::new_running("k", "f", Duration::from_secs(60), None);
        assert!(!record.is_expired(record.created_at));
        assert!(record.is_expired(record.expires_at));
        assert!(record.is_expired(record.expires_at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn seconds_until_expiry_saturates_at_zero() {
        let record = IdempotencyRecord::new_running("k", "f", Duration::from_secs(60), None);
        assert!(record.seconds_until_expiry(record.created_at) >= 59);
        assert_eq!(
            record.seconds_until_expiry(record.expires_at + chrono::Duration::seconds(5)),
            0
        );
    }

    #[test]
    fn serialized_record_matches_the_documented_shape() {
        let mut record = IdempotencyRecord::new_running(
            "order-42",
            &"c".repeat(64),
            Duration::from_secs(3600),
            Some("ig-trace".to_string()),
        );
        record.state = RequestState::Completed;
        record.lease_token = None;
        record.response = Some(sample_response());

        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["key"], "order-42");
        assert_eq!(json["state"], "COMPLETED");
        assert!(json["response"]["body_b64"].is_string());
        assert!(json.get("lease_token").is_none());
        // RFC 3339 timestamps
        assert!(json["created_at"].as_str().unwrap().contains('T'));

        let round: IdempotencyRecord = serde_json::from_value(json).unwrap();
        assert_eq!(round, record);
    }
}
