//! Trace correlation ids
//!
//! A trace id is extracted from the first of `X-Request-ID`, `X-Trace-ID`,
//! or `Traceparent` (its trace-id field) present on the request, and stored
//! on the idempotency record for correlation. When none is present a
//! `"ig-"`-prefixed UUID v4 is minted.

use axum::http::HeaderMap;
use uuid::Uuid;

/// Headers inspected for a caller-supplied correlation id, in order.
const TRACE_HEADERS: &[&str] = &["x-request-id", "x-trace-id", "traceparent"];

/// Extract a correlation id from the request headers, if any.
#[must_use]
pub fn extract(headers: &HeaderMap) -> Option<String> {
    for name in TRACE_HEADERS {
        let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if *name == "traceparent" {
            if let Some(trace_id) = traceparent_trace_id(value) {
                return Some(trace_id);
            }
            continue;
        }
        return Some(value.to_string());
    }
    None
}

/// Generate a new gateway trace id: `"ig-<uuid-v4>"`.
#[must_use]
pub fn generate() -> String {
    format!("ig-{}", Uuid::new_v4())
}

/// Pull the 32-hex trace-id field out of a W3C `traceparent` value
/// (`version-traceid-spanid-flags`).
fn traceparent_trace_id(value: &str) -> Option<String> {
    let trace_id = value.split('-').nth(1)?;
    if trace_id.len() == 32 && trace_id.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(trace_id.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn x_request_id_wins_over_the_rest() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-1"));
        headers.insert("x-trace-id", HeaderValue::from_static("trace-1"));
        assert_eq!(extract(&headers), Some("req-1".to_string()));
    }

    #[test]
    fn x_trace_id_is_second_choice() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", HeaderValue::from_static("trace-1"));
        assert_eq!(extract(&headers), Some("trace-1".to_string()));
    }

    #[test]
    fn traceparent_trace_id_field_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "traceparent",
            HeaderValue::from_static("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
        );
        assert_eq!(
            extract(&headers),
            Some("0af7651916cd43dd8448eb211c80319c".to_string())
        );
    }

    #[test]
    fn malformed_traceparent_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", HeaderValue::from_static("not-a-traceparent"));
        assert_eq!(extract(&headers), None);
    }

    #[test]
    fn blank_values_are_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("   "));
        headers.insert("x-trace-id", HeaderValue::from_static("trace-2"));
        assert_eq!(extract(&headers), Some("trace-2".to_string()));
    }

    #[test]
    fn no_headers_yields_none() {
        assert_eq!(extract(&HeaderMap::new()), None);
    }

    #[test]
    fn generate_is_prefixed_and_unique() {
        let a = generate();
        let b = generate();
        assert!(a.starts_with("ig-"));
        assert_ne!(a, b);
    }
}
