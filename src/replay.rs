//! Response replay
//!
//! Reconstructs a client-facing response from a stored artifact. Hop-by-hop
//! and volatile headers are filtered out so every replay is byte-identical
//! in status and body and stable in headers; replay annotations mark the
//! response as served from the store.

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Response, StatusCode};

use crate::record::StoredResponse;

/// Request/response header carrying the client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Response header marking a replayed response.
pub const REPLAY_HEADER: &str = "idempotent-replay";

/// Hop-by-hop and volatile headers never copied into a replay.
const DROPPED_HEADERS: &[&str] = &[
    "date",
    "server",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "trailer",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Return `true` when `name` (already lowercased) must not be replayed.
fn is_dropped(name: &str, strip_set_cookie: bool) -> bool {
    DROPPED_HEADERS.contains(&name) || (strip_set_cookie && name == "set-cookie")
}

/// Rebuild a response from a stored artifact with replay annotations.
///
/// Status and body are copied verbatim; headers are filtered per the drop
/// list; `Idempotent-Replay: true` and `Idempotency-Key` are appended.
#[must_use]
pub fn replay_response(stored: &StoredResponse, key: &str, strip_set_cookie: bool) -> Response<Body> {
    let mut response = build_response(stored, key, Some(strip_set_cookie));
    response.headers_mut().insert(
        HeaderName::from_static(REPLAY_HEADER),
        HeaderValue::from_static("true"),
    );
    response
}

/// Rebuild a first (non-replay) response: headers verbatim, no replay flag,
/// `Idempotency-Key` attached.
#[must_use]
pub fn first_response(stored: &StoredResponse, key: &str) -> Response<Body> {
    build_response(stored, key, None)
}

fn build_response(
    stored: &StoredResponse,
    key: &str,
    filter: Option<bool>,
) -> Response<Body> {
    let mut response = Response::new(Body::from(stored.body.clone()));
    *response.status_mut() =
        StatusCode::from_u16(stored.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    for (name, values) in &stored.headers {
        if let Some(strip_set_cookie) = filter {
            if is_dropped(name, strip_set_cookie) {
                continue;
            }
        }
        let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::try_from(value.as_str()) {
                headers.append(&header_name, header_value);
            }
        }
    }

    // The key is validated printable ASCII before any record exists.
    if let Ok(value) = HeaderValue::try_from(key) {
        headers.insert(HeaderName::from_static(IDEMPOTENCY_KEY_HEADER), value);
    }
    response
}
