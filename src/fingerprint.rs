//! Request fingerprinting
//!
//! A fingerprint is the SHA-256 digest of a canonicalized request, used to
//! tell a duplicate retry (same key, same content) from a conflicting reuse
//! of the key (same key, different content).
//!
//! Canonicalization, in order:
//!
//! 1. Method uppercased.
//! 2. Path lowercased; a single trailing `/` is stripped unless the path is
//!    exactly `/`. Percent-encoding is preserved as-is.
//! 3. Query parsed as `application/x-www-form-urlencoded` (blank values and
//!    duplicate keys preserved), pairs sorted by `(key, value)`, re-encoded
//!    with `&` separators and `=` for empty values.
//! 4. Headers restricted to the inclusion list (case-insensitive match),
//!    names lowercased, values trimmed, serialized as a JSON object with
//!    sorted keys.
//! 5. Body digest: SHA-256 hex of the raw bytes.
//!
//! The five fields are joined by `\n` and hashed once more; the result is
//! 64 lowercase hex chars. Query parameter order and header insertion order
//! do not affect the digest.

use std::collections::BTreeMap;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Compute the fingerprint of a normalized request.
///
/// Pure and deterministic: identical inputs always produce the same
/// 64-lowercase-hex digest.
#[must_use]
pub fn fingerprint(
    method: &str,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
    include_headers: &[String],
) -> String {
    let composed = format!(
        "{}\n{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        canonical_path(path),
        canonical_query(query.unwrap_or("")),
        canonical_headers(headers, include_headers),
        hex_digest(body),
    );
    hex_digest(composed.as_bytes())
}

/// SHA-256 of `bytes` as lowercase hex.
fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercase the path and strip one trailing slash, keeping `/` itself.
fn canonical_path(path: &str) -> String {
    let lowered = path.to_ascii_lowercase();
    if lowered.len() > 1 {
        if let Some(stripped) = lowered.strip_suffix('/') {
            return stripped.to_string();
        }
    }
    lowered
}

/// Parse, sort, and re-encode the query string.
///
/// `form_urlencoded` keeps blank values (`a` and `a=` both parse to
/// `("a", "")`) and duplicate keys; re-encoding always emits `=`.
fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort();

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Serialize the inclusion-listed headers as a JSON object with sorted keys.
///
/// Multiple values of one name are joined with `,` in received order.
/// Headers absent from the request are omitted entirely.
fn canonical_headers(headers: &HeaderMap, include_headers: &[String]) -> String {
    let mut selected: BTreeMap<String, String> = BTreeMap::new();
    for name in include_headers {
        let lowered = name.to_ascii_lowercase();
        let values: Vec<&str> = headers
            .get_all(lowered.as_str())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::trim)
            .collect();
        if !values.is_empty() {
            selected.insert(lowered, values.join(","));
        }
    }
    serde_json::to_string(&selected).unwrap_or_default()
}
