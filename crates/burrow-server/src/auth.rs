//! Pre-shared key authentication

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Constant-time comparison of two keys. Time depends only on the lengths,
/// never on the position of the first differing byte.
pub fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Check the `X-API-Key` header of a request against the configured key.
pub fn authorize(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|provided| keys_match(provided, expected))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_keys_match() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secrex"));
        assert!(!keys_match("secret", "secre"));
        assert!(!keys_match("", "secret"));
        assert!(keys_match("", ""));
    }

    #[test]
    fn test_authorize() {
        let mut headers = HeaderMap::new();
        assert!(!authorize(&headers, "secret"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(!authorize(&headers, "secret"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(authorize(&headers, "secret"));
    }
}
