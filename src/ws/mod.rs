//! The two WebSocket bridges (spec.md §4.6, §6.1): mission events at
//! `/api/mission/events` and the interactive shell at `/ws/pty`.

pub mod mission;
pub mod pty;

use axum::http::HeaderMap;

use crate::rest::cors;

/// Shared origin gate: same-host is always allowed; anything else must
/// match the configured CORS allowlist (spec.md §4.6).
pub fn origin_allowed(headers: &HeaderMap, host_header: Option<&str>, allowlist: &[String]) -> bool {
    let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        // No Origin header at all (non-browser client, e.g. a CLI) — nothing to check.
        return true;
    };
    if let Some(host) = host_header {
        if cors::same_host(origin, host) {
            return true;
        }
    }
    !matches!(cors::decide(origin, allowlist), cors::OriginDecision::Denied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn same_host_origin_is_always_allowed() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ORIGIN, HeaderValue::from_static("https://example.com:5173"));
        assert!(origin_allowed(&headers, Some("example.com:4488"), &[]));
    }

    #[test]
    fn cross_host_origin_needs_allowlist() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        assert!(!origin_allowed(&headers, Some("example.com:4488"), &[]));
        assert!(origin_allowed(&headers, Some("example.com:4488"), &["https://evil.example".to_string()]));
    }

    #[test]
    fn missing_origin_header_is_allowed() {
        assert!(origin_allowed(&HeaderMap::new(), Some("example.com:4488"), &[]));
    }
}
