//! CORS origin matching (spec.md §4.1).
//!
//! Hand-rolled rather than `tower_http::cors::CorsLayer`'s predicate
//! mode — the loopback-any-port carve-out and the wildcard-vs-credentials
//! interaction are specific enough that writing the matcher directly read
//! clearer than threading a closure through the layer's builder.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginDecision {
    /// Allowlist contains `"*"` — echo `*`, never set `Allow-Credentials`.
    Wildcard,
    /// A specific allowlist entry matched — echo the origin and allow credentials.
    Matched,
    Denied,
}

struct ParsedOrigin<'a> {
    scheme: &'a str,
    host: &'a str,
    port: Option<u16>,
}

fn parse_origin(origin: &str) -> Option<ParsedOrigin<'_>> {
    let (scheme, rest) = origin.split_once("://")?;
    let host_port = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if let Some(bracket_end) = host_port.strip_prefix('[') {
        // IPv6 literal: [::1]:port
        let (host, port_part) = bracket_end.split_once(']')?;
        let port = port_part.strip_prefix(':').and_then(|p| p.parse().ok());
        return Some(ParsedOrigin { scheme, host, port });
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            Some(ParsedOrigin { scheme, host, port: port.parse().ok() })
        }
        _ => Some(ParsedOrigin { scheme, host: host_port, port: None }),
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
        443
    } else {
        80
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<std::net::IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// Whether `origin`'s host matches the inbound `Host:` header's host,
/// ignoring scheme and port — the WS bridges' "same-host always allowed"
/// rule (spec.md §4.6).
pub fn same_host(origin: &str, host_header: &str) -> bool {
    let Some(parsed_origin) = parse_origin(origin) else { return false };
    let host_only = if let Some(rest) = host_header.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        host_header.split(':').next().unwrap_or(host_header)
    };
    parsed_origin.host.eq_ignore_ascii_case(host_only)
}

/// Decide whether `origin` (an inbound `Origin:` header value) is allowed
/// under `allowlist`, and whether the match permits credentials.
pub fn decide(origin: &str, allowlist: &[String]) -> OriginDecision {
    if allowlist.iter().any(|a| a == "*") {
        return OriginDecision::Wildcard;
    }
    let Some(req) = parse_origin(origin) else { return OriginDecision::Denied };
    let req_port = req.port.unwrap_or_else(|| default_port(req.scheme));

    for entry in allowlist {
        let Some(allowed) = parse_origin(entry) else { continue };
        if !allowed.scheme.eq_ignore_ascii_case(req.scheme) || !allowed.host.eq_ignore_ascii_case(req.host) {
            continue;
        }
        match allowed.port {
            None if is_loopback_host(allowed.host) => return OriginDecision::Matched,
            None => {
                if req_port == default_port(allowed.scheme) {
                    return OriginDecision::Matched;
                }
            }
            Some(p) if p == req_port => return OriginDecision::Matched,
            _ => {}
        }
    }
    OriginDecision::Denied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_allows_anything() {
        assert_eq!(decide("https://evil.example", &["*".to_string()]), OriginDecision::Wildcard);
    }

    #[test]
    fn loopback_entry_matches_any_port() {
        let allow = vec!["http://127.0.0.1".to_string()];
        assert_eq!(decide("http://127.0.0.1:5173", &allow), OriginDecision::Matched);
        assert_eq!(decide("http://127.0.0.1:9999", &allow), OriginDecision::Matched);
    }

    #[test]
    fn non_loopback_entry_without_port_only_matches_default_port() {
        let allow = vec!["https://example.com".to_string()];
        assert_eq!(decide("https://example.com", &allow), OriginDecision::Matched);
        assert_eq!(decide("https://example.com:8443", &allow), OriginDecision::Denied);
    }

    #[test]
    fn mismatched_scheme_is_denied() {
        let allow = vec!["http://localhost".to_string()];
        assert_eq!(decide("https://localhost", &allow), OriginDecision::Denied);
    }

    #[test]
    fn explicit_port_must_match_exactly() {
        let allow = vec!["http://example.com:3000".to_string()];
        assert_eq!(decide("http://example.com:3000", &allow), OriginDecision::Matched);
        assert_eq!(decide("http://example.com:3001", &allow), OriginDecision::Denied);
    }

    #[test]
    fn same_host_ignores_scheme_and_port() {
        assert!(same_host("https://example.com:5173", "example.com:4488"));
        assert!(!same_host("https://evil.example", "example.com:4488"));
    }
}
