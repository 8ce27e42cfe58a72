//! Auth-session `Set-Cookie` construction (spec.md §3, §4.2).
//!
//! Hand-rolled header strings rather than a cookie-jar crate — see
//! DESIGN.md's "Cookies" note. The attribute set is small enough that a
//! dependency would be more ceremony than the string formatting it saves.

pub const COOKIE_NAME: &str = "buckley_session";

/// Build the `Set-Cookie` header value for a freshly issued or touched
/// auth session. `secure` should be `true` iff the inbound request was
/// itself secure (TLS, or behind a proxy that set `X-Forwarded-Proto:
/// https`) — spec.md's "`Secure` iff the request was secure".
pub fn set_cookie_header(token: &str, max_age_secs: i64, secure: bool) -> String {
    let mut parts = vec![
        format!("{}={}", COOKIE_NAME, token),
        "Path=/".to_string(),
        format!("Max-Age={}", max_age_secs.max(0)),
        "HttpOnly".to_string(),
        "SameSite=Lax".to_string(),
    ];
    if secure {
        parts.push("Secure".to_string());
    }
    parts.join("; ")
}

/// Header value that immediately expires the cookie (logout / revoke).
pub fn clear_cookie_header(secure: bool) -> String {
    set_cookie_header("", 0, secure)
}

/// Extract this crate's session-cookie token from a raw `Cookie` request
/// header, if present. Cookie pairs are `;`-separated, optionally
/// whitespace-padded; the first match wins (browsers never send
/// duplicates for the same name from one jar).
pub fn extract_token(cookie_header: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (name, value) = pair.split_once('=')?;
        if name.trim() == COOKIE_NAME && !value.is_empty() {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_attributes() {
        let header = set_cookie_header("abc123", 86400, true);
        assert!(header.starts_with("buckley_session=abc123"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Lax"));
        assert!(header.contains("Secure"));
        assert!(header.contains("Max-Age=86400"));
    }

    #[test]
    fn insecure_request_omits_secure_attribute() {
        let header = set_cookie_header("abc123", 86400, false);
        assert!(!header.contains("Secure"));
    }

    #[test]
    fn extracts_token_among_other_cookies() {
        let raw = "foo=bar; buckley_session=tok-value; baz=qux";
        assert_eq!(extract_token(raw).as_deref(), Some("tok-value"));
    }

    #[test]
    fn missing_cookie_returns_none() {
        assert_eq!(extract_token("foo=bar"), None);
    }
}
