//! Security-header and CORS middleware (spec.md §4.1).

use super::cors::{self, OriginDecision};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use crate::AppContext;

const HOST_INJECTION_CHARS: &[char] = &[' ', '\t', '\r', '\n', '"', '\''];

/// Applies outer-to-inner per spec.md §4.1: CORS, then the always-on
/// security headers, then (when the browser UI is enabled) a CSP whose
/// `connect-src` is built from the request's `Host` header.
pub async fn security_and_cors(State(ctx): State<Arc<AppContext>>, req: Request, next: Next) -> Response {
    let origin = req.headers().get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()).map(str::to_string);
    let host = req.headers().get(axum::http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string);

    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=(), interest-cohort=()"),
    );

    if let Some(origin) = origin {
        match cors::decide(&origin, &ctx.config.allowed_origins) {
            OriginDecision::Wildcard => {
                headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            }
            OriginDecision::Matched => {
                if let Ok(v) = HeaderValue::from_str(&origin) {
                    headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
                }
                headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
            }
            OriginDecision::Denied => {}
        }
        headers.insert(axum::http::header::VARY, HeaderValue::from_static("Origin"));
    }

    if ctx.config.enable_browser {
        let host_ok = host.as_deref().map(|h| !h.contains(HOST_INJECTION_CHARS)).unwrap_or(false);
        if host_ok {
            let host = host.unwrap();
            let csp = format!(
                "default-src 'self'; object-src 'none'; frame-ancestors 'none'; \
                 script-src 'self' 'unsafe-inline'; connect-src 'self' ws://{host} wss://{host}"
            );
            if let Ok(v) = HeaderValue::from_str(&csp) {
                headers.insert(HeaderName::from_static("content-security-policy"), v);
            }
        }
    }

    response
}
