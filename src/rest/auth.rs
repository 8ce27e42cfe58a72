//! Principal-resolving middleware for REST routes (spec.md §4.2).
//!
//! Two flavors, per the teacher's middleware-stack idiom of separating
//! "hard gate" from "attach and let the handler decide": [`require_principal`]
//! rejects unauthenticated requests outright (used on `/api/*`);
//! [`attach_principal`] only annotates the request, leaving exemptible
//! routes (`/healthz`, public `/metrics`) to run unauthenticated.

use crate::auth::resolver::{self, RequestAuth, Resolved, ResolverConfig};
use crate::auth::Principal;
use crate::error::ApiError;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use crate::AppContext;

fn resolver_config(ctx: &AppContext) -> ResolverConfig {
    ResolverConfig {
        auth_token: ctx.config.auth_token.clone(),
        require_token: ctx.config.require_token,
        basic_auth_username: if ctx.config.basic_auth_enabled { ctx.config.basic_auth_username.clone() } else { None },
        basic_auth_password: if ctx.config.basic_auth_enabled { ctx.config.basic_auth_password.clone() } else { None },
        is_loopback_bind: ctx.config.is_loopback_bind(),
    }
}

fn request_auth(req: &Request) -> RequestAuth<'_> {
    let cookie_header = req.headers().get(header::COOKIE).and_then(|v| v.to_str().ok());
    let authorization_header = req.headers().get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let query_token = req.uri().query().and_then(|q| {
        q.split('&').find_map(|pair| pair.strip_prefix("token=")).map(|v| v.trim())
    });
    let basic_credentials = authorization_header.and_then(parse_basic);
    let secure = is_secure(req.headers());
    RequestAuth { cookie_header, authorization_header, query_token, basic_credentials, attached: None, secure }
}

/// `X-Forwarded-Proto: https` is how a TLS-terminating proxy tells us the
/// original request was secure — this server never terminates TLS itself.
fn is_secure(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

fn parse_basic(header: &str) -> Option<(String, String)> {
    use base64::Engine;
    let b64 = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn resolve_and_attach(ctx: &AppContext, req: &mut Request) -> Result<Option<String>, ApiError> {
    let auth = request_auth(req);
    let cfg = resolver_config(ctx);
    match resolver::resolve(&ctx.store, &cfg, auth).await {
        Resolved::Principal(p) => {
            req.extensions_mut().insert(p);
            Ok(None)
        }
        Resolved::NewSession { principal, cookie_header } => {
            req.extensions_mut().insert(principal);
            Ok(Some(cookie_header))
        }
        Resolved::Anonymous => {
            req.extensions_mut().insert(Principal::anonymous());
            Ok(None)
        }
        Resolved::Unauthenticated => Err(ApiError::new(crate::error::ErrorCode::Unauthenticated, "authentication required")),
    }
}

fn apply_cookie(mut response: Response, cookie_header: Option<String>) -> Response {
    if let Some(value) = cookie_header {
        if let Ok(v) = axum::http::HeaderValue::from_str(&value) {
            response.headers_mut().insert(header::SET_COOKIE, v);
        }
    }
    response
}

/// Hard gate: every `/api/*` route except the explicitly exempted ones.
pub async fn require_principal(State(ctx): State<Arc<AppContext>>, mut req: Request, next: Next) -> Response {
    use axum::response::IntoResponse;
    match resolve_and_attach(&ctx, &mut req).await {
        Ok(cookie_header) => apply_cookie(next.run(req).await, cookie_header),
        Err(e) => e.into_response(),
    }
}

/// Soft attach: used by `/healthz` and public-metrics, where an anonymous
/// principal is acceptable and the route itself decides what to expose.
pub async fn attach_principal(State(ctx): State<Arc<AppContext>>, mut req: Request, next: Next) -> Response {
    let cookie_header = resolve_and_attach(&ctx, &mut req).await.unwrap_or(None);
    apply_cookie(next.run(req).await, cookie_header)
}

/// Resolve a principal for a non-axum-middleware call site (the WS
/// upgrade handlers, which read headers/query manually before the
/// connection is accepted).
pub async fn resolve_for_ws(
    ctx: &AppContext,
    cookie_header: Option<&str>,
    authorization_header: Option<&str>,
    query_token: Option<&str>,
    headers: &axum::http::HeaderMap,
) -> Option<Principal> {
    let cfg = resolver_config(ctx);
    let secure = is_secure(headers);
    let auth = RequestAuth { cookie_header, authorization_header, query_token, basic_credentials: None, attached: None, secure };
    match resolver::resolve(&ctx.store, &cfg, auth).await {
        Resolved::Principal(p) | Resolved::NewSession { principal: p, .. } => Some(p),
        Resolved::Anonymous => Some(Principal::anonymous()),
        Resolved::Unauthenticated => None,
    }
}
