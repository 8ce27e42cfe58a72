//! `POST /api/cli/tickets`, `GET /api/cli/tickets/{id}`,
//! `POST /api/cli/tickets/{id}/approve` (spec.md §4.8).
//!
//! The create and poll endpoints are intentionally unauthenticated — a
//! not-yet-logged-in CLI has no principal to offer. The poll endpoint is
//! instead rate-limited 200ms per client IP (spec.md §4.9).

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::auth::{cookie, Principal};
use crate::cli_ticket::{CliTicketService, TicketView};
use crate::error::ApiError;
use crate::store::AUTH_SESSION_TTL_SECS;
use crate::AppContext;

const TICKET_SECRET_HEADER: &str = "x-buckley-cli-ticket-secret";

#[derive(Deserialize, Default)]
pub struct CreateTicketRequest {
    pub label: Option<String>,
}

#[derive(Serialize)]
pub struct CreateTicketResponse {
    pub ticket: String,
    pub secret: String,
    pub login_url: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub async fn create_ticket(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateTicketRequest>,
) -> Result<Json<CreateTicketResponse>, ApiError> {
    let service = CliTicketService::new(ctx.store.clone());
    let external_url = ctx.config.external_url.clone().unwrap_or_else(|| format!("http://{}", ctx.config.bind_address));
    let created = service
        .create(body.label.as_deref(), &external_url)
        .await
        .map_err(|e| ApiError::new(crate::error::ErrorCode::Internal, e.to_string()))?;

    Ok(Json(CreateTicketResponse {
        ticket: created.ticket.id,
        secret: created.ticket.secret,
        login_url: created.login_url,
        expires_at: created.ticket.expires_at,
    }))
}

fn ticket_secret(headers: &HeaderMap, query: Option<&str>, loopback: bool) -> Option<String> {
    if let Some(v) = headers.get(TICKET_SECRET_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    if loopback {
        if let Some(q) = query {
            return q.split('&').find_map(|pair| pair.strip_prefix("secret=")).map(|v| v.to_string());
        }
    }
    None
}

/// spec.md §4.8 step 4: polling after approval consumes the ticket and
/// sets the session cookie on this response, the same
/// request-scheme-derived `Secure` flag `redeem_magic_link` uses.
pub async fn poll_ticket(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: axum::http::Uri,
) -> Response {
    if !ctx.cli_ticket_poll_limiter.try_acquire(&addr.ip().to_string()).await {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    let Some(secret) = ticket_secret(&headers, uri.query(), ctx.config.is_loopback_bind()) else {
        return ApiError::new(crate::error::ErrorCode::Unauthenticated, "missing ticket secret").into_response();
    };

    let service = CliTicketService::new(ctx.store.clone());
    match service.poll_and_consume(&id, &secret).await {
        Ok((view, session_token)) => {
            let mut response = Json(view).into_response();
            if !session_token.is_empty() {
                let secure = headers
                    .get("x-forwarded-proto")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.eq_ignore_ascii_case("https"))
                    .unwrap_or(false);
                let cookie_header = cookie::set_cookie_header(&session_token, AUTH_SESSION_TTL_SECS, secure);
                if let Ok(v) = axum::http::HeaderValue::from_str(&cookie_header) {
                    response.headers_mut().insert(header::SET_COOKIE, v);
                }
            }
            response
        }
        Err(code) => ApiError::new(code, "ticket poll failed").into_response(),
    }
}

pub async fn approve_ticket(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<TicketView>, ApiError> {
    let service = CliTicketService::new(ctx.store.clone());
    let ticket = service.approve(&principal, &id).await.map_err(|code| ApiError::new(code, "ticket approval failed"))?;
    Ok(Json(TicketView::from(&ticket)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Scope;
    use crate::config::DaemonConfig;
    use crate::store::memory::MemoryStore;
    use axum::extract::{Extension as ExtractExtension, Path as ExtractPath, State as ExtractState};

    fn ctx() -> Arc<AppContext> {
        Arc::new(AppContext::new(Arc::new(DaemonConfig::default()), Arc::new(MemoryStore::new()), "test-daemon".into(), None))
    }

    #[tokio::test]
    async fn create_then_approve_round_trips() {
        let ctx = ctx();
        let Json(created) = create_ticket(ExtractState(ctx.clone()), Json(CreateTicketRequest { label: None })).await.unwrap();
        assert!(!created.secret.is_empty());

        let approver = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        let Json(view) = approve_ticket(ExtractState(ctx), ExtractExtension(approver), ExtractPath(created.ticket)).await.unwrap();
        assert_eq!(view.status, "approved");
    }

    #[tokio::test]
    async fn viewer_cannot_approve() {
        let ctx = ctx();
        let Json(created) = create_ticket(ExtractState(ctx.clone()), Json(CreateTicketRequest { label: None })).await.unwrap();
        let viewer = Principal { name: "alice".into(), scope: Scope::Viewer, token_id: None };
        let err = approve_ticket(ExtractState(ctx), ExtractExtension(viewer), ExtractPath(created.ticket)).await.unwrap_err();
        assert_eq!(err.code, Some(crate::error::ErrorCode::PermissionDenied.as_str()));
    }
}
