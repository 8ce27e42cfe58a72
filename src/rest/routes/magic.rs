//! `POST /api/magic-links`, `GET /auth/magic/{token}?id=<ticket>`
//! (spec.md §4.8).

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{Principal, Scope};
use crate::cli_ticket::CliTicketService;
use crate::error::ApiError;
use crate::AppContext;

#[derive(Deserialize)]
pub struct CreateMagicLinkRequest {
    pub label: Option<String>,
    pub ttl_secs: i64,
    pub scope: Scope,
}

#[derive(Serialize)]
pub struct CreateMagicLinkResponse {
    pub id: String,
    pub token: String,
    pub url: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub async fn create_magic_link(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateMagicLinkRequest>,
) -> Result<Json<CreateMagicLinkResponse>, ApiError> {
    if !principal.has_scope(Scope::Member) {
        return Err(ApiError::new(crate::error::ErrorCode::PermissionDenied, "member scope or higher required"));
    }
    let service = CliTicketService::new(ctx.store.clone());
    let ticket = service
        .create_magic_link(&principal, body.label.as_deref(), body.ttl_secs, body.scope)
        .await
        .map_err(|code| ApiError::new(code, "magic link creation failed"))?;

    let external_url = ctx.config.external_url.clone().unwrap_or_else(|| format!("http://{}", ctx.config.bind_address));
    let url = format!("{}/auth/magic/{}?id={}", external_url.trim_end_matches('/'), ticket.secret, ticket.id);

    Ok(Json(CreateMagicLinkResponse { id: ticket.id, token: ticket.secret, url, expires_at: ticket.expires_at }))
}

#[derive(Deserialize)]
pub struct RedeemQuery {
    pub id: String,
}

/// Redeems the link, sets the session cookie, and redirects to `/`
/// (spec.md §4.8's browser-facing redemption flow).
pub async fn redeem_magic_link(
    State(ctx): State<Arc<AppContext>>,
    Path(token): Path<String>,
    Query(query): Query<RedeemQuery>,
    headers: HeaderMap,
) -> Response {
    let secure = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false);

    let service = CliTicketService::new(ctx.store.clone());
    match service.redeem_magic_link(&query.id, &token, secure).await {
        Ok(cookie_header) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, "/".parse().unwrap());
            if let Ok(v) = axum::http::HeaderValue::from_str(&cookie_header) {
                response.headers_mut().insert(header::SET_COOKIE, v);
            }
            response
        }
        Err(code) => ApiError::new(code, "magic link redemption failed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::store::memory::MemoryStore;
    use axum::extract::{Extension as ExtractExtension, Path as ExtractPath, Query as ExtractQuery, State as ExtractState};

    fn ctx() -> Arc<AppContext> {
        Arc::new(AppContext::new(Arc::new(DaemonConfig::default()), Arc::new(MemoryStore::new()), "test-daemon".into(), None))
    }

    #[tokio::test]
    async fn viewer_cannot_create_magic_link() {
        let ctx = ctx();
        let viewer = Principal { name: "alice".into(), scope: Scope::Viewer, token_id: None };
        let body = CreateMagicLinkRequest { label: None, ttl_secs: 600, scope: Scope::Viewer };
        let err = create_magic_link(ExtractState(ctx), ExtractExtension(viewer), Json(body)).await.unwrap_err();
        assert_eq!(err.code, Some(crate::error::ErrorCode::PermissionDenied.as_str()));
    }

    #[tokio::test]
    async fn member_cannot_mint_operator_link() {
        let ctx = ctx();
        let member = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        let body = CreateMagicLinkRequest { label: None, ttl_secs: 600, scope: Scope::Operator };
        let err = create_magic_link(ExtractState(ctx), ExtractExtension(member), Json(body)).await.unwrap_err();
        assert_eq!(err.code, Some(crate::error::ErrorCode::PermissionDenied.as_str()));
    }

    #[tokio::test]
    async fn create_then_redeem_sets_cookie() {
        let ctx = ctx();
        let member = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        let body = CreateMagicLinkRequest { label: None, ttl_secs: 600, scope: Scope::Viewer };
        let Json(created) = create_magic_link(ExtractState(ctx.clone()), ExtractExtension(member), Json(body)).await.unwrap();

        let response = redeem_magic_link(
            ExtractState(ctx),
            ExtractPath(created.token),
            ExtractQuery(RedeemQuery { id: created.id }),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(response.headers().get(header::SET_COOKIE).is_some());
    }
}
