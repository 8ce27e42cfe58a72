//! The REST surface (spec.md §4.1, §6.1): health, metrics, CLI-ticket
//! auth, magic links, sessions, and approvals. WS bridges (`ws::mission`,
//! `ws::pty`) and the streaming-RPC surface (`rpc`) are wired in
//! separately by [`crate::transport`] — this module only builds the
//! `axum::Router` for plain HTTP.

pub mod auth;
pub mod cors;
pub mod headers;
pub mod routes;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::AppContext;

const TINY_BODY_LIMIT: usize = 64 * 1024;
const SMALL_BODY_LIMIT: usize = 1024 * 1024;

/// Routes accepting only small, metadata-shaped bodies (spec.md §4.1's
/// "tiny" tier): ticket/magic-link issuance and approval decisions.
fn tiny_body_routes(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/cli/tickets/:id/approve", post(routes::cli_tickets::approve_ticket))
        .route("/api/magic-links", post(routes::magic::create_magic_link))
        .route("/api/approvals/:id/approve", post(routes::approvals::approve))
        .route("/api/approvals/:id/reject", post(routes::approvals::reject))
        .route("/api/sessions/:id/token", post(routes::sessions::issue_session_token))
        .layer(RequestBodyLimitLayer::new(TINY_BODY_LIMIT))
        .layer(DefaultBodyLimit::disable())
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth::require_principal))
        .with_state(ctx)
}

/// Unauthenticated tiny-body routes: ticket creation has no principal to
/// gate on, and ticket polling gates itself on the ticket secret.
fn public_tiny_body_routes() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/api/cli/tickets/:id", get(routes::cli_tickets::poll_ticket))
        .layer(RequestBodyLimitLayer::new(TINY_BODY_LIMIT))
        .layer(DefaultBodyLimit::disable())
}

fn default_routes(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .route("/api/sessions/:id", get(routes::sessions::get_session))
        .route("/api/approvals", get(routes::approvals::list_approvals))
        .layer(RequestBodyLimitLayer::new(SMALL_BODY_LIMIT))
        .layer(DefaultBodyLimit::disable())
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth::require_principal))
        .with_state(ctx)
}

/// Unauthenticated routes outside `/api/*`: health, metrics (self-gates
/// on `publicMetrics`/principal), CLI-ticket creation, magic-link
/// redemption.
fn public_routes(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/healthz", get(routes::health::healthz))
        .route("/metrics", get(routes::metrics::metrics))
        .route("/api/cli/tickets", post(routes::cli_tickets::create_ticket))
        .route("/auth/magic/:token", get(routes::magic::redeem_magic_link))
        .layer(RequestBodyLimitLayer::new(TINY_BODY_LIMIT))
        .layer(DefaultBodyLimit::disable())
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth::attach_principal))
        .with_state(ctx)
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .merge(public_routes(ctx.clone()))
        .merge(public_tiny_body_routes().with_state(ctx.clone()))
        .merge(tiny_body_routes(ctx.clone()))
        .merge(default_routes(ctx.clone()))
        .layer(middleware::from_fn_with_state(ctx.clone(), headers::security_and_cors))
}
