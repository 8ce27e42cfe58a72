//! `GET /metrics` — Prometheus text format, exempt from auth only when
//! `publicMetrics` is set (spec.md §6.1, §6.2).

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::auth::Principal;
use crate::AppContext;

pub async fn metrics(State(ctx): State<Arc<AppContext>>, principal: Option<axum::Extension<Principal>>) -> Response {
    if !ctx.config.public_metrics {
        let is_authenticated = principal.map(|p| p.0.name != crate::auth::ANONYMOUS).unwrap_or(false);
        if !is_authenticated {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    if let Ok(sessions) = ctx.store.list_sessions().await {
        ctx.metrics.set_sessions_active(sessions.iter().filter(|s| s.status == "active").count() as u64);
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], ctx.metrics.render_prometheus()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::store::memory::MemoryStore;
    use axum::extract::State as ExtractState;

    fn ctx(public_metrics: bool) -> Arc<AppContext> {
        let config = DaemonConfig { public_metrics, ..DaemonConfig::default() };
        Arc::new(AppContext::new(Arc::new(config), Arc::new(MemoryStore::new()), "test-daemon".into(), None))
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected_when_not_public() {
        let response = metrics(ExtractState(ctx(false)), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unauthenticated_request_is_served_when_public() {
        let response = metrics(ExtractState(ctx(true)), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn authenticated_request_is_served_even_when_not_public() {
        let principal = Principal { name: "alice".into(), scope: crate::auth::Scope::Viewer, token_id: None };
        let response = metrics(ExtractState(ctx(false)), Some(axum::Extension(principal))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
