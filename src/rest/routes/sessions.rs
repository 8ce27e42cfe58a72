//! `GET /api/sessions`, `GET /api/sessions/{id}`, `POST /api/sessions/{id}/token`
//! (spec.md §4.3, §6.3 "Session token").
//!
//! Visibility is scope-gated: operators see every session, a member or
//! viewer only their own. A session a principal may not see answers
//! `not-found`, never `forbidden` — spec.md §4.3/§7 — so a probing
//! request can't distinguish "doesn't exist" from "not yours".

use axum::extract::{Path, State};
use axum::Extension;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::access::{can_access_session, filter_sessions};
use crate::auth::{Principal, Scope};
use crate::error::{ApiError, ErrorCode};
use crate::store::Session;
use crate::AppContext;

#[derive(Serialize)]
pub struct SessionView {
    pub id: String,
    pub principal: String,
    pub project_path: String,
    pub git_repo: Option<String>,
    pub git_branch: Option<String>,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
}

impl From<Session> for SessionView {
    fn from(s: Session) -> Self {
        Self {
            id: s.id,
            principal: s.principal,
            project_path: s.project_path,
            git_repo: s.git_repo,
            git_branch: s.git_branch,
            status: s.status,
            created_at: s.created_at,
            last_active: s.last_active,
        }
    }
}

pub async fn list_sessions(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let sessions = ctx.store.list_sessions().await.map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))?;
    let visible = filter_sessions(&principal, sessions);
    Ok(Json(visible.into_iter().map(SessionView::from).collect()))
}

pub async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = ctx
        .store
        .get_session(&id)
        .await
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))?
        .filter(|s| can_access_session(&principal, s))
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "session not found"))?;
    Ok(Json(session.into()))
}

#[derive(Serialize)]
pub struct SessionTokenView {
    pub session_id: String,
    pub token: String,
}

/// Issue a fresh session token, required on every command/PTY/workflow-action
/// operation against this session (spec.md §6.3). Member-or-higher only,
/// and only against a session the principal can already see.
pub async fn issue_session_token(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<SessionTokenView>, ApiError> {
    if !principal.has_scope(Scope::Member) {
        return Err(ApiError::new(ErrorCode::PermissionDenied, "member scope or higher required"));
    }
    let session = ctx
        .store
        .get_session(&id)
        .await
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))?
        .filter(|s| can_access_session(&principal, s))
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "session not found"))?;

    let token = ctx
        .store
        .issue_session_token(&session.id)
        .await
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))?;

    Ok(Json(SessionTokenView { session_id: session.id, token }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::store::memory::MemoryStore;
    use axum::extract::{Extension as ExtractExtension, Path as ExtractPath, State as ExtractState};

    fn ctx() -> Arc<AppContext> {
        Arc::new(AppContext::new(Arc::new(DaemonConfig::default()), Arc::new(MemoryStore::new()), "test-daemon".into(), None))
    }

    #[tokio::test]
    async fn member_only_sees_own_sessions() {
        let ctx = ctx();
        ctx.store.create_session("alice", "/tmp/a", None, None).await.unwrap();
        ctx.store.create_session("bob", "/tmp/b", None, None).await.unwrap();

        let alice = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        let Json(visible) = list_sessions(ExtractState(ctx.clone()), ExtractExtension(alice)).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].principal, "alice");
    }

    #[tokio::test]
    async fn get_session_not_owned_is_not_found() {
        let ctx = ctx();
        let s = ctx.store.create_session("alice", "/tmp/a", None, None).await.unwrap();
        let bob = Principal { name: "bob".into(), scope: Scope::Member, token_id: None };
        let err = get_session(ExtractState(ctx.clone()), ExtractExtension(bob), ExtractPath(s.id)).await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::NotFound.as_str()));
    }

    #[tokio::test]
    async fn viewer_cannot_issue_session_token() {
        let ctx = ctx();
        let s = ctx.store.create_session("alice", "/tmp/a", None, None).await.unwrap();
        let alice = Principal { name: "alice".into(), scope: Scope::Viewer, token_id: None };
        let err = issue_session_token(ExtractState(ctx.clone()), ExtractExtension(alice), ExtractPath(s.id)).await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::PermissionDenied.as_str()));
    }

    #[tokio::test]
    async fn member_can_issue_token_for_own_session() {
        let ctx = ctx();
        let s = ctx.store.create_session("alice", "/tmp/a", None, None).await.unwrap();
        let alice = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        let Json(view) = issue_session_token(ExtractState(ctx.clone()), ExtractExtension(alice), ExtractPath(s.id)).await.unwrap();
        assert_eq!(view.session_id, s.id);
        assert_eq!(view.token.len(), 48);
    }
}
