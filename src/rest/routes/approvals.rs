//! `GET /api/approvals`, `POST /api/approvals/{id}/approve`,
//! `POST /api/approvals/{id}/reject` (spec.md §4.7).

use axum::extract::{Path, State};
use axum::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::approval::ApprovalWorkflow;
use crate::auth::Principal;
use crate::error::ApiError;
use crate::store::PendingApproval;
use crate::AppContext;

pub async fn list_approvals(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<PendingApproval>>, ApiError> {
    let workflow = ApprovalWorkflow::new(ctx.store.clone(), ctx.hub.clone());
    let visible = workflow
        .list_visible(&principal)
        .await
        .map_err(|e| ApiError::new(crate::error::ErrorCode::Internal, e.to_string()))?;
    Ok(Json(visible))
}

#[derive(Deserialize, Default)]
pub struct DecisionRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct DecisionResponse {
    pub success: bool,
    pub approval: PendingApproval,
    pub message: Option<String>,
}

pub async fn approve(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<DecisionResponse>, ApiError> {
    decide(ctx, principal, id, body, true).await
}

pub async fn reject(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<DecisionResponse>, ApiError> {
    decide(ctx, principal, id, body, false).await
}

async fn decide(
    ctx: Arc<AppContext>,
    principal: Principal,
    id: String,
    body: Option<Json<DecisionRequest>>,
    approving: bool,
) -> Result<Json<DecisionResponse>, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    let workflow = ApprovalWorkflow::new(ctx.store.clone(), ctx.hub.clone());
    let outcome = if approving {
        workflow.approve(ctx.dispatcher.as_ref(), &principal, &id, reason.as_deref()).await
    } else {
        workflow.reject(ctx.dispatcher.as_ref(), &principal, &id, reason.as_deref()).await
    }
    .map_err(|code| ApiError::new(code, format!("could not decide approval {id}")))?;

    // spec.md §4.7: success is reported even on a dispatch failure — the
    // decision itself always lands, only the live runner notification can
    // fail. The message narrates that failure instead of the HTTP status.
    // A decision that conflicts with an already-decided approval (e.g.
    // `approve` after a prior `reject`) is the one case success is false.
    let message = if outcome.conflict {
        Some(format!("approval already {:?}; decision not applied", outcome.approval.status).to_lowercase())
    } else {
        outcome.dispatch_failed.then(|| "decision recorded; runner dispatch failed".to_string())
    };
    Ok(Json(DecisionResponse { success: !outcome.conflict, message, approval: outcome.approval }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Scope;
    use crate::config::DaemonConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use axum::extract::{Extension as ExtractExtension, Path as ExtractPath, State as ExtractState};

    async fn ctx_with_approval() -> (Arc<AppContext>, String) {
        let ctx = Arc::new(AppContext::new(Arc::new(DaemonConfig::default()), Arc::new(MemoryStore::new()), "test-daemon".into(), None));
        let session = ctx.store.create_session("alice", "/tmp/a", None, None).await.unwrap();
        let approval = ctx
            .store
            .create_pending_approval(&session.id, "bash", serde_json::json!({"cmd": "ls"}), 0.2, 300)
            .await
            .unwrap();
        (ctx, approval.id)
    }

    #[tokio::test]
    async fn approve_succeeds_even_without_a_live_runner() {
        let (ctx, id) = ctx_with_approval().await;
        let alice = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        let Json(resp) = approve(ExtractState(ctx), ExtractExtension(alice), ExtractPath(id), None).await.unwrap();
        assert!(resp.success);
        assert!(resp.message.is_some());
    }

    #[tokio::test]
    async fn list_approvals_hides_other_principals_sessions() {
        let (ctx, _id) = ctx_with_approval().await;
        let bob = Principal { name: "bob".into(), scope: Scope::Member, token_id: None };
        let Json(visible) = list_approvals(ExtractState(ctx), ExtractExtension(bob)).await.unwrap();
        assert!(visible.is_empty());
    }
}
