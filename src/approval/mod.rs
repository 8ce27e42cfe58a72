//! Pending tool-call approval lifecycle (spec.md §4.7).
//!
//! Grounded on the `tool.approve`/`tool.reject` dispatch entries in the
//! teacher's `ipc/mod.rs` and `pairing/handlers.rs`'s error-sentinel-
//! string convention, reused here for the expired/already-decided cases
//! the RPC error classifier needs to tell apart.

use crate::access::can_access_session;
use crate::auth::Principal;
use crate::error::ErrorCode;
use crate::hub::{Event, EventHub};
use crate::rpc::SessionDispatcher;
use crate::store::{ApprovalStatus, AuditEntry, PendingApproval, Store};
use std::sync::Arc;

pub struct ApprovalWorkflow {
    store: Arc<dyn Store>,
    hub: EventHub,
}

/// Outcome of a decision call. `dispatch_failed` lets the HTTP layer
/// report success=true with a narrated dispatch failure, per spec.md
/// §4.7 ("the HTTP response is success=true but the message narrates the
/// dispatch failure"). `conflict` is set when the approval was already
/// decided the *other* way (spec.md §4.7: "a second `approve` on a
/// rejected approval returns a non-success message").
pub struct DecisionOutcome {
    pub approval: PendingApproval,
    pub dispatch_failed: bool,
    pub conflict: bool,
}

impl ApprovalWorkflow {
    pub fn new(store: Arc<dyn Store>, hub: EventHub) -> Self {
        Self { store, hub }
    }

    /// Approvals visible to `principal`, skipping any past `expiresAt`
    /// (they remain in the store, undecided, until explicitly decided).
    pub async fn list_visible(&self, principal: &Principal) -> anyhow::Result<Vec<PendingApproval>> {
        let all = self.store.list_pending_approvals().await?;
        let mut visible = Vec::new();
        for approval in all {
            if approval.is_expired() {
                continue;
            }
            if let Some(session) = self.store.get_session(&approval.session_id).await? {
                if can_access_session(principal, &session) {
                    visible.push(approval);
                }
            }
        }
        Ok(visible)
    }

    async fn decide(
        &self,
        dispatcher: &dyn SessionDispatcher,
        principal: &Principal,
        approval_id: &str,
        status: ApprovalStatus,
        reason: Option<&str>,
    ) -> Result<DecisionOutcome, ErrorCode> {
        let approval = self.store.get_pending_approval(approval_id).await.map_err(|_| ErrorCode::Storage)?;
        let Some(approval) = approval else { return Err(ErrorCode::NotFound) };
        let session = self.store.get_session(&approval.session_id).await.map_err(|_| ErrorCode::Storage)?;
        let Some(session) = session else { return Err(ErrorCode::NotFound) };
        if !can_access_session(principal, &session) {
            return Err(ErrorCode::NotFound);
        }

        // Idempotent re-decision: a second `approve` on an already-approved
        // approval re-notifies the runner rather than erroring. A decision
        // that conflicts with the stored terminal state (e.g. `approve`
        // after a prior `reject`) is a no-op: the stored status wins and
        // the caller is told the decision did not take (spec.md §4.7).
        let already_decided = approval.status != ApprovalStatus::Pending;
        let conflict = already_decided && approval.status != status;
        let updated = if already_decided {
            approval
        } else {
            self.store
                .update_pending_approval(approval_id, status, &principal.name, reason)
                .await
                .map_err(|_| ErrorCode::Storage)?
                .ok_or(ErrorCode::NotFound)?
        };

        if !already_decided {
            self.hub
                .broadcast(
                    Event::new(
                        "approval.decided",
                        serde_json::json!({
                            "id": updated.id,
                            "status": updated.status,
                            "decidedBy": updated.decided_by,
                        }),
                    )
                    .with_session(updated.session_id.clone()),
                )
                .await;
            let _ = self
                .store
                .append_audit(
                    AuditEntry::new(principal.name.clone(), "approval.decide")
                        .target(approval_id)
                        .detail(format!("{:?}", updated.status)),
                )
                .await;
        }

        if conflict {
            return Ok(DecisionOutcome { approval: updated, dispatch_failed: false, conflict: true });
        }

        let dispatch_result = dispatcher
            .dispatch(
                &updated.session_id,
                "approval",
                serde_json::json!({
                    "id": updated.id,
                    "approved": updated.status == ApprovalStatus::Approved,
                    "reason": updated.decision_reason,
                }),
            )
            .await;
        let dispatch_failed = matches!(dispatch_result, Ok(false) | Err(_));

        Ok(DecisionOutcome { approval: updated, dispatch_failed, conflict: false })
    }

    pub async fn approve(
        &self,
        dispatcher: &dyn SessionDispatcher,
        principal: &Principal,
        approval_id: &str,
        reason: Option<&str>,
    ) -> Result<DecisionOutcome, ErrorCode> {
        self.decide(dispatcher, principal, approval_id, ApprovalStatus::Approved, reason).await
    }

    pub async fn reject(
        &self,
        dispatcher: &dyn SessionDispatcher,
        principal: &Principal,
        approval_id: &str,
        reason: Option<&str>,
    ) -> Result<DecisionOutcome, ErrorCode> {
        self.decide(dispatcher, principal, approval_id, ApprovalStatus::Rejected, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Scope;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDispatcher(AtomicUsize);

    #[async_trait]
    impl SessionDispatcher for CountingDispatcher {
        async fn dispatch(&self, _session_id: &str, _kind: &str, _payload: serde_json::Value) -> anyhow::Result<bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    async fn setup() -> (Arc<dyn Store>, ApprovalWorkflow, Principal, String) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let session = store.create_session("alice", "/tmp/proj", None, None).await.unwrap();
        let approval = store
            .create_pending_approval(&session.id, "bash", serde_json::json!({"cmd": "ls"}), 0.1, 300)
            .await
            .unwrap();
        let workflow = ApprovalWorkflow::new(store.clone(), EventHub::new());
        let principal = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        (store, workflow, principal, approval.id)
    }

    #[tokio::test]
    async fn approve_then_second_approve_is_idempotent_and_redispatches() {
        let (_store, workflow, principal, approval_id) = setup().await;
        let dispatcher = CountingDispatcher(AtomicUsize::new(0));
        let first = workflow.approve(&dispatcher, &principal, &approval_id, None).await.unwrap();
        assert_eq!(first.approval.status, ApprovalStatus::Approved);
        let second = workflow.approve(&dispatcher, &principal, &approval_id, None).await.unwrap();
        assert_eq!(second.approval.status, ApprovalStatus::Approved);
        assert_eq!(dispatcher.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn approve_after_reject_is_a_conflict_and_does_not_redispatch() {
        let (_store, workflow, principal, approval_id) = setup().await;
        let dispatcher = CountingDispatcher(AtomicUsize::new(0));
        let rejected = workflow.reject(&dispatcher, &principal, &approval_id, None).await.unwrap();
        assert_eq!(rejected.approval.status, ApprovalStatus::Rejected);
        assert!(!rejected.conflict);

        let second = workflow.approve(&dispatcher, &principal, &approval_id, None).await.unwrap();
        assert_eq!(second.approval.status, ApprovalStatus::Rejected);
        assert!(second.conflict);
        assert_eq!(dispatcher.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_owner_cannot_see_or_decide() {
        let (_store, workflow, _principal, approval_id) = setup().await;
        let bob = Principal { name: "bob".into(), scope: Scope::Member, token_id: None };
        let dispatcher = CountingDispatcher(AtomicUsize::new(0));
        assert!(workflow.list_visible(&bob).await.unwrap().is_empty());
        let result = workflow.approve(&dispatcher, &bob, &approval_id, None).await;
        assert!(matches!(result, Err(ErrorCode::NotFound)));
    }
}
