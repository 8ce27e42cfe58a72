//! In-memory [`Store`] fake used by tests (and by `--data-dir :memory:`
//! smoke runs). No persistence across process restarts.

use super::{
    AuditEntry, ApiTokenMeta, ApprovalStatus, AuthSession, CliTicket, PendingApproval,
    PushSubscription, Session, Store, TicketKind, AUTH_SESSION_TTL_SECS, SETTINGS_ALLOW_LIST,
};
use crate::auth::Scope;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    session_tokens: HashMap<String, String>,
    auth_sessions: HashMap<String, AuthSession>,
    api_tokens: HashMap<String, (ApiTokenMeta, String)>,
    cli_tickets: HashMap<String, CliTicket>,
    pending_approvals: HashMap<String, PendingApproval>,
    push_subscriptions: HashMap<String, PushSubscription>,
    settings: HashMap<String, String>,
    audit_log: Vec<AuditEntry>,
    plan_membership: HashMap<String, Vec<String>>,
}

/// Test-only store. All state lives behind one `Mutex`; fine for the
/// single-threaded-ish load a test harness puts on it.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let inner = self.inner.lock().unwrap();
        let mut v: Vec<Session> = inner.sessions.values().cloned().collect();
        v.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(v)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(id).cloned())
    }

    async fn create_session(
        &self,
        principal: &str,
        project_path: &str,
        git_repo: Option<&str>,
        git_branch: Option<&str>,
    ) -> Result<Session> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let session = Session {
            id: format!("s-{}", super::random_hex(8)),
            principal: principal.to_string(),
            project_path: project_path.to_string(),
            git_repo: git_repo.map(str::to_string),
            git_branch: git_branch.map(str::to_string),
            status: "active".to_string(),
            created_at: now,
            last_active: now,
        };
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.session_tokens.remove(id);
        Ok(inner.sessions.remove(id).is_some())
    }

    async fn set_session_status(&self, id: &str, status: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.sessions.get_mut(id) {
            s.status = status.to_string();
        }
        Ok(())
    }

    async fn touch_session(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.sessions.get_mut(id) {
            s.last_active = Utc::now();
        }
        Ok(())
    }

    async fn issue_session_token(&self, session_id: &str) -> Result<String> {
        let token = super::random_hex(24);
        let mut inner = self.inner.lock().unwrap();
        inner.session_tokens.insert(session_id.to_string(), hash_token(&token));
        Ok(token)
    }

    async fn validate_session_token(&self, session_id: &str, token: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(match inner.session_tokens.get(session_id) {
            Some(stored) => crate::auth::secrets_equal(stored, &hash_token(token)),
            None => false,
        })
    }

    async fn create_auth_session(
        &self,
        principal: &str,
        scope: Scope,
        token_id: Option<&str>,
    ) -> Result<AuthSession> {
        let token = super::random_hex(32);
        let auth_session = AuthSession {
            token: token.clone(),
            principal: principal.to_string(),
            scope,
            token_id: token_id.map(str::to_string),
            expires_at: Utc::now() + Duration::seconds(AUTH_SESSION_TTL_SECS),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.auth_sessions.insert(hash_token(&token), auth_session.clone());
        Ok(auth_session)
    }

    async fn get_auth_session(&self, token: &str) -> Result<Option<AuthSession>> {
        let mut inner = self.inner.lock().unwrap();
        let key = hash_token(token);
        match inner.auth_sessions.get(&key) {
            Some(s) if Utc::now() <= s.expires_at => Ok(Some(s.clone())),
            Some(_) => {
                inner.auth_sessions.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn touch_auth_session(&self, token: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.auth_sessions.get_mut(&hash_token(token)) {
            s.expires_at = Utc::now() + Duration::seconds(AUTH_SESSION_TTL_SECS);
        }
        Ok(())
    }

    async fn revoke_auth_session(&self, token: &str) -> Result<()> {
        self.inner.lock().unwrap().auth_sessions.remove(&hash_token(token));
        Ok(())
    }

    async fn list_api_tokens(&self) -> Result<Vec<ApiTokenMeta>> {
        Ok(self.inner.lock().unwrap().api_tokens.values().map(|(m, _)| m.clone()).collect())
    }

    async fn create_api_token(&self, principal: &str, scope: Scope) -> Result<(ApiTokenMeta, String)> {
        let id = format!("tok_{}", super::random_hex(8));
        let token = format!("bky_{}", super::random_hex(24));
        let meta = ApiTokenMeta {
            id: id.clone(),
            principal: principal.to_string(),
            scope,
            created_at: Utc::now(),
            revoked_at: None,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.api_tokens.insert(id, (meta.clone(), hash_token(&token)));
        Ok((meta, token))
    }

    async fn revoke_api_token(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((meta, _)) = inner.api_tokens.get_mut(id) {
            if meta.revoked_at.is_some() {
                return Ok(false);
            }
            meta.revoked_at = Some(Utc::now());
            return Ok(true);
        }
        Ok(false)
    }

    async fn validate_api_token(&self, token: &str) -> Result<Option<ApiTokenMeta>> {
        let inner = self.inner.lock().unwrap();
        let hashed = hash_token(token);
        for (meta, stored) in inner.api_tokens.values() {
            if meta.revoked_at.is_none() && crate::auth::secrets_equal(stored, &hashed) {
                return Ok(Some(meta.clone()));
            }
        }
        Ok(None)
    }

    async fn create_cli_ticket(
        &self,
        kind: TicketKind,
        label: Option<&str>,
        ttl_secs: i64,
        principal: Option<&str>,
        scope: Option<Scope>,
    ) -> Result<CliTicket> {
        let now = Utc::now();
        let ticket = CliTicket {
            id: format!("ml_{}", super::random_hex(10)),
            secret: super::random_hex(24),
            kind,
            label: label.map(str::to_string),
            principal: principal.map(str::to_string),
            scope,
            session_token: None,
            approved: kind == TicketKind::MagicLink,
            consumed: false,
            expires_at: now + Duration::seconds(ttl_secs),
            created_at: now,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.cli_tickets.insert(ticket.id.clone(), ticket.clone());
        Ok(ticket)
    }

    async fn get_cli_ticket(&self, id: &str) -> Result<Option<CliTicket>> {
        Ok(self.inner.lock().unwrap().cli_tickets.get(id).cloned())
    }

    async fn approve_cli_ticket(
        &self,
        id: &str,
        principal: &str,
        scope: Scope,
        session_token: &str,
    ) -> Result<Option<CliTicket>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(ticket) = inner.cli_tickets.get_mut(id) else { return Ok(None) };
        if ticket.approved || ticket.consumed {
            return Ok(None);
        }
        ticket.approved = true;
        ticket.principal = Some(principal.to_string());
        ticket.scope = Some(scope);
        ticket.session_token = Some(session_token.to_string());
        Ok(Some(ticket.clone()))
    }

    async fn consume_cli_ticket(&self, id: &str) -> Result<Option<CliTicket>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(ticket) = inner.cli_tickets.get_mut(id) else { return Ok(None) };
        if !ticket.approved || ticket.consumed {
            return Ok(None);
        }
        ticket.consumed = true;
        Ok(Some(ticket.clone()))
    }

    async fn cleanup_expired_tickets(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let before = inner.cli_tickets.len();
        inner.cli_tickets.retain(|_, t| t.expires_at >= now);
        Ok((before - inner.cli_tickets.len()) as u64)
    }

    async fn create_pending_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
        risk_score: f64,
        ttl_secs: i64,
    ) -> Result<PendingApproval> {
        let now = Utc::now();
        let approval = PendingApproval {
            id: format!("approval-{}", super::random_hex(8)),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input,
            risk_score,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            decision_reason: None,
            expires_at: now + Duration::seconds(ttl_secs),
            created_at: now,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.pending_approvals.insert(approval.id.clone(), approval.clone());
        Ok(approval)
    }

    async fn get_pending_approval(&self, id: &str) -> Result<Option<PendingApproval>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(approval) = inner.pending_approvals.get_mut(id) else { return Ok(None) };
        if approval.is_expired() {
            approval.status = ApprovalStatus::Expired;
        }
        Ok(Some(approval.clone()))
    }

    async fn update_pending_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        reason: Option<&str>,
    ) -> Result<Option<PendingApproval>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(approval) = inner.pending_approvals.get_mut(id) else { return Ok(None) };
        if approval.status == ApprovalStatus::Pending {
            approval.status = status;
            approval.decided_by = Some(decided_by.to_string());
            approval.decided_at = Some(Utc::now());
            approval.decision_reason = reason.map(str::to_string);
        }
        Ok(Some(approval.clone()))
    }

    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        let mut v: Vec<PendingApproval> =
            self.inner.lock().unwrap().pending_approvals.values().cloned().collect();
        v.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(v)
    }

    async fn create_push_subscription(&self, principal: &str, endpoint: &str) -> Result<PushSubscription> {
        let sub = PushSubscription {
            id: format!("push-{}", super::random_hex(8)),
            principal: principal.to_string(),
            endpoint: endpoint.to_string(),
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().push_subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn list_push_subscriptions(&self, principal: &str) -> Result<Vec<PushSubscription>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .push_subscriptions
            .values()
            .filter(|s| s.principal == principal)
            .cloned()
            .collect())
    }

    async fn delete_push_subscription(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().push_subscriptions.remove(id).is_some())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        if !SETTINGS_ALLOW_LIST.contains(&key) {
            bail!("setting '{}' is not in the allow-list", key);
        }
        self.inner.lock().unwrap().settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.inner.lock().unwrap().audit_log.push(entry);
        Ok(())
    }

    async fn list_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let inner = self.inner.lock().unwrap();
        let n = inner.audit_log.len();
        let take = (limit.max(0) as usize).min(n);
        Ok(inner.audit_log[n - take..].iter().rev().cloned().collect())
    }

    async fn list_plan_ids_for_principal(&self, principal: &str) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().plan_membership.get(principal).cloned().unwrap_or_default())
    }

    async fn principal_has_plan(&self, principal: &str, plan_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .plan_membership
            .get(principal)
            .map(|v| v.iter().any(|p| p == plan_id))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_round_trip() {
        let store = MemoryStore::new();
        let s = store.create_session("alice", "/tmp/proj", None, None).await.unwrap();
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);
        assert!(store.get_session(&s.id).await.unwrap().is_some());
        assert!(store.delete_session(&s.id).await.unwrap());
        assert!(store.get_session(&s.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cli_ticket_requires_approval_before_consume() {
        let store = MemoryStore::new();
        let ticket = store
            .create_cli_ticket(TicketKind::Cli, None, 300, None, None)
            .await
            .unwrap();
        assert!(store.consume_cli_ticket(&ticket.id).await.unwrap().is_none());
        store
            .approve_cli_ticket(&ticket.id, "alice", Scope::Member, "sess-token")
            .await
            .unwrap()
            .expect("approval should succeed once");
        assert!(store
            .approve_cli_ticket(&ticket.id, "alice", Scope::Member, "sess-token")
            .await
            .unwrap()
            .is_none());
        let consumed = store.consume_cli_ticket(&ticket.id).await.unwrap().expect("now consumable");
        assert!(consumed.consumed);
        assert!(store.consume_cli_ticket(&ticket.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settings_allow_list_enforced() {
        let store = MemoryStore::new();
        assert!(store.set_setting("daemon_id", "abc").await.is_ok());
        assert!(store.set_setting("not_allowed", "x").await.is_err());
    }

    #[tokio::test]
    async fn pending_approval_decision_is_idempotent() {
        let store = MemoryStore::new();
        let approval = store
            .create_pending_approval("s-1", "bash", serde_json::json!({"cmd": "ls"}), 0.2, 300)
            .await
            .unwrap();
        let first = store
            .update_pending_approval(&approval.id, ApprovalStatus::Approved, "bob", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.status, ApprovalStatus::Approved);
        let second = store
            .update_pending_approval(&approval.id, ApprovalStatus::Rejected, "carol", None)
            .await
            .unwrap()
            .unwrap();
        // Already decided — second call must not flip the status.
        assert_eq!(second.status, ApprovalStatus::Approved);
        assert_eq!(second.decided_by.as_deref(), Some("bob"));
    }
}
