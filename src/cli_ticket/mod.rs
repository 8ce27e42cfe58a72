//! CLI-login ticket protocol and magic links (spec.md §4.8).
//!
//! Generalized from `pairing/model.rs`/`pairing/handlers.rs`'s device
//! pairing flow — the "public view strips the secret" and "audit on
//! issue" idioms carry over from pairing a device to approving a
//! headless CLI.

use crate::auth::{cookie, Principal, Scope};
use crate::error::ErrorCode;
use crate::store::{AuditEntry, CliTicket, Store, TicketKind, CLI_TICKET_TTL_SECS, MAGIC_LINK_MAX_TTL_SECS};
use serde::Serialize;
use std::sync::Arc;

/// Public view of a [`CliTicket`] — never carries the secret (spec.md
/// §4.8's `{ticket, secret, loginUrl, expiresAt}` create response is the
/// one exception, built separately in [`CliTicketService::create`]).
#[derive(Debug, Serialize)]
pub struct TicketView {
    pub id: String,
    pub status: &'static str,
    pub principal: Option<String>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl From<&CliTicket> for TicketView {
    fn from(t: &CliTicket) -> Self {
        let status = if t.consumed {
            "consumed"
        } else if t.approved {
            "approved"
        } else if t.is_expired() {
            "expired"
        } else {
            "pending"
        };
        Self { id: t.id.clone(), status, principal: t.principal.clone(), expires_at: t.expires_at }
    }
}

pub struct CreatedTicket {
    pub ticket: CliTicket,
    pub login_url: String,
}

pub struct CliTicketService {
    store: Arc<dyn Store>,
}

impl CliTicketService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// spec.md §4.8 step 1.
    pub async fn create(&self, label: Option<&str>, external_url: &str) -> anyhow::Result<CreatedTicket> {
        let ticket = self
            .store
            .create_cli_ticket(TicketKind::Cli, label, CLI_TICKET_TTL_SECS, None, None)
            .await?;
        let login_url = format!("{}/auth/cli/{}", external_url.trim_end_matches('/'), ticket.id);
        Ok(CreatedTicket { ticket, login_url })
    }

    /// spec.md §4.8 step 3: an authenticated member-or-higher browser
    /// principal approves the ticket. Mints a fresh auth session bound to
    /// the approver and stores its token on the ticket.
    pub async fn approve(&self, principal: &Principal, id: &str) -> Result<CliTicket, ErrorCode> {
        if !principal.has_scope(Scope::Member) {
            return Err(ErrorCode::PermissionDenied);
        }
        let session = self
            .store
            .create_auth_session(&principal.name, principal.scope, principal.token_id.as_deref())
            .await
            .map_err(|_| ErrorCode::Storage)?;
        let approved = self
            .store
            .approve_cli_ticket(id, &principal.name, principal.scope, &session.token)
            .await
            .map_err(|_| ErrorCode::Storage)?;
        let Some(ticket) = approved else {
            // Either unknown or already approved/consumed — spec.md treats
            // this path as the idempotency boundary for the interstitial.
            return Err(ErrorCode::FailedPrecondition);
        };
        let _ = self
            .store
            .append_audit(AuditEntry::new(principal.name.clone(), "cli_ticket.approve").target(id))
            .await;
        Ok(ticket)
    }

    /// spec.md §4.8 steps 2 and 4: poll with the secret, rate-limited by
    /// the caller (see `ratelimit::MinIntervalLimiter`, keyed by client
    /// IP); once approved, this same poll consumes the ticket (single-use)
    /// and returns the session token the caller sets as a cookie.
    pub async fn poll_and_consume(&self, id: &str, secret: &str) -> Result<(TicketView, String), ErrorCode> {
        let ticket = self.store.get_cli_ticket(id).await.map_err(|_| ErrorCode::Storage)?;
        let Some(ticket) = ticket else { return Err(ErrorCode::NotFound) };
        if ticket.is_expired() {
            return Err(ErrorCode::NotFound);
        }
        if !ticket.matches_secret(secret) {
            return Err(ErrorCode::Unauthenticated);
        }
        if !ticket.approved {
            return Ok((TicketView::from(&ticket), String::new()));
        }
        let consumed = self.store.consume_cli_ticket(id).await.map_err(|_| ErrorCode::Storage)?;
        let Some(consumed) = consumed else { return Err(ErrorCode::FailedPrecondition) };
        let session_token = consumed.session_token.clone().unwrap_or_default();
        Ok((TicketView::from(&consumed), session_token))
    }

    /// Magic links: pre-approved at creation time by their creator, with
    /// an explicit scope no higher than the creator's own (spec.md §4.8).
    pub async fn create_magic_link(
        &self,
        creator: &Principal,
        label: Option<&str>,
        ttl_secs: i64,
        scope: Scope,
    ) -> Result<CliTicket, ErrorCode> {
        if scope > creator.scope {
            return Err(ErrorCode::PermissionDenied);
        }
        let ttl = ttl_secs.clamp(1, MAGIC_LINK_MAX_TTL_SECS);
        self.store
            .create_cli_ticket(TicketKind::MagicLink, label, ttl, Some(&creator.name), Some(scope))
            .await
            .map_err(|_| ErrorCode::Storage)
    }

    /// `GET /auth/magic/{token}?id=<ticket>` redemption: validates,
    /// consumes, issues an auth session, and returns the `Set-Cookie`
    /// header value the caller should attach to the redirect response.
    pub async fn redeem_magic_link(&self, id: &str, token: &str, secure: bool) -> Result<String, ErrorCode> {
        let ticket = self.store.get_cli_ticket(id).await.map_err(|_| ErrorCode::Storage)?;
        let Some(ticket) = ticket else { return Err(ErrorCode::NotFound) };
        if ticket.kind != TicketKind::MagicLink || ticket.is_expired() || ticket.consumed {
            return Err(ErrorCode::NotFound);
        }
        if !ticket.matches_secret(token) {
            return Err(ErrorCode::Unauthenticated);
        }
        let Some(principal_name) = &ticket.principal else { return Err(ErrorCode::FailedPrecondition) };
        let scope = ticket.scope.ok_or(ErrorCode::FailedPrecondition)?;
        let session = self
            .store
            .create_auth_session(principal_name, scope, None)
            .await
            .map_err(|_| ErrorCode::Storage)?;
        self.store.consume_cli_ticket(id).await.map_err(|_| ErrorCode::Storage)?;
        Ok(cookie::set_cookie_header(&session.token, crate::store::AUTH_SESSION_TTL_SECS, secure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn full_cli_ticket_lifecycle() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let service = CliTicketService::new(store);
        let created = service.create(Some("laptop"), "http://127.0.0.1:4488").await.unwrap();

        // Poll before approval: pending, and not yet consumed.
        let (pending, token) = service.poll_and_consume(&created.ticket.id, &created.ticket.secret).await.unwrap();
        assert_eq!(pending.status, "pending");
        assert!(token.is_empty());

        let approver = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        service.approve(&approver, &created.ticket.id).await.unwrap();

        let (view, session_token) =
            service.poll_and_consume(&created.ticket.id, &created.ticket.secret).await.unwrap();
        assert_eq!(view.status, "consumed");
        assert!(!session_token.is_empty());

        // Second consume attempt fails — single-use.
        let second = service.poll_and_consume(&created.ticket.id, &created.ticket.secret).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn magic_link_cannot_exceed_creator_scope() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let service = CliTicketService::new(store);
        let member = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        let result = service.create_magic_link(&member, None, 600, Scope::Operator).await;
        assert!(matches!(result, Err(ErrorCode::PermissionDenied)));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let service = CliTicketService::new(store);
        let created = service.create(None, "http://127.0.0.1:4488").await.unwrap();
        let result = service.poll_and_consume(&created.ticket.id, "wrong-secret-wrong-secret-wrong").await;
        assert!(matches!(result, Err(ErrorCode::Unauthenticated)));
    }
}
