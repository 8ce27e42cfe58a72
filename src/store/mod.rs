//! The persistent-store contract this crate consumes (spec.md §6.3).
//!
//! Everything durable — sessions, session tokens, auth sessions, API
//! tokens, CLI tickets, pending approvals, settings, audit log, plan
//! membership — lives behind the [`Store`] trait so the core never
//! hard-codes a storage engine. [`sqlite::SqliteStore`] is the shipped
//! implementation; tests use [`memory::MemoryStore`].
//!
//! Grounded on `storage/mod.rs` (`SqlitePool` + WAL pragmas + query
//! timeout guard) and `storage/event_log.rs` (`AuditEntry`/rotation
//! idiom) in the teacher daemon.

pub mod memory;
pub mod sqlite;

use crate::auth::Scope;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Session ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Owning principal name. Empty means "unowned" — operator-only access.
    pub principal: String,
    pub project_path: String,
    pub git_repo: Option<String>,
    pub git_branch: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

// ─── Auth session (browser cookie credential) ──────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub principal: String,
    pub scope: Scope,
    pub token_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

pub const AUTH_SESSION_TTL_SECS: i64 = 24 * 60 * 60;

// ─── API token ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTokenMeta {
    pub id: String,
    pub principal: String,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

// ─── CLI ticket / magic link ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketKind {
    Cli,
    MagicLink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliTicket {
    pub id: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub kind: TicketKind,
    pub label: Option<String>,
    pub principal: Option<String>,
    pub scope: Option<Scope>,
    pub session_token: Option<String>,
    pub approved: bool,
    pub consumed: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub const CLI_TICKET_TTL_SECS: i64 = 5 * 60;
pub const MAGIC_LINK_MAX_TTL_SECS: i64 = 60 * 60;

impl CliTicket {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Constant-time secret comparison (spec.md §3 "MatchesSecret").
    pub fn matches_secret(&self, candidate: &str) -> bool {
        crate::auth::secrets_equal(&self.secret, candidate)
    }
}

// ─── Pending approval ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub risk_score: f64,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn is_expired(&self) -> bool {
        self.status == ApprovalStatus::Pending && Utc::now() > self.expires_at
    }
}

// ─── Audit log ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target: Option<String>,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            target: None,
            detail: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ─── Push subscription (minimal CRUD, per spec.md §6.3) ────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: String,
    pub principal: String,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
}

// ─── The contract ────────────────────────────────────────────────────────────

#[async_trait]
pub trait Store: Send + Sync {
    // Sessions
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    async fn create_session(
        &self,
        principal: &str,
        project_path: &str,
        git_repo: Option<&str>,
        git_branch: Option<&str>,
    ) -> Result<Session>;
    async fn delete_session(&self, id: &str) -> Result<bool>;
    async fn set_session_status(&self, id: &str, status: &str) -> Result<()>;
    async fn touch_session(&self, id: &str) -> Result<()>;

    // Session tokens
    async fn issue_session_token(&self, session_id: &str) -> Result<String>;
    async fn validate_session_token(&self, session_id: &str, token: &str) -> Result<bool>;

    // Auth sessions
    async fn create_auth_session(
        &self,
        principal: &str,
        scope: Scope,
        token_id: Option<&str>,
    ) -> Result<AuthSession>;
    async fn get_auth_session(&self, token: &str) -> Result<Option<AuthSession>>;
    async fn touch_auth_session(&self, token: &str) -> Result<()>;
    async fn revoke_auth_session(&self, token: &str) -> Result<()>;

    // API tokens
    async fn list_api_tokens(&self) -> Result<Vec<ApiTokenMeta>>;
    async fn create_api_token(&self, principal: &str, scope: Scope) -> Result<(ApiTokenMeta, String)>;
    async fn revoke_api_token(&self, id: &str) -> Result<bool>;
    async fn validate_api_token(&self, token: &str) -> Result<Option<ApiTokenMeta>>;

    // CLI tickets / magic links
    async fn create_cli_ticket(
        &self,
        kind: TicketKind,
        label: Option<&str>,
        ttl_secs: i64,
        principal: Option<&str>,
        scope: Option<Scope>,
    ) -> Result<CliTicket>;
    async fn get_cli_ticket(&self, id: &str) -> Result<Option<CliTicket>>;
    async fn approve_cli_ticket(
        &self,
        id: &str,
        principal: &str,
        scope: Scope,
        session_token: &str,
    ) -> Result<Option<CliTicket>>;
    async fn consume_cli_ticket(&self, id: &str) -> Result<Option<CliTicket>>;
    async fn cleanup_expired_tickets(&self) -> Result<u64>;

    // Pending approvals
    async fn create_pending_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
        risk_score: f64,
        ttl_secs: i64,
    ) -> Result<PendingApproval>;
    async fn get_pending_approval(&self, id: &str) -> Result<Option<PendingApproval>>;
    async fn update_pending_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        reason: Option<&str>,
    ) -> Result<Option<PendingApproval>>;
    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>>;

    // Push subscriptions
    async fn create_push_subscription(&self, principal: &str, endpoint: &str) -> Result<PushSubscription>;
    async fn list_push_subscriptions(&self, principal: &str) -> Result<Vec<PushSubscription>>;
    async fn delete_push_subscription(&self, id: &str) -> Result<bool>;

    // Settings (allow-listed keys)
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    // Audit log — best-effort, must never block the caller's success path.
    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;
    async fn list_audit(&self, limit: i64) -> Result<Vec<AuditEntry>>;

    // Plan membership
    async fn list_plan_ids_for_principal(&self, principal: &str) -> Result<Vec<String>>;
    async fn principal_has_plan(&self, principal: &str, plan_id: &str) -> Result<bool>;
}

/// Settings keys the core will read or write. `set_setting` implementations
/// MUST reject any key outside this list (spec.md §6.3).
pub const SETTINGS_ALLOW_LIST: &[&str] = &["daemon_id", "auth_token_rotated_at"];

/// Generate `n_bytes` of randomness as a lowercase hex string, by
/// concatenating `uuid::Uuid::new_v4()` output (each UUID contributes 16
/// random bytes) and trimming to length. Avoids pulling in a standalone CSPRNG
/// crate for what the teacher daemon already gets randomness from elsewhere
/// (`uuid`'s `v4` feature depends on `getrandom` internally).
pub fn random_hex(n_bytes: usize) -> String {
    let mut out = String::with_capacity(n_bytes * 2);
    while out.len() < n_bytes * 2 {
        out.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    out.truncate(n_bytes * 2);
    out
}
