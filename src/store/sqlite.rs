//! SQLite-backed [`Store`] implementation.
//!
//! Grounded on `storage/mod.rs` in the teacher daemon: WAL journal mode,
//! `NORMAL` synchronous pragma, and a per-query timeout guard.

use super::{
    AuditEntry, AuthSession, ApiTokenMeta, ApprovalStatus, CliTicket, PendingApproval,
    PushSubscription, Session, Store, TicketKind, AUTH_SESSION_TTL_SECS, SETTINGS_ALLOW_LIST,
};
use crate::auth::Scope;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr};

const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(r) => r,
        Err(_) => bail!("database query timed out after {}s", QUERY_TIMEOUT.as_secs()),
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn scope_str(s: Scope) -> &'static str {
    s.as_str()
}

fn parse_scope(s: &str) -> Result<Scope> {
    Scope::parse(s).ok_or_else(|| anyhow::anyhow!("invalid scope '{}' in storage row", s))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("buckley.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                principal TEXT NOT NULL,
                project_path TEXT NOT NULL,
                git_repo TEXT,
                git_branch TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_active TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS session_tokens (
                session_id TEXT PRIMARY KEY,
                token_hash TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS auth_sessions (
                token_hash TEXT PRIMARY KEY,
                principal TEXT NOT NULL,
                scope TEXT NOT NULL,
                token_id TEXT,
                expires_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS api_tokens (
                id TEXT PRIMARY KEY,
                principal TEXT NOT NULL,
                scope TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                revoked_at TEXT
            );
            CREATE TABLE IF NOT EXISTS cli_tickets (
                id TEXT PRIMARY KEY,
                secret TEXT NOT NULL,
                kind TEXT NOT NULL,
                label TEXT,
                principal TEXT,
                scope TEXT,
                session_token TEXT,
                approved INTEGER NOT NULL DEFAULT 0,
                consumed INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pending_approvals (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                tool_input TEXT NOT NULL,
                risk_score REAL NOT NULL,
                status TEXT NOT NULL,
                decided_by TEXT,
                decided_at TEXT,
                decision_reason TEXT,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS push_subscriptions (
                id TEXT PRIMARY KEY,
                principal TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                target TEXT,
                detail TEXT
            );
            CREATE TABLE IF NOT EXISTS plan_membership (
                principal TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                PRIMARY KEY (principal, plan_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
        Ok(Session {
            id: row.try_get("id")?,
            principal: row.try_get("principal")?,
            project_path: row.try_get("project_path")?,
            git_repo: row.try_get("git_repo")?,
            git_branch: row.try_get("git_branch")?,
            status: row.try_get("status")?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
            last_active: parse_ts(&row.try_get::<String, _>("last_active")?)?,
        })
    }

    fn row_to_ticket(row: &sqlx::sqlite::SqliteRow) -> Result<CliTicket> {
        let kind_str: String = row.try_get("kind")?;
        let scope_str: Option<String> = row.try_get("scope")?;
        Ok(CliTicket {
            id: row.try_get("id")?,
            secret: row.try_get("secret")?,
            kind: if kind_str == "cli" { TicketKind::Cli } else { TicketKind::MagicLink },
            label: row.try_get("label")?,
            principal: row.try_get("principal")?,
            scope: scope_str.map(|s| parse_scope(&s)).transpose()?,
            session_token: row.try_get("session_token")?,
            approved: row.try_get::<i64, _>("approved")? != 0,
            consumed: row.try_get::<i64, _>("consumed")? != 0,
            expires_at: parse_ts(&row.try_get::<String, _>("expires_at")?)?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn row_to_approval(row: &sqlx::sqlite::SqliteRow) -> Result<PendingApproval> {
        let status_str: String = row.try_get("status")?;
        let status = match status_str.as_str() {
            "pending" => ApprovalStatus::Pending,
            "approved" => ApprovalStatus::Approved,
            "rejected" => ApprovalStatus::Rejected,
            _ => ApprovalStatus::Expired,
        };
        let decided_at: Option<String> = row.try_get("decided_at")?;
        let input_str: String = row.try_get("tool_input")?;
        Ok(PendingApproval {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            tool_name: row.try_get("tool_name")?,
            tool_input: serde_json::from_str(&input_str).unwrap_or(serde_json::Value::Null),
            risk_score: row.try_get("risk_score")?,
            status,
            decided_by: row.try_get("decided_by")?,
            decided_at: decided_at.map(|s| parse_ts(&s)).transpose()?,
            decision_reason: row.try_get("decision_reason")?,
            expires_at: parse_ts(&row.try_get::<String, _>("expires_at")?)?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_sessions(&self) -> Result<Vec<Session>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::row_to_session).collect()
        })
        .await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        with_timeout(async {
            let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::row_to_session).transpose()
        })
        .await
    }

    async fn create_session(
        &self,
        principal: &str,
        project_path: &str,
        git_repo: Option<&str>,
        git_branch: Option<&str>,
    ) -> Result<Session> {
        with_timeout(async {
            let id = format!("s-{}", super::random_hex(8));
            let now = Utc::now();
            sqlx::query(
                "INSERT INTO sessions (id, principal, project_path, git_repo, git_branch, status, created_at, last_active)
                 VALUES (?, ?, ?, ?, ?, 'active', ?, ?)",
            )
            .bind(&id)
            .bind(principal)
            .bind(project_path)
            .bind(git_repo)
            .bind(git_branch)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(Session {
                id,
                principal: principal.to_string(),
                project_path: project_path.to_string(),
                git_repo: git_repo.map(str::to_string),
                git_branch: git_branch.map(str::to_string),
                status: "active".to_string(),
                created_at: now,
                last_active: now,
            })
        })
        .await
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        with_timeout(async {
            let res = sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM session_tokens WHERE session_id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(res.rows_affected() > 0)
        })
        .await
    }

    async fn set_session_status(&self, id: &str, status: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
                .bind(status)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn touch_session(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET last_active = ? WHERE id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn issue_session_token(&self, session_id: &str) -> Result<String> {
        with_timeout(async {
            let token = super::random_hex(24); // 48 hex chars
            sqlx::query(
                "INSERT INTO session_tokens (session_id, token_hash) VALUES (?, ?)
                 ON CONFLICT(session_id) DO UPDATE SET token_hash = excluded.token_hash",
            )
            .bind(session_id)
            .bind(hash_token(&token))
            .execute(&self.pool)
            .await?;
            Ok(token)
        })
        .await
    }

    async fn validate_session_token(&self, session_id: &str, token: &str) -> Result<bool> {
        with_timeout(async {
            let row = sqlx::query("SELECT token_hash FROM session_tokens WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(match row {
                Some(r) => {
                    let stored: String = r.try_get("token_hash")?;
                    crate::auth::secrets_equal(&stored, &hash_token(token))
                }
                None => false,
            })
        })
        .await
    }

    async fn create_auth_session(
        &self,
        principal: &str,
        scope: Scope,
        token_id: Option<&str>,
    ) -> Result<AuthSession> {
        with_timeout(async {
            let token = super::random_hex(32); // 64 hex chars
            let expires_at = Utc::now() + Duration::seconds(AUTH_SESSION_TTL_SECS);
            sqlx::query(
                "INSERT INTO auth_sessions (token_hash, principal, scope, token_id, expires_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(hash_token(&token))
            .bind(principal)
            .bind(scope_str(scope))
            .bind(token_id)
            .bind(expires_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(AuthSession {
                token,
                principal: principal.to_string(),
                scope,
                token_id: token_id.map(str::to_string),
                expires_at,
            })
        })
        .await
    }

    async fn get_auth_session(&self, token: &str) -> Result<Option<AuthSession>> {
        with_timeout(async {
            let row = sqlx::query("SELECT * FROM auth_sessions WHERE token_hash = ?")
                .bind(hash_token(token))
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else { return Ok(None) };
            let expires_at = parse_ts(&row.try_get::<String, _>("expires_at")?)?;
            if Utc::now() > expires_at {
                return Ok(None);
            }
            Ok(Some(AuthSession {
                token: token.to_string(),
                principal: row.try_get("principal")?,
                scope: parse_scope(&row.try_get::<String, _>("scope")?)?,
                token_id: row.try_get("token_id")?,
                expires_at,
            }))
        })
        .await
    }

    async fn touch_auth_session(&self, token: &str) -> Result<()> {
        with_timeout(async {
            let expires_at = Utc::now() + Duration::seconds(AUTH_SESSION_TTL_SECS);
            sqlx::query("UPDATE auth_sessions SET expires_at = ? WHERE token_hash = ?")
                .bind(expires_at.to_rfc3339())
                .bind(hash_token(token))
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn revoke_auth_session(&self, token: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM auth_sessions WHERE token_hash = ?")
                .bind(hash_token(token))
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_api_tokens(&self) -> Result<Vec<ApiTokenMeta>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT id, principal, scope, created_at, revoked_at FROM api_tokens")
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(|row| -> Result<ApiTokenMeta> {
                    let revoked_at: Option<String> = row.try_get("revoked_at")?;
                    Ok(ApiTokenMeta {
                        id: row.try_get("id")?,
                        principal: row.try_get("principal")?,
                        scope: parse_scope(&row.try_get::<String, _>("scope")?)?,
                        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
                        revoked_at: revoked_at.map(|s| parse_ts(&s)).transpose()?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn create_api_token(&self, principal: &str, scope: Scope) -> Result<(ApiTokenMeta, String)> {
        with_timeout(async {
            let id = format!("tok_{}", super::random_hex(8));
            let token = format!("bky_{}", super::random_hex(24));
            let now = Utc::now();
            sqlx::query(
                "INSERT INTO api_tokens (id, principal, scope, token_hash, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(principal)
            .bind(scope_str(scope))
            .bind(hash_token(&token))
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok((
                ApiTokenMeta {
                    id,
                    principal: principal.to_string(),
                    scope,
                    created_at: now,
                    revoked_at: None,
                },
                token,
            ))
        })
        .await
    }

    async fn revoke_api_token(&self, id: &str) -> Result<bool> {
        with_timeout(async {
            let res = sqlx::query("UPDATE api_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(res.rows_affected() > 0)
        })
        .await
    }

    async fn validate_api_token(&self, token: &str) -> Result<Option<ApiTokenMeta>> {
        with_timeout(async {
            let rows = sqlx::query(
                "SELECT id, principal, scope, token_hash, created_at, revoked_at FROM api_tokens WHERE revoked_at IS NULL",
            )
            .fetch_all(&self.pool)
            .await?;
            let hashed = hash_token(token);
            for row in rows {
                let stored: String = row.try_get("token_hash")?;
                if crate::auth::secrets_equal(&stored, &hashed) {
                    return Ok(Some(ApiTokenMeta {
                        id: row.try_get("id")?,
                        principal: row.try_get("principal")?,
                        scope: parse_scope(&row.try_get::<String, _>("scope")?)?,
                        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
                        revoked_at: None,
                    }));
                }
            }
            Ok(None)
        })
        .await
    }

    async fn create_cli_ticket(
        &self,
        kind: TicketKind,
        label: Option<&str>,
        ttl_secs: i64,
        principal: Option<&str>,
        scope: Option<Scope>,
    ) -> Result<CliTicket> {
        with_timeout(async {
            let id = format!("ml_{}", super::random_hex(10)); // 20 hex chars
            let secret = super::random_hex(24); // 48 hex chars
            let now = Utc::now();
            let expires_at = now + Duration::seconds(ttl_secs);
            let kind_str = if kind == TicketKind::Cli { "cli" } else { "magic_link" };
            let approved = if kind == TicketKind::MagicLink { 1 } else { 0 };
            sqlx::query(
                "INSERT INTO cli_tickets (id, secret, kind, label, principal, scope, approved, consumed, expires_at, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
            )
            .bind(&id)
            .bind(&secret)
            .bind(kind_str)
            .bind(label)
            .bind(principal)
            .bind(scope.map(scope_str))
            .bind(approved)
            .bind(expires_at.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(CliTicket {
                id,
                secret,
                kind,
                label: label.map(str::to_string),
                principal: principal.map(str::to_string),
                scope,
                session_token: None,
                approved: approved != 0,
                consumed: false,
                expires_at,
                created_at: now,
            })
        })
        .await
    }

    async fn get_cli_ticket(&self, id: &str) -> Result<Option<CliTicket>> {
        with_timeout(async {
            let row = sqlx::query("SELECT * FROM cli_tickets WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::row_to_ticket).transpose()
        })
        .await
    }

    async fn approve_cli_ticket(
        &self,
        id: &str,
        principal: &str,
        scope: Scope,
        session_token: &str,
    ) -> Result<Option<CliTicket>> {
        with_timeout(async {
            let res = sqlx::query(
                "UPDATE cli_tickets SET approved = 1, principal = ?, scope = ?, session_token = ?
                 WHERE id = ? AND approved = 0 AND consumed = 0",
            )
            .bind(principal)
            .bind(scope_str(scope))
            .bind(session_token)
            .bind(id)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 {
                return Ok(None);
            }
            self.get_cli_ticket(id).await
        })
        .await
    }

    async fn consume_cli_ticket(&self, id: &str) -> Result<Option<CliTicket>> {
        with_timeout(async {
            let res = sqlx::query(
                "UPDATE cli_tickets SET consumed = 1 WHERE id = ? AND approved = 1 AND consumed = 0",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 {
                return Ok(None);
            }
            self.get_cli_ticket(id).await
        })
        .await
    }

    async fn cleanup_expired_tickets(&self) -> Result<u64> {
        with_timeout(async {
            let res = sqlx::query("DELETE FROM cli_tickets WHERE expires_at < ?")
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            Ok(res.rows_affected())
        })
        .await
    }

    async fn create_pending_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
        risk_score: f64,
        ttl_secs: i64,
    ) -> Result<PendingApproval> {
        with_timeout(async {
            let id = format!("approval-{}", super::random_hex(8));
            let now = Utc::now();
            let expires_at = now + Duration::seconds(ttl_secs);
            sqlx::query(
                "INSERT INTO pending_approvals (id, session_id, tool_name, tool_input, risk_score, status, expires_at, created_at)
                 VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)",
            )
            .bind(&id)
            .bind(session_id)
            .bind(tool_name)
            .bind(tool_input.to_string())
            .bind(risk_score)
            .bind(expires_at.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(PendingApproval {
                id,
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                tool_input,
                risk_score,
                status: ApprovalStatus::Pending,
                decided_by: None,
                decided_at: None,
                decision_reason: None,
                expires_at,
                created_at: now,
            })
        })
        .await
    }

    async fn get_pending_approval(&self, id: &str) -> Result<Option<PendingApproval>> {
        with_timeout(async {
            let row = sqlx::query("SELECT * FROM pending_approvals WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else { return Ok(None) };
            let mut approval = Self::row_to_approval(&row)?;
            // Transition an overdue pending approval to expired on first read (spec.md §3).
            if approval.is_expired() {
                sqlx::query("UPDATE pending_approvals SET status = 'expired' WHERE id = ? AND status = 'pending'")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                approval.status = ApprovalStatus::Expired;
            }
            Ok(Some(approval))
        })
        .await
    }

    async fn update_pending_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        reason: Option<&str>,
    ) -> Result<Option<PendingApproval>> {
        with_timeout(async {
            let status_str = match status {
                ApprovalStatus::Approved => "approved",
                ApprovalStatus::Rejected => "rejected",
                ApprovalStatus::Expired => "expired",
                ApprovalStatus::Pending => "pending",
            };
            let res = sqlx::query(
                "UPDATE pending_approvals SET status = ?, decided_by = ?, decided_at = ?, decision_reason = ?
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(status_str)
            .bind(decided_by)
            .bind(Utc::now().to_rfc3339())
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 {
                // Either already decided (idempotent no-op) or doesn't exist.
                return self.get_pending_approval(id).await;
            }
            self.get_pending_approval(id).await
        })
        .await
    }

    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT * FROM pending_approvals ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::row_to_approval).collect()
        })
        .await
    }

    async fn create_push_subscription(&self, principal: &str, endpoint: &str) -> Result<PushSubscription> {
        with_timeout(async {
            let id = format!("push-{}", super::random_hex(8));
            let now = Utc::now();
            sqlx::query(
                "INSERT INTO push_subscriptions (id, principal, endpoint, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(principal)
            .bind(endpoint)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(PushSubscription {
                id,
                principal: principal.to_string(),
                endpoint: endpoint.to_string(),
                created_at: now,
            })
        })
        .await
    }

    async fn list_push_subscriptions(&self, principal: &str) -> Result<Vec<PushSubscription>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT * FROM push_subscriptions WHERE principal = ?")
                .bind(principal)
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(|row| -> Result<PushSubscription> {
                    Ok(PushSubscription {
                        id: row.try_get("id")?,
                        principal: row.try_get("principal")?,
                        endpoint: row.try_get("endpoint")?,
                        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn delete_push_subscription(&self, id: &str) -> Result<bool> {
        with_timeout(async {
            let res = sqlx::query("DELETE FROM push_subscriptions WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(res.rows_affected() > 0)
        })
        .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        with_timeout(async {
            let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| r.try_get::<String, _>("value")).transpose().map_err(Into::into)
        })
        .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        if !SETTINGS_ALLOW_LIST.contains(&key) {
            bail!("setting '{}' is not in the allow-list", key);
        }
        with_timeout(async {
            sqlx::query(
                "INSERT INTO settings (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        // Best-effort: errors here must never bubble into a mutation's
        // success response (spec.md §9).
        let result = with_timeout(async {
            sqlx::query(
                "INSERT INTO audit_log (timestamp, actor, action, target, detail) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(entry.timestamp.to_rfc3339())
            .bind(&entry.actor)
            .bind(&entry.action)
            .bind(&entry.target)
            .bind(&entry.detail)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await;
        if let Err(e) = &result {
            tracing::warn!(err = %e, "audit log write failed (best-effort, ignored)");
        }
        Ok(())
    }

    async fn list_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        with_timeout(async {
            let rows = sqlx::query(
                "SELECT timestamp, actor, action, target, detail FROM audit_log ORDER BY id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(|row| -> Result<AuditEntry> {
                    Ok(AuditEntry {
                        timestamp: parse_ts(&row.try_get::<String, _>("timestamp")?)?,
                        actor: row.try_get("actor")?,
                        action: row.try_get("action")?,
                        target: row.try_get("target")?,
                        detail: row.try_get("detail")?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn list_plan_ids_for_principal(&self, principal: &str) -> Result<Vec<String>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT plan_id FROM plan_membership WHERE principal = ?")
                .bind(principal)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(|r| r.try_get::<String, _>("plan_id").map_err(Into::into)).collect()
        })
        .await
    }

    async fn principal_has_plan(&self, principal: &str, plan_id: &str) -> Result<bool> {
        with_timeout(async {
            let row = sqlx::query(
                "SELECT 1 as one FROM plan_membership WHERE principal = ? AND plan_id = ?",
            )
            .bind(principal)
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.is_some())
        })
        .await
    }
}
