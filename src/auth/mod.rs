//! Principal derivation — turns an inbound request into exactly one
//! [`Principal`] using the ordered fallback in spec.md §4.2.
//!
//! Grounded on `ipc/auth.rs`'s bearer-token validation and `ipc/mod.rs`'s
//! `tokens_equal` constant-time compare in the teacher daemon.

pub mod cookie;
pub mod resolver;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Reserved principal name issued only when authentication is not required.
pub const ANONYMOUS: &str = "anonymous";
/// Reserved principal name issued only when the static configured token matches.
pub const BUILTIN: &str = "builtin";

/// The three-level scope lattice, totally ordered `Operator > Member > Viewer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Viewer,
    Member,
    Operator,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Viewer => "viewer",
            Scope::Member => "member",
            Scope::Operator => "operator",
        }
    }

    pub fn parse(s: &str) -> Option<Scope> {
        match s {
            "viewer" => Some(Scope::Viewer),
            "member" => Some(Scope::Member),
            "operator" => Some(Scope::Operator),
            _ => None,
        }
    }
}

/// The identity attached to a request for its whole lifetime. Immutable once
/// materialized — no handler ever observes a partially-filled principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub scope: Scope,
    pub token_id: Option<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            name: ANONYMOUS.to_string(),
            scope: Scope::Viewer,
            token_id: None,
        }
    }

    pub fn builtin() -> Self {
        Self {
            name: BUILTIN.to_string(),
            scope: Scope::Operator,
            token_id: None,
        }
    }

    /// `name:tokenID`, or bare `name` when there is no token — used as the
    /// rate-limiter and subscriber-cap key (spec.md §4.5).
    pub fn key(&self) -> String {
        match &self.token_id {
            Some(id) => format!("{}:{}", self.name, id),
            None => self.name.clone(),
        }
    }

    pub fn normalized_name(&self) -> String {
        self.name.trim().to_lowercase()
    }

    pub fn has_scope(&self, required: Scope) -> bool {
        self.scope >= required
    }
}

/// Constant-time equality for tokens/secrets — session tokens, API tokens,
/// CLI-ticket secrets, and auth-session cookie values all compare this way.
pub fn secrets_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
