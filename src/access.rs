//! Access policy — predicates only, no I/O (spec.md §4.3).
//!
//! Grounded on the principal-scoped session-lookup idiom in the teacher's
//! `ipc/handlers/session.rs` handlers, generalized into standalone
//! functions so both the REST and RPC surfaces share one answer.

use crate::auth::{Principal, Scope};
use crate::store::Session;

/// `true` once `principal.scope >= required`. Scope is a total order
/// (`Viewer < Member < Operator`), so this is a single comparison.
pub fn has_scope(principal: &Principal, required: Scope) -> bool {
    principal.has_scope(required)
}

/// Whether `principal` may see or act on `session`.
///
/// - Operators can access every session, owned or not.
/// - A session with an empty owning `principal` (spec.md's "unowned")
///   is operator-only.
/// - Otherwise the principal may access the session iff its
///   case-insensitive, trimmed name matches the session's owner.
pub fn can_access_session(principal: &Principal, session: &Session) -> bool {
    if principal.scope == Scope::Operator {
        return true;
    }
    if session.principal.trim().is_empty() {
        return false;
    }
    principal.normalized_name() == session.principal.trim().to_lowercase()
}

/// Filter a session list down to what `principal` may see — the listing
/// idiom every session-enumerating handler shares.
pub fn filter_sessions(principal: &Principal, sessions: Vec<Session>) -> Vec<Session> {
    sessions.into_iter().filter(|s| can_access_session(principal, s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(owner: &str) -> Session {
        Session {
            id: "s-1".into(),
            principal: owner.into(),
            project_path: "/tmp".into(),
            git_repo: None,
            git_branch: None,
            status: "active".into(),
            created_at: Utc::now(),
            last_active: Utc::now(),
        }
    }

    #[test]
    fn operator_sees_everything() {
        let op = Principal { name: "root".into(), scope: Scope::Operator, token_id: None };
        assert!(can_access_session(&op, &session("alice")));
        assert!(can_access_session(&op, &session("")));
    }

    #[test]
    fn owner_match_is_case_and_whitespace_insensitive() {
        let alice = Principal { name: "  Alice ".into(), scope: Scope::Member, token_id: None };
        assert!(can_access_session(&alice, &session("alice")));
    }

    #[test]
    fn non_owner_member_is_refused() {
        let bob = Principal { name: "bob".into(), scope: Scope::Member, token_id: None };
        assert!(!can_access_session(&bob, &session("alice")));
    }

    #[test]
    fn unowned_session_is_operator_only() {
        let member = Principal { name: "alice".into(), scope: Scope::Member, token_id: None };
        assert!(!can_access_session(&member, &session("")));
    }

    #[test]
    fn scope_lattice_orders_correctly() {
        let viewer = Principal { name: "v".into(), scope: Scope::Viewer, token_id: None };
        let member = Principal { name: "m".into(), scope: Scope::Member, token_id: None };
        assert!(has_scope(&viewer, Scope::Viewer));
        assert!(!has_scope(&viewer, Scope::Member));
        assert!(has_scope(&member, Scope::Viewer));
        assert!(!has_scope(&member, Scope::Operator));
    }
}
