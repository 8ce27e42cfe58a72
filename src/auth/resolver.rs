//! The ordered principal-derivation fallback (spec.md §4.2).
//!
//! Grounded on `ipc/auth.rs::{get_or_create_token, validate_bearer}` in the
//! teacher daemon, generalized from "bearer only" to the full
//! attached-principal → cookie → bearer → basic-auth → anonymous chain.

use super::cookie;
use super::{Principal, Scope, BUILTIN};
use crate::store::Store;
use std::sync::Arc;

/// Static, request-independent settings the resolver needs. Built once
/// from [`crate::config`] at startup and handed to every call.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Non-empty static bearer token; matching it yields `{builtin, operator}`.
    pub auth_token: Option<String>,
    /// Whether a request must resolve to a non-anonymous principal.
    pub require_token: bool,
    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<String>,
    /// Whether the bind address is a loopback address — gates query-string
    /// token/secret fallbacks.
    pub is_loopback_bind: bool,
}

/// Everything the resolver reads off one inbound request. Callers (REST
/// middleware, WS upgrade handlers) populate this from framework-specific
/// headers/query maps.
#[derive(Debug, Default)]
pub struct RequestAuth<'a> {
    pub cookie_header: Option<&'a str>,
    pub authorization_header: Option<&'a str>,
    pub query_token: Option<&'a str>,
    /// `Some((user, pass))` when a well-formed `Authorization: Basic` header
    /// was present, regardless of whether basic auth is enabled.
    pub basic_credentials: Option<(String, String)>,
    /// Already-attached principal — set by inner middleware that ran
    /// earlier in the chain (spec.md §4.2 step 1).
    pub attached: Option<Principal>,
    /// Whether the inbound request was itself secure (TLS, or `X-Forwarded-Proto: https`
    /// behind a terminating proxy) — threads into any `Set-Cookie` this resolution mints
    /// (spec.md §3 "`Secure` iff the request was secure").
    pub secure: bool,
}

pub enum Resolved {
    Principal(Principal),
    /// A new auth session was minted (basic-auth path) — caller must set
    /// the `Set-Cookie` header on the response.
    NewSession { principal: Principal, cookie_header: String },
    Anonymous,
    Unauthenticated,
}

pub async fn resolve(
    store: &Arc<dyn Store>,
    cfg: &ResolverConfig,
    req: RequestAuth<'_>,
) -> Resolved {
    if let Some(p) = req.attached {
        return Resolved::Principal(p);
    }

    if let Some(cookie_header) = req.cookie_header {
        if let Some(token) = cookie::extract_token(cookie_header) {
            if let Ok(Some(session)) = store.get_auth_session(&token).await {
                let _ = store.touch_auth_session(&token).await;
                return Resolved::Principal(Principal {
                    name: session.principal,
                    scope: session.scope,
                    token_id: session.token_id,
                });
            }
        }
    }

    let bearer = req
        .authorization_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| {
            if cfg.is_loopback_bind {
                req.query_token.map(str::to_string)
            } else {
                None
            }
        });

    if let Some(token) = bearer {
        if let Some(configured) = &cfg.auth_token {
            if !configured.is_empty() && super::secrets_equal(configured, &token) {
                return Resolved::Principal(Principal::builtin());
            }
        }
        return match store.validate_api_token(&token).await {
            Ok(Some(meta)) => Resolved::Principal(Principal {
                name: meta.principal,
                scope: meta.scope,
                token_id: Some(meta.id),
            }),
            // Rejection rule: a bearer token that was provided but matched
            // nothing fails outright — it never falls through to anonymous.
            _ => Resolved::Unauthenticated,
        };
    }

    if let (Some(user), Some(pass)) = (&cfg.basic_auth_username, &cfg.basic_auth_password) {
        if !user.is_empty() && !pass.is_empty() {
            if let Some((given_user, given_pass)) = &req.basic_credentials {
                if super::secrets_equal(user, given_user) && super::secrets_equal(pass, given_pass) {
                    let session = match store
                        .create_auth_session(BUILTIN, Scope::Operator, None)
                        .await
                    {
                        Ok(s) => s,
                        Err(_) => return Resolved::Unauthenticated,
                    };
                    let header = cookie::set_cookie_header(&session.token, crate::store::AUTH_SESSION_TTL_SECS, req.secure);
                    return Resolved::NewSession {
                        principal: Principal { name: session.principal, scope: session.scope, token_id: None },
                        cookie_header: header,
                    };
                }
            }
        }
    }

    if !cfg.require_token {
        Resolved::Anonymous
    } else {
        Resolved::Unauthenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn base_cfg() -> ResolverConfig {
        ResolverConfig {
            auth_token: Some("unit-token".to_string()),
            require_token: true,
            basic_auth_username: None,
            basic_auth_password: None,
            is_loopback_bind: true,
        }
    }

    #[tokio::test]
    async fn matching_static_token_yields_builtin_operator() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cfg = base_cfg();
        let req = RequestAuth {
            authorization_header: Some("Bearer unit-token"),
            ..Default::default()
        };
        match resolve(&store, &cfg, req).await {
            Resolved::Principal(p) => {
                assert_eq!(p.name, BUILTIN);
                assert_eq!(p.scope, Scope::Operator);
            }
            _ => panic!("expected a resolved principal"),
        }
    }

    #[tokio::test]
    async fn wrong_bearer_token_never_falls_back_to_anonymous() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut cfg = base_cfg();
        cfg.require_token = false;
        let req = RequestAuth { authorization_header: Some("Bearer nope"), ..Default::default() };
        assert!(matches!(resolve(&store, &cfg, req).await, Resolved::Unauthenticated));
    }

    #[tokio::test]
    async fn query_token_ignored_on_non_loopback_bind() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut cfg = base_cfg();
        cfg.is_loopback_bind = false;
        cfg.require_token = false;
        let req = RequestAuth { query_token: Some("unit-token"), ..Default::default() };
        assert!(matches!(resolve(&store, &cfg, req).await, Resolved::Anonymous));
    }

    #[tokio::test]
    async fn no_credentials_and_no_required_token_is_anonymous() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut cfg = base_cfg();
        cfg.require_token = false;
        cfg.auth_token = None;
        let req = RequestAuth::default();
        assert!(matches!(resolve(&store, &cfg, req).await, Resolved::Anonymous));
    }

    #[tokio::test]
    async fn no_credentials_and_required_token_is_unauthenticated() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cfg = base_cfg();
        let req = RequestAuth::default();
        assert!(matches!(resolve(&store, &cfg, req).await, Resolved::Unauthenticated));
    }
}
