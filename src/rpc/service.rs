//! The streaming-RPC subscription engine (spec.md §4.5).
//!
//! Generalized from `ipc/mod.rs`'s flat JSON-RPC-over-text-WS method
//! table in the teacher daemon: the `match method { ... }` dispatch shape
//! is kept, but the transport moves to length-prefixed binary frames
//! (see [`super::framing`]) and delivery gains per-subscriber filtering,
//! caps, and a snapshot-then-keepalive loop.

use super::subscriber::{
    Cancel, CancelWatcher, Subscriber, SubscribeFilter, KEEPALIVE_INTERVAL_SECS,
    MAX_SUBSCRIBERS_PER_PRINCIPAL, MAX_SUBSCRIBERS_TOTAL, MIN_SUBSCRIBE_INTERVAL_MS,
    SUBSCRIBER_QUEUE_DEPTH,
};
use crate::access::can_access_session;
use crate::auth::{Principal, Scope};
use crate::error::ErrorCode;
use crate::hub::{Event, EventHub};
use crate::ratelimit::{CounterLimiter, MinIntervalLimiter};
use crate::store::Store;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// External collaborator (spec.md §1 "headless runner" / "tool-policy
/// engine's command gateway"). This crate only defines the seam; the
/// concrete dispatcher is supplied by the binary wiring it up.
#[async_trait]
pub trait SessionDispatcher: Send + Sync {
    /// Attempt to dispatch a command to `session_id`. `true` means the
    /// headless runner or command gateway accepted it; `false` means both
    /// declined (e.g. no runner attached for that session).
    async fn dispatch(&self, session_id: &str, kind: &str, payload: Value) -> anyhow::Result<bool>;
}

/// Dispatcher used before a runner/command-gateway bridge is wired up —
/// every dispatch reports "declined", never an error.
pub struct NoopDispatcher;

#[async_trait]
impl SessionDispatcher for NoopDispatcher {
    async fn dispatch(&self, _session_id: &str, _kind: &str, _payload: Value) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub include_agent_events: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "verb", rename_all = "lowercase")]
pub enum WorkflowVerb {
    Plan { slug: String, description: String },
    Execute { plan_id: Option<String>, task_id: Option<String> },
    Pause { note: Option<String> },
    Resume { plan_id: String },
    Command { text: String },
}

/// Translate a [`WorkflowVerb`] to the slash-command string(s) it
/// dispatches as (spec.md §4.5). `execute` with a non-empty `plan_id`
/// yields two commands — `/resume` then `/execute` — dispatched
/// atomically by the caller (see [`dispatch_workflow_action`]).
pub fn translate_workflow_action(verb: &WorkflowVerb) -> Vec<String> {
    match verb {
        WorkflowVerb::Plan { slug, description } => vec![format!("/plan {} {}", slug, description)],
        WorkflowVerb::Execute { plan_id, task_id } => {
            let mut out = Vec::new();
            if let Some(pid) = plan_id {
                if !pid.is_empty() {
                    out.push(format!("/resume {}", pid));
                }
            }
            match task_id {
                Some(tid) if !tid.is_empty() => out.push(format!("/execute {}", tid)),
                _ => out.push("/execute".to_string()),
            }
            out
        }
        WorkflowVerb::Pause { note } => match note {
            Some(n) if !n.is_empty() => vec![format!("/workflow pause {}", n)],
            _ => vec!["/workflow pause".to_string()],
        },
        WorkflowVerb::Resume { plan_id } => vec![format!("/resume {}", plan_id)],
        WorkflowVerb::Command { text } => vec![text.clone()],
    }
}

struct Registered {
    subscriber_id: u64,
    tx: mpsc::Sender<Event>,
    cancel: Cancel,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<u64, Registered>,
    /// normalized principal-name → lowercase session owner, populated from
    /// `session.created` events and initial snapshots (spec.md §4.5).
    session_owners: HashMap<String, String>,
}

pub struct RpcService {
    hub: EventHub,
    store: Arc<dyn Store>,
    registry: Arc<RwLock<Registry>>,
    subscribe_limiter: MinIntervalLimiter,
    total_cap: CounterLimiter,
    per_principal_cap: CounterLimiter,
    next_id: AtomicU64,
}

pub struct SubscriptionHandle {
    pub id: u64,
    pub principal_key: String,
    pub rx: mpsc::Receiver<Event>,
    pub cancel_watcher: CancelWatcher,
}

impl RpcService {
    pub fn new(hub: EventHub, store: Arc<dyn Store>) -> Arc<Self> {
        let service = Arc::new(Self {
            hub: hub.clone(),
            store,
            registry: Arc::new(RwLock::new(Registry::default())),
            subscribe_limiter: MinIntervalLimiter::new(Duration::from_millis(MIN_SUBSCRIBE_INTERVAL_MS)),
            total_cap: CounterLimiter::new(Some(MAX_SUBSCRIBERS_TOTAL)),
            per_principal_cap: CounterLimiter::new(Some(MAX_SUBSCRIBERS_PER_PRINCIPAL)),
            next_id: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&service);
        // Registered once; every broadcast event is re-checked against
        // every live subscriber's own delivery filter (spec.md §4.5),
        // distinct from the hub's WS-client filter.
        let registry = service.registry.clone();
        tokio::spawn(async move {
            let rx = hub_forwarder_channel(hub.clone()).await;
            drive_forwarder(weak, registry, rx).await;
        });
        service
    }

    /// spec.md §4.5 step 1–3: scope/namespace checks, per-principal rate
    /// limit, then the global/per-principal subscriber caps.
    pub async fn subscribe(
        &self,
        principal: &Principal,
        mut req: SubscribeRequest,
    ) -> Result<SubscriptionHandle, ErrorCode> {
        if !principal.has_scope(Scope::Viewer) {
            return Err(ErrorCode::PermissionDenied);
        }
        let operator = principal.scope == Scope::Operator;
        if req.include_agent_events && !operator {
            req.include_agent_events = false;
        }
        if !operator {
            req.event_types.retain(|p| !p.starts_with("mission.") && !p.starts_with("agent."));
        }

        let principal_key = principal.key();
        if !self.subscribe_limiter.try_acquire(&principal_key).await {
            return Err(ErrorCode::ResourceExhausted);
        }

        if !self.total_cap.try_acquire("global").await {
            return Err(ErrorCode::ResourceExhausted);
        }
        if !self.per_principal_cap.try_acquire(&principal_key).await {
            self.total_cap.release("global").await;
            return Err(ErrorCode::ResourceExhausted);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let (cancel, cancel_watcher) = Cancel::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber {
            id,
            principal_key: principal_key.clone(),
            principal_name: principal.normalized_name(),
            operator,
            filter: SubscribeFilter {
                session_id: req.session_id.clone(),
                event_types: req.event_types,
                include_agent_events: req.include_agent_events,
            },
            tx: tx.clone(),
            cancel: cancel.clone(),
        };

        {
            let mut reg = self.registry.write().await;
            reg.subscribers.insert(id, Registered { subscriber_id: id, tx, cancel });
            drop(reg);
            SUBSCRIBERS.write().await.insert(id, subscriber);
        }

        Ok(SubscriptionHandle { id, principal_key, rx, cancel_watcher })
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.registry.write().await.subscribers.remove(&handle.id);
        SUBSCRIBERS.write().await.remove(&handle.id);
        self.per_principal_cap.release(&handle.principal_key).await;
        self.total_cap.release("global").await;
    }

    /// Record the owning principal of a session, so the delivery filter
    /// can authorize non-operator subscribers on later events that omit
    /// an explicit owner lookup.
    pub async fn note_session_owner(&self, session_id: &str, owner_principal: &str) {
        self.registry
            .write()
            .await
            .session_owners
            .insert(session_id.to_string(), owner_principal.trim().to_lowercase());
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

// Subscriber bodies live in a side table (not the `Registry`) because the
// forwarder task needs read access to every subscriber's filter state
// concurrently with `subscribe`/`unsubscribe` mutating it; a single
// `RwLock<HashMap<_, Subscriber>>` at module scope keeps that simple
// without threading an extra handle through `Registered`.
static SUBSCRIBERS: once_cell::sync::Lazy<RwLock<HashMap<u64, Subscriber>>> =
    once_cell::sync::Lazy::new(|| RwLock::new(HashMap::new()));

async fn hub_forwarder_channel(hub: EventHub) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(1024);
    hub.register_forwarder(Arc::new(move |event: &Event| {
        let _ = tx.try_send(event.clone());
    }))
    .await;
    rx
}

async fn drive_forwarder(
    service: std::sync::Weak<RpcService>,
    _registry: Arc<RwLock<Registry>>,
    mut rx: mpsc::Receiver<Event>,
) {
    while let Some(event) = rx.recv().await {
        let Some(service) = service.upgrade() else { break };
        if event.event_type == "session.created" {
            if let Some(session_id) = &event.session_id {
                if let Some(owner) = event.payload.get("principal").and_then(Value::as_str) {
                    service.note_session_owner(session_id, owner).await;
                }
            }
        }
        let owners = service.registry.read().await.session_owners.clone();
        let subs = SUBSCRIBERS.read().await;
        for subscriber in subs.values() {
            let owner = event.session_id.as_ref().and_then(|sid| owners.get(sid)).map(String::as_str);
            if subscriber.accepts(&event, owner) && subscriber.tx.try_send(event.clone()).is_err() {
                // Slow subscriber: cancel its stream rather than block
                // the broadcaster (spec.md §4.5).
                subscriber.cancel.cancel();
            }
        }
    }
}

/// spec.md §4.5's common command pattern: scope floor → session access →
/// session-token validation → dispatch.
pub async fn dispatch_session_command(
    store: &Arc<dyn Store>,
    dispatcher: &dyn SessionDispatcher,
    principal: &Principal,
    session_id: &str,
    session_token: &str,
    required_scope: Scope,
    kind: &str,
    payload: Value,
) -> Result<bool, ErrorCode> {
    if !principal.has_scope(required_scope) {
        return Err(ErrorCode::PermissionDenied);
    }
    let session = store.get_session(session_id).await.map_err(|_| ErrorCode::Storage)?;
    let Some(session) = session else { return Err(ErrorCode::NotFound) };
    if !can_access_session(principal, &session) {
        return Err(ErrorCode::NotFound);
    }
    let valid = store
        .validate_session_token(session_id, session_token)
        .await
        .map_err(|_| ErrorCode::Storage)?;
    if !valid {
        return Err(ErrorCode::PermissionDenied);
    }
    dispatcher
        .dispatch(session_id, kind, payload)
        .await
        .map_err(|_| ErrorCode::Internal)
}

/// The `execute`-with-`planID` atomic double-dispatch special case
/// (spec.md §4.5): both slash commands are reported accepted only if the
/// first succeeds; if the first fails the second is never attempted.
pub async fn dispatch_workflow_action(
    store: &Arc<dyn Store>,
    dispatcher: &dyn SessionDispatcher,
    principal: &Principal,
    session_id: &str,
    session_token: &str,
    verb: &WorkflowVerb,
) -> Result<bool, ErrorCode> {
    if !principal.has_scope(Scope::Member) {
        return Err(ErrorCode::PermissionDenied);
    }
    let session = store.get_session(session_id).await.map_err(|_| ErrorCode::Storage)?;
    let Some(session) = session else { return Err(ErrorCode::NotFound) };
    if !can_access_session(principal, &session) {
        return Err(ErrorCode::NotFound);
    }
    if !store
        .validate_session_token(session_id, session_token)
        .await
        .map_err(|_| ErrorCode::Storage)?
    {
        return Err(ErrorCode::PermissionDenied);
    }

    let commands = translate_workflow_action(verb);
    let mut accepted = true;
    for cmd in &commands {
        if !accepted {
            break;
        }
        accepted = dispatcher
            .dispatch(session_id, "slash", Value::String(cmd.clone()))
            .await
            .map_err(|_| ErrorCode::Internal)?;
    }
    Ok(accepted && !commands.is_empty())
}

/// spec.md §4.5 step 4: `server.hello` then an opportunistic snapshot.
pub fn hello_event() -> Event {
    Event::new("server.hello", serde_json::json!({ "protocol": 1 }))
}

pub fn keepalive_event() -> Event {
    Event::new("server.keepalive", serde_json::json!({}))
}

pub const KEEPALIVE_EVERY: Duration = Duration::from_secs(KEEPALIVE_INTERVAL_SECS);

#[derive(Debug, Serialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<Event> for WireFrame {
    fn from(e: Event) -> Self {
        Self { event_type: e.event_type, session_id: e.session_id, payload: e.payload, timestamp: e.timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn member(name: &str) -> Principal {
        Principal { name: name.into(), scope: Scope::Member, token_id: None }
    }

    #[tokio::test]
    async fn subscribe_strips_agent_and_mission_filters_for_non_operators() {
        let service = RpcService::new(EventHub::new(), Arc::new(MemoryStore::new()));
        let req = SubscribeRequest {
            session_id: None,
            event_types: vec!["mission.*".into(), "session.*".into()],
            include_agent_events: true,
        };
        let handle = service.subscribe(&member("alice"), req).await.unwrap();
        let subs = SUBSCRIBERS.read().await;
        let s = subs.get(&handle.id).unwrap();
        assert!(!s.filter.include_agent_events);
        assert!(!s.filter.event_types.iter().any(|p| p.starts_with("mission.")));
    }

    #[tokio::test]
    async fn per_principal_cap_is_enforced() {
        let service = RpcService::new(EventHub::new(), Arc::new(MemoryStore::new()));
        let principal = member("alice");
        let mut handles = Vec::new();
        for _ in 0..MAX_SUBSCRIBERS_PER_PRINCIPAL {
            let handle = service
                .subscribe(&principal, SubscribeRequest { session_id: None, event_types: vec![], include_agent_events: false })
                .await
                .unwrap();
            handles.push(handle);
        }
        let over_cap = service
            .subscribe(&principal, SubscribeRequest { session_id: None, event_types: vec![], include_agent_events: false })
            .await;
        assert!(matches!(over_cap, Err(ErrorCode::ResourceExhausted)));
        for h in handles {
            service.unsubscribe(&h).await;
        }
    }

    #[test]
    fn workflow_execute_with_plan_id_emits_resume_then_execute() {
        let verb = WorkflowVerb::Execute { plan_id: Some("p-1".into()), task_id: Some("t-2".into()) };
        let cmds = translate_workflow_action(&verb);
        assert_eq!(cmds, vec!["/resume p-1".to_string(), "/execute t-2".to_string()]);
    }

    #[test]
    fn workflow_execute_without_plan_id_is_single_command() {
        let verb = WorkflowVerb::Execute { plan_id: None, task_id: None };
        assert_eq!(translate_workflow_action(&verb), vec!["/execute".to_string()]);
    }
}
