//! Process-wide event fan-out (spec.md §4.4).
//!
//! Generalized from `ipc/event.rs::EventBroadcaster` — the teacher wraps
//! one `tokio::sync::broadcast` channel; this hub instead keeps a
//! registry of per-consumer bounded queues (so a slow consumer can be
//! evicted without lagging every other subscriber) plus in-process
//! forwarder callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Queue depth for every registered WebSocket client (spec.md §4.4).
pub const CLIENT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Dot-separated hierarchy, e.g. `session.created`, `mission.agent.started`.
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Producers that don't set a timestamp get one at receipt time
    /// (spec.md §4.4 "if zero, the hub sets them on receipt").
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self { event_type: event_type.into(), session_id: None, payload, timestamp: Utc::now() }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// A literal-equality-or-trailing-`*`-wildcard event-type matcher.
pub fn type_matches(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => pattern == event_type,
    }
}

/// What a WebSocket-client consumer wants to receive. `None` field means
/// "no filter on this dimension".
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub session_id: Option<String>,
    pub type_patterns: Vec<String>,
}

impl ClientFilter {
    pub fn accepts(&self, event: &Event) -> bool {
        if let Some(want) = &self.session_id {
            if event.session_id.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if self.type_patterns.is_empty() {
            return true;
        }
        self.type_patterns.iter().any(|p| type_matches(p, &event.event_type))
    }
}

struct ClientHandle {
    tx: mpsc::Sender<Event>,
    filter: ClientFilter,
}

type Forwarder = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    clients: HashMap<u64, ClientHandle>,
    forwarders: Vec<Forwarder>,
}

/// The process-wide singleton. Cheap to clone (an `Arc` inside).
#[derive(Clone)]
pub struct EventHub {
    registry: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered WebSocket client's receive handle plus its id, used to
/// unregister on disconnect.
pub struct ClientSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

impl EventHub {
    pub fn new() -> Self {
        Self { registry: Arc::new(RwLock::new(Registry::default())), next_id: Arc::new(AtomicU64::new(1)) }
    }

    pub async fn register_client(&self, filter: ClientFilter) -> ClientSubscription {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.write().await.clients.insert(id, ClientHandle { tx, filter });
        ClientSubscription { id, rx }
    }

    pub async fn unregister_client(&self, id: u64) {
        self.registry.write().await.clients.remove(&id);
    }

    /// Register an in-process forwarder, invoked synchronously (on the
    /// broadcasting task) for every event. Forwarders must not block.
    pub async fn register_forwarder(&self, f: Forwarder) {
        self.registry.write().await.forwarders.push(f);
    }

    /// Snapshot registrations under a read lock, then deliver without
    /// holding it — spec.md §4.4's "no lock is held while writing to a
    /// queue".
    pub async fn broadcast(&self, mut event: Event) {
        if event.timestamp.timestamp() == 0 {
            event.timestamp = Utc::now();
        }

        let (matched, forwarders) = {
            let reg = self.registry.read().await;
            let matched: Vec<(u64, mpsc::Sender<Event>)> = reg
                .clients
                .iter()
                .filter(|(_, c)| c.filter.accepts(&event))
                .map(|(id, c)| (*id, c.tx.clone()))
                .collect();
            (matched, reg.forwarders.clone())
        };

        for f in &forwarders {
            f(&event);
        }

        let mut dead = Vec::new();
        for (id, tx) in matched {
            if tx.try_send(event.clone()).is_err() {
                // Full queue or closed receiver: evict the slow consumer
                // rather than block the broadcaster (spec.md §4.4).
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut reg = self.registry.write().await;
            for id in dead {
                debug!(client_id = id, "evicting slow event-hub consumer");
                reg.clients.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_matches_prefix_only() {
        assert!(type_matches("mission.*", "mission.agent.started"));
        assert!(!type_matches("mission.*", "session.created"));
        assert!(type_matches("session.created", "session.created"));
        assert!(!type_matches("session.created", "session.updated"));
    }

    #[tokio::test]
    async fn filtered_client_only_receives_matching_events() {
        let hub = EventHub::new();
        let mut sub = hub
            .register_client(ClientFilter { session_id: None, type_patterns: vec!["mission.*".into()] })
            .await;
        hub.broadcast(Event::new("session.created", json!({}))).await;
        hub.broadcast(Event::new("mission.agent.started", json!({}))).await;
        let got = sub.rx.recv().await.unwrap();
        assert_eq!(got.event_type, "mission.agent.started");
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_not_blocking() {
        let hub = EventHub::new();
        let sub = hub.register_client(ClientFilter::default()).await;
        for i in 0..(CLIENT_QUEUE_DEPTH + 10) {
            hub.broadcast(Event::new("x", json!({ "i": i }))).await;
        }
        // Eviction happens lazily after a failed try_send; registry should
        // no longer contain the dead client.
        assert_eq!(hub.registry.read().await.clients.len(), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn forwarder_invoked_synchronously() {
        let hub = EventHub::new();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen2 = seen.clone();
        hub.register_forwarder(Arc::new(move |_e| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }))
        .await;
        hub.broadcast(Event::new("x", json!({}))).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
