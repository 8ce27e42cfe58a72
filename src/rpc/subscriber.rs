//! Per-stream subscriber state (spec.md §3 "Subscriber", §4.5).

use crate::hub::Event;
use tokio::sync::{mpsc, watch};

pub const SUBSCRIBER_QUEUE_DEPTH: usize = 64;
pub const MAX_SUBSCRIBERS_TOTAL: usize = 256;
pub const MAX_SUBSCRIBERS_PER_PRINCIPAL: usize = 16;
pub const KEEPALIVE_INTERVAL_SECS: u64 = 20;
pub const MIN_SUBSCRIBE_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, Default)]
pub struct SubscribeFilter {
    pub session_id: Option<String>,
    pub event_types: Vec<String>,
    pub include_agent_events: bool,
}

/// A cooperative cancellation signal — the RPC service's answer to
/// `tokio_util::sync::CancellationToken` without adding that dependency
/// (a `watch<bool>` channel gives the same "flip once, everyone observes
/// it" semantics this needs).
#[derive(Clone)]
pub struct Cancel {
    tx: watch::Sender<bool>,
}

pub struct CancelWatcher {
    rx: watch::Receiver<bool>,
}

impl Cancel {
    pub fn new() -> (Self, CancelWatcher) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelWatcher { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelWatcher {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`Cancel::cancel`] has been called.
    pub async fn cancelled(&mut self) {
        // A sender that's already sent `true` before this watcher was
        // created still resolves immediately because `borrow` reflects
        // current value, checked first via `wait_for`.
        let _ = self.rx.wait_for(|v| *v).await;
    }
}

pub struct Subscriber {
    pub id: u64,
    pub principal_key: String,
    /// Normalized (trimmed, lowercased) principal name.
    pub principal_name: String,
    pub operator: bool,
    pub filter: SubscribeFilter,
    pub tx: mpsc::Sender<Event>,
    pub cancel: Cancel,
}

impl Subscriber {
    /// spec.md §4.5's delivery filter, run by the RPC service's forwarder
    /// — distinct from (and in addition to) the event hub's own client
    /// filter, since this one needs subscriber-specific scope/ownership
    /// knowledge the hub doesn't have.
    pub fn accepts(&self, event: &Event, session_owner: Option<&str>) -> bool {
        if event.event_type.starts_with("server.") {
            return self.user_filter_accepts(event);
        }
        if event.event_type.starts_with("agent.") && !self.filter.include_agent_events {
            return false;
        }
        if (event.event_type.starts_with("mission.") || event.event_type.starts_with("agent."))
            && !self.operator
        {
            return false;
        }
        if !self.operator {
            match &event.session_id {
                None => return false,
                Some(sid) => match session_owner {
                    Some(owner) if owner == self.principal_name => {}
                    _ => {
                        let _ = sid;
                        return false;
                    }
                },
            }
        }
        self.user_filter_accepts(event)
    }

    fn user_filter_accepts(&self, event: &Event) -> bool {
        if let Some(want) = &self.filter.session_id {
            if event.session_id.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if self.filter.event_types.is_empty() {
            return true;
        }
        self.filter.event_types.iter().any(|p| crate::hub::type_matches(p, &event.event_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sub(operator: bool, include_agent: bool) -> (Subscriber, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(8);
        let (cancel, _watcher) = Cancel::new();
        (
            Subscriber {
                id: 1,
                principal_key: "alice".into(),
                principal_name: "alice".into(),
                operator,
                filter: SubscribeFilter { include_agent_events: include_agent, ..Default::default() },
                tx,
                cancel,
            },
            rx,
        )
    }

    #[test]
    fn server_events_always_pass() {
        let (s, _rx) = sub(false, false);
        assert!(s.accepts(&Event::new("server.hello", json!({})), None));
    }

    #[test]
    fn non_operator_without_session_id_is_dropped() {
        let (s, _rx) = sub(false, false);
        assert!(!s.accepts(&Event::new("session.updated", json!({})), None));
    }

    #[test]
    fn non_operator_sees_only_own_session() {
        let (s, _rx) = sub(false, false);
        let event = Event::new("session.updated", json!({})).with_session("s-1");
        assert!(!s.accepts(&event, Some("bob")));
        assert!(s.accepts(&event, Some("alice")));
    }

    #[test]
    fn mission_and_agent_namespaces_are_operator_only() {
        let (member, _rx) = sub(false, true);
        assert!(!member.accepts(&Event::new("mission.update", json!({})), None));
        let (op, _rx2) = sub(true, true);
        assert!(op.accepts(&Event::new("mission.update", json!({})), None));
    }

    #[test]
    fn agent_events_require_include_agent_events() {
        let (s, _rx) = sub(true, false);
        assert!(!s.accepts(&Event::new("agent.thinking", json!({})), None));
        let (s2, _rx2) = sub(true, true);
        assert!(s2.accepts(&Event::new("agent.thinking", json!({})), None));
    }
}
