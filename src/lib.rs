pub mod access;
pub mod approval;
pub mod auth;
pub mod cli_ticket;
pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod identity;
pub mod metrics;
pub mod observability;
pub mod ratelimit;
pub mod rest;
pub mod rpc;
pub mod security;
pub mod store;
pub mod transport;
pub mod ws;

use config::DaemonConfig;
use hub::EventHub;
use metrics::DaemonMetrics;
use ratelimit::{CounterLimiter, MinIntervalLimiter};
use rpc::{NoopDispatcher, RpcService, SessionDispatcher};
use std::sync::Arc;
use std::time::Duration;
use store::Store;

/// Mission-WebSocket connection cap (spec.md §4.6).
pub const MISSION_WS_CAP: usize = 128;
/// PTY-WebSocket connection cap (spec.md §4.6).
pub const PTY_WS_CAP: usize = 8;
/// Single key under which both WS caps count connections globally (not
/// per-principal — spec.md §4.6 states one fleet-wide number per bridge).
pub const WS_GLOBAL_CAP_KEY: &str = "global";

/// Shared state handed to every REST handler, WS bridge, and RPC
/// subscription. Grounded on the teacher's `AppContext` — same role
/// (one value, cloned cheaply via `Arc` fields, threaded through axum's
/// `State` extractor), narrowed to what this control plane actually
/// owns: a store, an event hub, the RPC subscription engine, config,
/// and metrics.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub store: Arc<dyn Store>,
    pub hub: EventHub,
    pub rpc: Arc<RpcService>,
    pub metrics: Arc<DaemonMetrics>,
    pub started_at: std::time::Instant,
    /// Stable machine identity, persisted via the `daemon_id` setting.
    pub daemon_id: String,
    /// Set only when the shipped `SqliteStore` backs `store` — lets
    /// `/healthz` run a real `SELECT 1` instead of a generic store probe.
    pub db_pool: Option<sqlx::SqlitePool>,
    /// Bridge to the headless runner / command gateway. [`rpc::NoopDispatcher`]
    /// until the transport layer wires up the real one.
    pub dispatcher: Arc<dyn SessionDispatcher>,
    /// 200ms-per-client-IP limiter for CLI-ticket polling (spec.md §4.9).
    pub cli_ticket_poll_limiter: Arc<MinIntervalLimiter>,
    /// Global connection-count caps for the two WS bridges (spec.md §4.6).
    pub mission_ws_cap: Arc<CounterLimiter>,
    pub pty_ws_cap: Arc<CounterLimiter>,
}

impl AppContext {
    pub fn new(config: Arc<DaemonConfig>, store: Arc<dyn Store>, daemon_id: String, db_pool: Option<sqlx::SqlitePool>) -> Self {
        let hub = EventHub::new();
        let rpc = RpcService::new(hub.clone(), store.clone());
        Self {
            config,
            store,
            hub,
            rpc,
            metrics: Arc::new(DaemonMetrics::new()),
            started_at: std::time::Instant::now(),
            daemon_id,
            db_pool,
            dispatcher: Arc::new(NoopDispatcher),
            cli_ticket_poll_limiter: Arc::new(MinIntervalLimiter::new(Duration::from_millis(200))),
            mission_ws_cap: Arc::new(CounterLimiter::new(Some(MISSION_WS_CAP))),
            pty_ws_cap: Arc::new(CounterLimiter::new(Some(PTY_WS_CAP))),
        }
    }

    /// Replace the default no-op dispatcher, e.g. once the transport layer
    /// has a live bridge to the headless runner.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn SessionDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
