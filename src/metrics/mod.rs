//! Prometheus-text metrics (superseded teacher `metrics.rs`, renamed to
//! the `buckley_*` family spec.md's end-to-end scenario 1 names
//! explicitly: `buckley_sessions_active_total`).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct DaemonMetrics {
    pub sessions_active_total: AtomicU64,
    pub rpc_subscribers_total: AtomicU64,
    pub rpc_events_broadcast_total: AtomicU64,
    pub pty_connections_total: AtomicU64,
    pub mission_connections_total: AtomicU64,
    pub approvals_pending_total: AtomicU64,
    pub http_requests_total: AtomicU64,
    pub http_errors_total: AtomicU64,
}

impl DaemonMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_http_requests(&self) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_sessions_active(&self, n: u64) {
        self.sessions_active_total.store(n, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let line = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} gauge\n"));
            out.push_str(&format!("{name} {value}\n"));
        };
        line(
            &mut out,
            "buckley_sessions_active_total",
            "Number of active sessions known to the store.",
            self.sessions_active_total.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "buckley_rpc_subscribers_total",
            "Currently open streaming-RPC subscribers.",
            self.rpc_subscribers_total.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "buckley_rpc_events_broadcast_total",
            "Events broadcast through the event hub.",
            self.rpc_events_broadcast_total.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "buckley_pty_connections_total",
            "Currently open PTY WebSocket connections.",
            self.pty_connections_total.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "buckley_mission_connections_total",
            "Currently open mission WebSocket connections.",
            self.mission_connections_total.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "buckley_approvals_pending_total",
            "Pending tool-call approvals awaiting a decision.",
            self.approvals_pending_total.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "buckley_http_requests_total",
            "Total HTTP requests served.",
            self.http_requests_total.load(Ordering::Relaxed),
        );
        line(
            &mut out,
            "buckley_http_errors_total",
            "Total HTTP requests that returned an error status.",
            self.http_errors_total.load(Ordering::Relaxed),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_text_contains_sessions_metric() {
        let metrics = DaemonMetrics::new();
        metrics.set_sessions_active(3);
        let text = metrics.render_prometheus();
        assert!(text.contains("buckley_sessions_active_total 3"));
    }
}
