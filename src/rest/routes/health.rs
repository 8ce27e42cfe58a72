//! `GET /healthz` — unauthenticated (spec.md §6.1).

use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::health::{CheckResult, CheckStatus, DatabaseHealthCheck, HealthReporter, StorageHealthCheck};
use crate::AppContext;

pub async fn healthz(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let mut reporter = HealthReporter::new().with_check(StorageHealthCheck::new(&ctx.config.data_dir));
    if let Some(pool) = ctx.db_pool.clone() {
        reporter = reporter.with_check(DatabaseHealthCheck::new(pool));
    } else {
        reporter = reporter.with_boxed_check(Arc::new(StoreReachabilityCheck { store: ctx.store.clone() }));
    }
    let report = reporter.get_health_report().await;
    Json(serde_json::json!({
        "status": report.status,
        "checks": report.checks,
        "timestamp": report.timestamp,
        "version": report.version,
        "uptimeSecs": ctx.uptime_secs(),
        "daemonID": ctx.daemon_id,
    }))
}

/// Fallback connectivity probe for non-SQLite `Store` implementations
/// (e.g. `MemoryStore` in tests) where there is no pool to ping directly.
struct StoreReachabilityCheck {
    store: Arc<dyn crate::store::Store>,
}

#[async_trait::async_trait]
impl crate::health::SystemHealthCheck for StoreReachabilityCheck {
    async fn run(&self) -> CheckResult {
        match self.store.list_sessions().await {
            Ok(_) => CheckResult {
                name: "database".to_string(),
                message: "store reachable".to_string(),
                status: CheckStatus::Ok,
                checked_at: chrono::Utc::now().to_rfc3339(),
                latency_ms: None,
            },
            Err(e) => CheckResult {
                name: "database".to_string(),
                message: format!("store unreachable: {e}"),
                status: CheckStatus::Critical,
                checked_at: chrono::Utc::now().to_rfc3339(),
                latency_ms: None,
            },
        }
    }
}
