//! Structured-logging helpers shared by the REST and RPC handlers.

use std::time::Instant;
use tracing::{debug, info};

/// Tracks the latency of an async operation and emits a structured log
/// event on drop-equivalent `finish()`. Operations over 1s log at `info`
/// so they surface without raising `RUST_LOG` globally.
pub struct LatencyTracker {
    operation: String,
    start: Instant,
}

impl LatencyTracker {
    pub fn start(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), start: Instant::now() }
    }

    pub fn finish(self) {
        let elapsed_ms = self.start.elapsed().as_millis();
        if elapsed_ms > 1000 {
            info!(operation = %self.operation, elapsed_ms, "slow operation");
        } else {
            debug!(operation = %self.operation, elapsed_ms, "operation complete");
        }
    }
}
