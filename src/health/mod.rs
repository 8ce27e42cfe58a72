// SPDX-License-Identifier: MIT
//! Daemon health check system.
//!
//! Provides [`HealthReporter`] that aggregates multiple [`SystemHealthCheck`]
//! implementations into a single [`HealthReport`].
//!
//! # Included checks
//! - [`DatabaseHealthCheck`] — verifies SQLite can handle a `SELECT 1`
//! - [`StorageHealthCheck`] — verifies the data directory is writable
//!
//! # Usage
//! ```rust,no_run
//! use buckley_core::health::{
//!     reporter::HealthReporter,
//!     checks::{DatabaseHealthCheck, StorageHealthCheck},
//! };
//!
//! let reporter = HealthReporter::new()
//!     .with_check(DatabaseHealthCheck::new(pool))
//!     .with_check(StorageHealthCheck::new(&data_dir));
//!
//! let report = reporter.get_health_report().await;
//! println!("overall: {}", report.status);
//! ```

pub mod checks;
pub mod reporter;

// Convenience re-exports.
pub use checks::{CheckResult, CheckStatus, DatabaseHealthCheck, StorageHealthCheck, SystemHealthCheck};
pub use reporter::{HealthReport, HealthReporter};
