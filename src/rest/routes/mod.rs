pub mod approvals;
pub mod cli_tickets;
pub mod health;
pub mod magic;
pub mod metrics;
pub mod sessions;
