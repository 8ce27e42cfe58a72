//! Stable machine identity — SHA-256 of a handful of host-identifying
//! strings, persisted via the `Store`'s `daemon_id` setting so it
//! survives reinstalls of the binary but not reinstalls of the host.
//!
//! Grounded on `identity/mod.rs` in the teacher daemon (hardware
//! fingerprint hashed with SHA-256), trimmed to the one value this crate
//! actually consumes (audit-entry `actor` disambiguation when no
//! principal is attached, e.g. background maintenance tasks).

use sha2::{Digest, Sha256};

pub fn compute_daemon_id() -> String {
    let hostname = hostname_best_effort();
    let mut hasher = Sha256::new();
    hasher.update(hostname.as_bytes());
    hasher.update(std::env::consts::OS.as_bytes());
    hasher.update(std::env::consts::ARCH.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_id_is_deterministic_and_hex() {
        let a = compute_daemon_id();
        let b = compute_daemon_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
