//! Session identifier strategies.
//!
//! The registry never builds ids itself; it asks an [`IdGenerator`]. Production uses
//! random v4 UUIDs, deployments that want sortable ids can pick the monotonic strategy,
//! and tests can plug in anything deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Prefix shared by every generated session id.
pub const SESSION_ID_PREFIX: &str = "sess_";

/// Produces session identifiers. Implementations must be safe to call concurrently.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random 122-bit identifiers: `sess_` followed by 32 hex characters.
#[derive(Debug, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        format!("{}{}", SESSION_ID_PREFIX, Uuid::new_v4().simple())
    }
}

/// Monotonic identifiers salted with a random per-process node value.
///
/// The counter alone guarantees uniqueness within the process; the salt keeps ids from
/// two gateway instances (or two restarts) from lining up.
#[derive(Debug)]
pub struct MonotonicIdGenerator {
    salt: u32,
    counter: AtomicU64,
}

impl MonotonicIdGenerator {
    pub fn new() -> Self {
        Self::with_salt(Uuid::new_v4().as_u128() as u32)
    }

    pub fn with_salt(salt: u32) -> Self {
        Self {
            salt,
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for MonotonicIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for MonotonicIdGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{:08x}{:012x}", SESSION_ID_PREFIX, self.salt, n & 0xffff_ffff_ffff)
    }
}

/// Build the generator named by `sessions.id_strategy`.
pub fn from_strategy(name: &str) -> Option<Box<dyn IdGenerator>> {
    match name {
        "uuid" => Some(Box::new(UuidIdGenerator)),
        "monotonic" => Some(Box::new(MonotonicIdGenerator::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_uuid_ids_have_prefix_and_length() {
        let id = UuidIdGenerator.next_id();
        assert!(id.starts_with(SESSION_ID_PREFIX));
        assert_eq!(id.len(), SESSION_ID_PREFIX.len() + 32);
    }

    #[test]
    fn test_monotonic_ids_are_ordered() {
        let gen = MonotonicIdGenerator::with_salt(0xabcd);
        let a = gen.next_id();
        let b = gen.next_id();
        assert_eq!(a, "sess_0000abcd000000000000");
        assert!(a < b);
    }

    #[test]
    fn test_monotonic_ids_unique_across_threads() {
        let gen = Arc::new(MonotonicIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || (0..500).map(|_| gen.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_from_strategy() {
        assert!(from_strategy("uuid").is_some());
        assert!(from_strategy("monotonic").is_some());
        assert!(from_strategy("constant").is_none());
    }
}
