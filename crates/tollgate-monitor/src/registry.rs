//! Blocked IPs and suspended users.
//!
//! Both registries are consulted on the hot request path, so membership
//! checks are a single read-locked lookup. Blocks carry an expiry and go
//! stale on their own: `is_blocked` checks the horizon on read, so an
//! expired block stops biting immediately even though the entry stays in
//! memory until the next [`BlockRegistry::sweep`]. Suspensions never
//! expire; lifting one is an operator decision, not a timer.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tollgate_types::Clock;

/// One active IP block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Set of blocked source addresses with rolling expiry.
pub struct BlockRegistry {
    entries: RwLock<HashMap<String, BlockEntry>>,
    horizon: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl BlockRegistry {
    /// Creates a registry whose blocks last `horizon` from the moment they
    /// are (re-)imposed.
    pub fn new(horizon: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            horizon,
            clock,
        }
    }

    /// Blocks `ip`. Re-blocking an already-blocked address refreshes the
    /// expiry and replaces the reason. Returns the entry imposed.
    pub fn block(&self, ip: &str, reason: &str) -> BlockEntry {
        let now = self.clock.now();
        let entry = BlockEntry {
            reason: reason.to_string(),
            blocked_at: now,
            expires_at: now + self.horizon,
        };
        tracing::info!(ip, reason, expires_at = %entry.expires_at, "ip blocked");
        let mut entries = self.entries.write().expect("lock poisoned");
        entries.insert(ip.to_string(), entry.clone());
        entry
    }

    /// Lifts a block before its expiry. Returns whether one was present.
    pub fn unblock(&self, ip: &str) -> bool {
        let mut entries = self.entries.write().expect("lock poisoned");
        let removed = entries.remove(ip).is_some();
        if removed {
            tracing::info!(ip, "ip unblocked");
        }
        removed
    }

    /// Whether `ip` is blocked right now. Expired entries do not count even
    /// before the sweeper removes them.
    pub fn is_blocked(&self, ip: &str) -> bool {
        let now = self.clock.now();
        let entries = self.entries.read().expect("lock poisoned");
        entries.get(ip).is_some_and(|entry| now < entry.expires_at)
    }

    /// The live entry for `ip`, if any.
    pub fn get(&self, ip: &str) -> Option<BlockEntry> {
        let now = self.clock.now();
        let entries = self.entries.read().expect("lock poisoned");
        entries
            .get(ip)
            .filter(|entry| now < entry.expires_at)
            .cloned()
    }

    /// Removes entries whose expiry has passed. Returns how many were
    /// dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().expect("lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired ip blocks");
        }
        removed
    }

    /// Number of entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One active account suspension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendEntry {
    pub reason: String,
    pub suspended_at: DateTime<Utc>,
}

/// Set of suspended user accounts. No expiry; see the module docs.
pub struct SuspendRegistry {
    entries: RwLock<HashMap<String, SuspendEntry>>,
    clock: Arc<dyn Clock>,
}

impl SuspendRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Suspends `user_id`. Suspending an already-suspended user keeps the
    /// original entry; the first reason stands. Returns the entry in force.
    pub fn suspend(&self, user_id: &str, reason: &str) -> SuspendEntry {
        let mut entries = self.entries.write().expect("lock poisoned");
        if let Some(existing) = entries.get(user_id) {
            return existing.clone();
        }
        let entry = SuspendEntry {
            reason: reason.to_string(),
            suspended_at: self.clock.now(),
        };
        tracing::info!(user_id, reason, "user suspended");
        entries.insert(user_id.to_string(), entry.clone());
        entry
    }

    /// Reinstates a suspended user. Returns whether a suspension was lifted.
    pub fn reinstate(&self, user_id: &str) -> bool {
        let mut entries = self.entries.write().expect("lock poisoned");
        let removed = entries.remove(user_id).is_some();
        if removed {
            tracing::info!(user_id, "user reinstated");
        }
        removed
    }

    pub fn is_suspended(&self, user_id: &str) -> bool {
        let entries = self.entries.read().expect("lock poisoned");
        entries.contains_key(user_id)
    }

    /// The entry for `user_id`, if suspended.
    pub fn get(&self, user_id: &str) -> Option<SuspendEntry> {
        let entries = self.entries.read().expect("lock poisoned");
        entries.get(user_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tollgate_types::ManualClock;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn block_rig() -> (BlockRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        (BlockRegistry::new(TimeDelta::hours(24), clock.clone()), clock)
    }

    #[test]
    fn block_then_unblock() {
        let (registry, _clock) = block_rig();
        assert!(!registry.is_blocked("203.0.113.7"));

        registry.block("203.0.113.7", "brute force");
        assert!(registry.is_blocked("203.0.113.7"));
        assert!(!registry.is_blocked("203.0.113.8"));

        assert!(registry.unblock("203.0.113.7"));
        assert!(!registry.is_blocked("203.0.113.7"));
        assert!(!registry.unblock("203.0.113.7"));
    }

    #[test]
    fn expired_block_stops_biting_before_sweep() {
        let (registry, clock) = block_rig();
        registry.block("203.0.113.7", "brute force");

        clock.advance(TimeDelta::hours(23));
        assert!(registry.is_blocked("203.0.113.7"));

        clock.advance(TimeDelta::hours(2));
        assert!(!registry.is_blocked("203.0.113.7"));
        assert!(registry.get("203.0.113.7").is_none());
        // Physically still present until swept.
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.sweep(clock.now()), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn reblocking_refreshes_the_expiry() {
        let (registry, clock) = block_rig();
        registry.block("203.0.113.7", "first");

        clock.advance(TimeDelta::hours(20));
        registry.block("203.0.113.7", "second");

        clock.advance(TimeDelta::hours(20));
        // 40 h after the first block, 20 h after the refresh: still live.
        assert!(registry.is_blocked("203.0.113.7"));
        let entry = registry.get("203.0.113.7").expect("live entry");
        assert_eq!(entry.reason, "second");
    }

    #[test]
    fn sweep_keeps_live_blocks() {
        let (registry, clock) = block_rig();
        registry.block("203.0.113.7", "old");
        clock.advance(TimeDelta::hours(20));
        registry.block("198.51.100.1", "fresh");

        clock.advance(TimeDelta::hours(5));
        assert_eq!(registry.sweep(clock.now()), 1);
        assert!(registry.is_blocked("198.51.100.1"));
    }

    #[test]
    fn suspension_has_no_expiry() {
        let clock = Arc::new(ManualClock::new(start()));
        let registry = SuspendRegistry::new(clock.clone());

        registry.suspend("user-1", "tier probing");
        clock.advance(TimeDelta::days(365));
        assert!(registry.is_suspended("user-1"));

        assert!(registry.reinstate("user-1"));
        assert!(!registry.is_suspended("user-1"));
        assert!(!registry.reinstate("user-1"));
    }

    #[test]
    fn re_suspension_keeps_the_first_reason() {
        let clock = Arc::new(ManualClock::new(start()));
        let registry = SuspendRegistry::new(clock.clone());

        registry.suspend("user-1", "first");
        clock.advance(TimeDelta::hours(1));
        let entry = registry.suspend("user-1", "second");

        assert_eq!(entry.reason, "first");
        assert_eq!(entry.suspended_at, start());
        assert_eq!(registry.len(), 1);
    }
}
