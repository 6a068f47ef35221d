//! Sharded usage counters backing conditional grants.
//!
//! Counters are keyed by `(user, feature, action, period, period start)`,
//! so a new period simply means a new key: readers of the current period
//! see 0 without anyone having to reset anything. Old-period entries stay
//! in memory until [`UsageLedger::sweep`] drops them.
//!
//! The map is split into a fixed number of shards, each behind its own
//! `RwLock`, with the shard picked by hashing `(user, feature, action)`.
//! All periods of one meter land in the same shard, which keeps `reset`
//! a single-shard operation; unrelated users almost never contend.

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::RwLock,
};

use chrono::{DateTime, Utc};

use crate::catalog::UsagePeriod;

const SHARD_COUNT: usize = 16;

/// Identity of one usage counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub user_id: String,
    pub feature: String,
    pub action: String,
    pub period: UsagePeriod,
    pub period_start: DateTime<Utc>,
}

impl UsageKey {
    /// Builds the key for the period containing `now`.
    pub fn new(
        user_id: impl Into<String>,
        feature: impl Into<String>,
        action: impl Into<String>,
        period: UsagePeriod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            feature: feature.into(),
            action: action.into(),
            period,
            period_start: period.period_start(now),
        }
    }

    /// Whether this counter belongs to the period containing `now`.
    fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.period.period_start(now) == self.period_start
    }
}

/// Concurrent per-period usage counters.
#[derive(Debug)]
pub struct UsageLedger {
    shards: [RwLock<HashMap<UsageKey, u32>>; SHARD_COUNT],
}

impl UsageLedger {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
        }
    }

    fn shard_for(&self, user_id: &str, feature: &str, action: &str) -> &RwLock<HashMap<UsageKey, u32>> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        feature.hash(&mut hasher);
        action.hash(&mut hasher);
        let index = (hasher.finish() as usize) % SHARD_COUNT;
        &self.shards[index]
    }

    /// Increments one counter, creating it at 0 first if absent.
    /// Returns the new count.
    pub fn increment(&self, key: UsageKey) -> u32 {
        let shard = self.shard_for(&key.user_id, &key.feature, &key.action);
        let mut counters = shard.write().expect("lock poisoned");
        let count = counters.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Reads one counter; absent counters read as 0.
    ///
    /// Callers build `key` for the current period, so counters left over
    /// from earlier periods are invisible here long before `sweep` removes
    /// them.
    pub fn count(&self, key: &UsageKey) -> u32 {
        let shard = self.shard_for(&key.user_id, &key.feature, &key.action);
        let counters = shard.read().expect("lock poisoned");
        counters.get(key).copied().unwrap_or(0)
    }

    /// Drops every counter for one meter, across all periods.
    /// Returns how many entries were removed.
    pub fn reset(&self, user_id: &str, feature: &str, action: &str) -> usize {
        let shard = self.shard_for(user_id, feature, action);
        let mut counters = shard.write().expect("lock poisoned");
        let before = counters.len();
        counters.retain(|key, _| {
            !(key.user_id == user_id && key.feature == feature && key.action == action)
        });
        before - counters.len()
    }

    /// Drops every counter whose period no longer contains `now`.
    /// Returns how many entries were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut counters = shard.write().expect("lock poisoned");
            let before = counters.len();
            counters.retain(|key, _| key.is_current(now));
            removed += before - counters.len();
        }
        removed
    }

    /// Total number of live counters, including stale ones not yet swept.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().expect("lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}
