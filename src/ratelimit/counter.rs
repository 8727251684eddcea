//! Per-key request counter storage.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::one::Ref;
use dashmap::DashMap;

/// Outcome of [`CounterStore::try_increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Count after the call (unchanged on denial)
    pub count: u64,
    /// Whether the increment was applied
    pub admitted: bool,
}

/// What a decay pass did to a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decay {
    /// The count was lowered to the contained value.
    Decreased(u64),
    /// The count was already zero and was left alone.
    AlreadyZero,
}

/// Concurrent storage of per-key consumed capacity.
///
/// Every operation on a single key is linearizable: check-and-increment and
/// decrement are each one atomic step, so a count never exceeds the
/// capacity it was checked against and never drops below zero.
pub trait CounterStore: Send + Sync + 'static {
    /// Current count for `key`, 0 if the key was never seen.
    fn get(&self, key: &str) -> u64;

    /// Increment `key` unless it is already at `capacity`.
    ///
    /// Denial leaves the count untouched. The entry is created on first use.
    fn try_increment(&self, key: &str, capacity: u64) -> Admission;

    /// Lower `key` by one if it is positive.
    ///
    /// Returns the new count, or `None` if the entry was at zero or unknown.
    fn decrement_if_positive(&self, key: &str) -> Option<u64>;

    /// Visit every known key once with its current count.
    ///
    /// Implementations may hold internal locks while `visit` runs, so it
    /// must not call back into the store.
    fn for_each(&self, visit: &mut dyn FnMut(&str, u64));

    /// Run one decay pass: every known key is visited at most once and
    /// lowered by one if positive.
    ///
    /// Keys are gathered first and each is decremented on its own, so
    /// `visit` runs with no store lock held and may be slow.
    fn decay(&self, visit: &mut dyn FnMut(&str, Decay)) {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(&mut |key, _| keys.push(key.to_owned()));

        for key in keys {
            let outcome = match self.decrement_if_positive(&key) {
                Some(count) => Decay::Decreased(count),
                None => Decay::AlreadyZero,
            };
            visit(&key, outcome);
        }
    }

    /// Number of distinct keys tracked.
    fn len(&self) -> usize;

    /// Whether no key has been tracked yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`CounterStore`] backed by a sharded concurrent map of atomics.
///
/// Lookups of known keys take a shard read lock; the count itself is
/// updated with compare-and-swap, so admissions for different keys in the
/// same shard never serialize on a write lock.
#[derive(Debug, Default)]
pub struct ShardedCounterStore {
    counts: DashMap<String, AtomicU64>,
}

impl ShardedCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the slot for `key`, inserting a zero entry if missing.
    fn slot(&self, key: &str) -> Ref<'_, String, AtomicU64> {
        if let Some(slot) = self.counts.get(key) {
            return slot;
        }

        self.counts
            .entry(key.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .downgrade()
    }
}

/// Decrement `count` by one unless it is zero.
fn decrement(count: &AtomicU64) -> Option<u64> {
    count
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        .ok()
        .map(|previous| previous - 1)
}

impl CounterStore for ShardedCounterStore {
    fn get(&self, key: &str) -> u64 {
        self.counts
            .get(key)
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn try_increment(&self, key: &str, capacity: u64) -> Admission {
        let slot = self.slot(key);

        match slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            (c < capacity).then(|| c + 1)
        }) {
            Ok(previous) => Admission {
                count: previous + 1,
                admitted: true,
            },
            Err(current) => Admission {
                count: current,
                admitted: false,
            },
        }
    }

    fn decrement_if_positive(&self, key: &str) -> Option<u64> {
        let slot = self.counts.get(key)?;
        decrement(&slot)
    }

    fn for_each(&self, visit: &mut dyn FnMut(&str, u64)) {
        for entry in self.counts.iter() {
            visit(entry.key(), entry.value().load(Ordering::Acquire));
        }
    }

    fn len(&self) -> usize {
        self.counts.len()
    }
}
