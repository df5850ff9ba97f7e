use std::time::{Duration, Instant};

use crate::time;

/// A value memoized for a key, stamped with the time it was computed.
///
/// Entries are replaced wholesale on every successful computation and are
/// never partially mutated. An entry being present says nothing about its
/// age: whether it is fresh enough for a particular call is judged by the
/// [`Resolver`](crate::Resolver), not by the store.
#[derive(Clone, Debug)]
pub(crate) struct StoredEntry<T> {
    /// When the value was computed.
    pub stored_at: time::Instant,
    /// The memoized value.
    pub value: T,
}

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct StoredItem<T> {
    /// When to drop this item from the store entirely.
    deadline: Instant,
    entry: StoredEntry<T>,
}

/// A struct implementing [`moka::Expiry`] that uses the [`StoredItem`] [`Instant`] as the explicit
/// expiration time.
struct RetentionExpiry;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl<T> moka::Expiry<String, StoredItem<T>> for RetentionExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredItem<T>,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredItem<T>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// Per-key storage of previously computed values.
///
/// Values are kept around past any business-level freshness so they can be
/// served as stale fallbacks, and are garbage-collected wholesale once their
/// coarse retention window elapses.
pub(crate) struct FreshnessStore<T> {
    cache: moka::sync::Cache<String, StoredItem<T>>,
    retain_for: Duration,
}

impl<T: Clone + Send + Sync + 'static> FreshnessStore<T> {
    pub fn new(capacity: u64, retain_for: Duration) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .expire_after(RetentionExpiry)
            .build();

        FreshnessStore { cache, retain_for }
    }

    /// Looks up the stored entry for `key`, however old it may be.
    ///
    /// Absence is a normal outcome, not a failure.
    pub fn get(&self, key: &str) -> Option<StoredEntry<T>> {
        self.cache.get(key).map(|item| item.entry)
    }

    /// Stores `value` under `key`, replacing any prior entry.
    pub fn insert(&self, key: &str, value: T) {
        let entry = StoredEntry {
            stored_at: time::Instant::now(),
            value,
        };
        let item = StoredItem {
            deadline: Instant::now() + self.retain_for,
            entry,
        };
        tracing::trace!(key, "storing computed value");
        self.cache.insert(key.to_owned(), item);
    }

    /// Whether *some* value is available for `key`, regardless of its age.
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl<T> Clone for FreshnessStore<T> {
    fn clone(&self) -> Self {
        FreshnessStore {
            cache: self.cache.clone(),
            retain_for: self.retain_for,
        }
    }
}
