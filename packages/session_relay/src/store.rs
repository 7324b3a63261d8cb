//! Concurrent keyed store with built-in TTL eviction.
//!
//! Every inserted entry gets its own purge timer; there is no periodic sweep.
//! Lookups also skip anything past its TTL, so an entry is unreachable once
//! its TTL has elapsed even if its timer has not run yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::token::SessionToken;

/// Default retention for unclaimed entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

struct Entry<V> {
    id: u64,
    value: V,
    inserted_at: Instant,
}

type Entries<V> = HashMap<SessionToken, Vec<Entry<V>>>;

/// Entries grouped by session token, each expiring `ttl` after insertion.
pub struct RetentionStore<V> {
    entries: Arc<Mutex<Entries<V>>>,
    ttl: Duration,
    next_id: AtomicU64,
}

impl<V: Send + 'static> RetentionStore<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            next_id: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn insert(&self, key: SessionToken, value: V) -> u64 {
        self.insert_at(key, value, Instant::now())
    }

    /// Store `value` under `key` as if inserted at `inserted_at`; its TTL
    /// counts from that instant. Returns the entry id.
    pub fn insert_at(&self, key: SessionToken, value: V, inserted_at: Instant) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries)
            .entry(key.clone())
            .or_default()
            .push(Entry {
                id,
                value,
                inserted_at,
            });
        match inserted_at.checked_add(self.ttl) {
            Some(expires_at) => self.schedule_purge(key, id, expires_at),
            None => debug!(session = %key, id, "retention too long for a purge timer, relying on lookup expiry"),
        }
        id
    }

    /// Remove and return the oldest live entry under `key` accepted by `pred`.
    /// Entries `pred` rejects stay where they are.
    pub fn take_first(&self, key: &SessionToken, mut pred: impl FnMut(&V) -> bool) -> Option<V> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let list = entries.get_mut(key)?;
        list.retain(|e| now.duration_since(e.inserted_at) < self.ttl);
        let taken = list
            .iter()
            .position(|e| pred(&e.value))
            .map(|idx| list.remove(idx).value);
        if list.is_empty() {
            entries.remove(key);
        }
        taken
    }

    /// Remove one specific entry, if still present and live.
    pub fn take_by_id(&self, key: &SessionToken, id: u64) -> Option<(V, Instant)> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let list = entries.get_mut(key)?;
        let taken = list
            .iter()
            .position(|e| e.id == id)
            .map(|idx| list.remove(idx))
            .filter(|e| now.duration_since(e.inserted_at) < self.ttl)
            .map(|e| (e.value, e.inserted_at));
        if list.is_empty() {
            entries.remove(key);
        }
        taken
    }

    /// Number of live entries under `key`.
    pub fn count(&self, key: &SessionToken) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .get(key)
            .map(|list| {
                list.iter()
                    .filter(|e| now.duration_since(e.inserted_at) < self.ttl)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Total number of held entries, expired-but-unpurged included.
    pub fn len(&self) -> usize {
        lock(&self.entries).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule_purge(&self, key: SessionToken, id: u64, at: Instant) {
        // Outside a runtime the lazy TTL checks on lookup still apply.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let entries: Weak<Mutex<Entries<V>>> = Arc::downgrade(&self.entries);
        handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            let mut entries = lock(&entries);
            if let Some(list) = entries.get_mut(&key) {
                let before = list.len();
                list.retain(|e| e.id != id);
                if list.len() < before {
                    debug!(session = %key, id, "purged expired entry");
                }
                if list.is_empty() {
                    entries.remove(&key);
                }
            }
        });
    }
}

fn lock<V>(entries: &Mutex<Entries<V>>) -> MutexGuard<'_, Entries<V>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SessionToken {
        SessionToken::from(s)
    }

    #[tokio::test]
    async fn take_first_is_fifo_and_removes() {
        let store = RetentionStore::new(DEFAULT_TTL);
        store.insert(key("a"), 1);
        store.insert(key("a"), 2);
        assert_eq!(store.take_first(&key("a"), |_| true), Some(1));
        assert_eq!(store.take_first(&key("a"), |_| true), Some(2));
        assert_eq!(store.take_first(&key("a"), |_| true), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn rejected_entries_stay() {
        let store = RetentionStore::new(DEFAULT_TTL);
        store.insert(key("a"), 1);
        store.insert(key("a"), 2);
        assert_eq!(store.take_first(&key("a"), |v| *v == 2), Some(2));
        assert_eq!(store.count(&key("a")), 1);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = RetentionStore::new(DEFAULT_TTL);
        store.insert(key("a"), 1);
        assert_eq!(store.take_first(&key("b"), |_| true), None);
        assert_eq!(store.count(&key("a")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_purges_after_ttl() {
        let store = RetentionStore::new(Duration::from_secs(10));
        store.insert(key("a"), 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.count(&key("a")), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        // Let the purge task run.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_unreachable_before_timer_runs() {
        let store = RetentionStore::new(Duration::from_secs(10));
        store.insert(key("a"), 1);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.take_first(&key("a"), |_| true), None);
    }

    #[tokio::test(start_paused = true)]
    async fn insert_at_counts_from_given_instant() {
        let store = RetentionStore::new(Duration::from_secs(10));
        let earlier = Instant::now();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.insert_at(key("a"), 1, earlier);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.count(&key("a")), 0);
    }

    #[tokio::test]
    async fn take_by_id_targets_one_entry() {
        let store = RetentionStore::new(DEFAULT_TTL);
        store.insert(key("a"), 1);
        let id = store.insert(key("a"), 2);
        assert_eq!(store.take_by_id(&key("a"), id).map(|(v, _)| v), Some(2));
        assert_eq!(store.take_by_id(&key("a"), id), None);
        assert_eq!(store.count(&key("a")), 1);
    }

    #[test]
    fn works_without_runtime() {
        let store = RetentionStore::new(DEFAULT_TTL);
        store.insert(key("a"), "v");
        assert_eq!(store.take_first(&key("a"), |_| true), Some("v"));
    }

    #[tokio::test]
    async fn unrepresentable_ttl_does_not_panic() {
        let store = RetentionStore::new(Duration::MAX);
        store.insert(key("a"), 1);
        assert_eq!(store.count(&key("a")), 1);
        assert_eq!(store.take_first(&key("a"), |_| true), Some(1));
    }
}
