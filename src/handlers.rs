//! Expiring handler registry
//!
//! Correlation-keyed callbacks with a fixed TTL, used for trade-offer
//! change and trade-confirmation notifications. The external trade system
//! polls slowly, so a caller waiting on "tell me when offer X changes"
//! must neither wait forever nor leak a subscription; entries that are
//! never matched again decay after one hour.

use std::time::{Duration, Instant};
use tracing::debug;

/// How long an entry survives without being renewed by a dispatch
pub const HANDLER_TTL: Duration = Duration::from_secs(60 * 60);

/// What a callback wants done with its own registration after firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Discard,
}

type Callback<A> = Box<dyn FnMut(&A) -> Disposition + Send>;

struct HandlerEntry<K, A> {
    key: K,
    callback: Callback<A>,
    last_renewed: Instant,
}

impl<K, A> HandlerEntry<K, A> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_renewed.elapsed() > ttl
    }
}

/// Registry of (correlation key -> callback) pairs with TTL eviction.
///
/// A dispatched callback frequently wants to disable itself once fired;
/// it signals that by returning [`Disposition::Discard`], and the registry
/// compacts in place without skipping or double-invoking neighbors.
pub struct ExpiringHandlerRegistry<K, A> {
    entries: Vec<HandlerEntry<K, A>>,
    ttl: Duration,
    name: &'static str,
}

impl<K: PartialEq + std::fmt::Debug, A> ExpiringHandlerRegistry<K, A> {
    pub fn new(name: &'static str) -> Self {
        Self {
            entries: Vec::new(),
            ttl: HANDLER_TTL,
            name,
        }
    }

    #[cfg(test)]
    fn with_ttl(name: &'static str, ttl: Duration) -> Self {
        Self {
            entries: Vec::new(),
            ttl,
            name,
        }
    }

    /// Register a callback for a correlation key. Multiple entries per key
    /// are allowed; each fires on every matching dispatch.
    pub fn register<F>(&mut self, key: K, callback: F)
    where
        F: FnMut(&A) -> Disposition + Send + 'static,
    {
        debug!(registry = self.name, key = ?key, "registering handler");
        self.entries.push(HandlerEntry {
            key,
            callback: Box::new(callback),
            last_renewed: Instant::now(),
        });
    }

    /// Invoke every entry matching `key`, renewing its TTL first. Expired
    /// non-matching entries encountered in the same pass are evicted.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&mut self, key: &K, payload: &A) -> usize {
        let mut fired = 0;
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].key == *key {
                self.entries[i].last_renewed = Instant::now();
                let disposition = (self.entries[i].callback)(payload);
                fired += 1;
                if disposition == Disposition::Discard {
                    // Compact in place; the next entry slides into slot i
                    self.entries.remove(i);
                    continue;
                }
            } else if self.entries[i].is_expired(self.ttl) {
                debug!(registry = self.name, key = ?self.entries[i].key, "evicting expired handler");
                self.entries.remove(i);
                continue;
            }
            i += 1;
        }
        fired
    }

    pub fn has_listener(&self, key: &K) -> bool {
        self.entries.iter().any(|e| e.key == *key)
    }

    /// Remove every entry registered for `key`
    pub fn unregister(&mut self, key: &K) {
        self.entries.retain(|e| e.key != *key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_dispatch_fires_matching_entries_only() {
        let mut registry: ExpiringHandlerRegistry<u64, String> =
            ExpiringHandlerRegistry::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        registry.register(1, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Disposition::Keep
        });
        registry.register(2, |_| Disposition::Keep);

        assert_eq!(registry.dispatch(&1, &"change".to_string()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Firing does not remove the entry
        assert!(registry.has_listener(&1));
        assert_eq!(registry.dispatch(&1, &"change".to_string()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_self_discard_fires_once_per_pass() {
        let mut registry: ExpiringHandlerRegistry<u64, ()> = ExpiringHandlerRegistry::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let other_hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        registry.register(7, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Disposition::Discard
        });
        // A second handler on the same key must not be skipped by the
        // compaction of the first
        let o = other_hits.clone();
        registry.register(7, move |_| {
            o.fetch_add(1, Ordering::SeqCst);
            Disposition::Keep
        });

        assert_eq!(registry.dispatch(&7, &()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(other_hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        // The discarded handler is gone on the next pass
        assert_eq!(registry.dispatch(&7, &()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(other_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expired_entries_evicted_during_dispatch() {
        let mut registry: ExpiringHandlerRegistry<u64, ()> =
            ExpiringHandlerRegistry::with_ttl("test", Duration::from_millis(0));
        registry.register(1, |_| Disposition::Keep);
        registry.register(2, |_| Disposition::Keep);
        std::thread::sleep(Duration::from_millis(5));

        // Dispatching key 1 renews it and sweeps the stale key-2 entry
        registry.dispatch(&1, &());
        assert!(registry.has_listener(&1));
        assert!(!registry.has_listener(&2));
    }

    #[test]
    fn test_unregister_removes_all_entries_for_key() {
        let mut registry: ExpiringHandlerRegistry<u64, ()> = ExpiringHandlerRegistry::new("test");
        registry.register(3, |_| Disposition::Keep);
        registry.register(3, |_| Disposition::Keep);
        registry.register(4, |_| Disposition::Keep);

        registry.unregister(&3);
        assert!(!registry.has_listener(&3));
        assert!(registry.has_listener(&4));
        assert_eq!(registry.len(), 1);
    }
}
