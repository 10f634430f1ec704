//! Expiring key/value cache with sliding TTL and an eviction hook.
//!
//! Every entry owns one timer task. `get` only moves the entry's deadline
//! forward; the timer notices the new deadline when it wakes and goes back to
//! sleep, so a refresh never respawns anything. Expiry and `remove` race
//! through the same `DashMap` shard lock, which makes the hook fire at most
//! once and never after a `remove`.
//!
//! Timers use [`tokio::time`], so all operations that start a timer must run
//! inside a Tokio runtime, and tests can drive expiry with paused time.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

/// Called with the evicted key and value when an entry times out.
pub type ExpiryHook<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

struct Slot<V> {
    value: V,
    generation: u64,
    deadline: Instant,
    timer: AbortHandle,
}

struct Inner<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Slot<V>>,
    ttl: Duration,
    next_generation: AtomicU64,
    on_expired: Option<ExpiryHook<K, V>>,
}

impl<K, V> Drop for Inner<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        for slot in self.entries.iter() {
            slot.timer.abort();
        }
    }
}

/// A concurrent map whose entries expire after a period without access.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct ExpiringCache<K, V>
where
    K: Eq + Hash,
{
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for ExpiringCache<K, V>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for ExpiringCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("ttl", &self.inner.ttl)
            .field("len", &self.inner.entries.len())
            .finish()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a cache without an eviction hook.
    pub fn new(ttl: Duration) -> Self {
        Self::build(ttl, None)
    }

    /// Create a cache that calls `hook` for every entry that times out.
    pub fn with_expiry_hook<F>(ttl: Duration, hook: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        Self::build(ttl, Some(Arc::new(hook)))
    }

    fn build(ttl: Duration, on_expired: Option<ExpiryHook<K, V>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                ttl,
                next_generation: AtomicU64::new(0),
                on_expired,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.entries.contains_key(key)
    }

    /// Store `value`, replacing any previous value and restarting the timer.
    ///
    /// A replaced value is dropped without firing the eviction hook.
    pub fn put(&self, key: K, value: V) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.inner.ttl;

        // The shard stays locked until the slot is in place, so the timer
        // cannot look the key up before it exists.
        match self.inner.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let timer = self.start_timer(occupied.key().clone(), generation, deadline);
                let previous = occupied.insert(Slot {
                    value,
                    generation,
                    deadline,
                    timer,
                });
                previous.timer.abort();
            }
            Entry::Vacant(vacant) => {
                let timer = self.start_timer(vacant.key().clone(), generation, deadline);
                vacant.insert(Slot {
                    value,
                    generation,
                    deadline,
                    timer,
                });
            }
        }
    }

    fn start_timer(&self, key: K, generation: u64, deadline: Instant) -> AbortHandle {
        tokio::spawn(expire_after(
            Arc::downgrade(&self.inner),
            key,
            generation,
            deadline,
        ))
        .abort_handle()
    }

    /// Fetch a clone of the value and push its deadline a full TTL ahead.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let mut slot = self.inner.entries.get_mut(key)?;
        slot.deadline = Instant::now() + self.inner.ttl;
        Some(slot.value.clone())
    }

    /// Delete the entry and cancel its timer, returning the value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (_, slot) = self.inner.entries.remove(key)?;
        slot.timer.abort();
        Some(slot.value)
    }

    /// Remove every entry without firing the eviction hook.
    pub fn drain(&self) -> Vec<(K, V)> {
        let keys: Vec<K> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| {
                let (key, slot) = self.inner.entries.remove(&key)?;
                slot.timer.abort();
                Some((key, slot.value))
            })
            .collect()
    }
}

impl<V> ExpiringCache<String, V>
where
    V: Send + Sync + 'static,
{
    /// A random key that is not present at the time of the call.
    pub fn generate_key(&self) -> String {
        loop {
            let key = Uuid::new_v4().simple().to_string();
            if !self.inner.entries.contains_key(&key) {
                return key;
            }
        }
    }
}

async fn expire_after<K, V>(cache: Weak<Inner<K, V>>, key: K, generation: u64, deadline: Instant)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let mut deadline = deadline;
    loop {
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = cache.upgrade() else {
            return;
        };

        let now = Instant::now();
        let expired = inner.entries.remove_if(&key, |_, slot| {
            slot.generation == generation && slot.deadline <= now
        });

        if let Some((key, slot)) = expired {
            trace!("Cache entry expired");
            if let Some(hook) = &inner.on_expired {
                hook(key, slot.value);
            }
            return;
        }

        let current = inner
            .entries
            .get(&key)
            .filter(|slot| slot.generation == generation)
            .map(|slot| slot.deadline);
        match current {
            Some(next) => deadline = next,
            None => return,
        }
    }
}
