// Copyright 2024 dproxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Bounded, TTL-expiring response cache with a background sweeper.

use clru::CLruCache;
use log::debug;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{sync::watch, task::JoinHandle, time};

pub const DEFAULT_CAP: usize = 10_000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Apply the cache's non-positive-means-default rule to raw config values.
pub fn resolve_defaults(cap: i64, ttl_secs: i64, interval_secs: i64) -> (usize, Duration, Duration) {
    let cap = if cap > 0 { cap as usize } else { DEFAULT_CAP };
    let ttl = if ttl_secs > 0 {
        Duration::from_secs(ttl_secs as u64)
    } else {
        DEFAULT_TTL
    };
    let interval = if interval_secs > 0 {
        Duration::from_secs(interval_secs as u64)
    } else {
        DEFAULT_INTERVAL
    };
    (cap, ttl, interval)
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A capacity-bounded, per-entry-TTL, LRU-evicting cache.
pub struct Cache<V> {
    inner: Mutex<CLruCache<String, Entry<V>>>,
    ttl: Duration,
}

impl<V: Clone> Cache<V> {
    pub fn new(cap: usize, ttl: Duration) -> Arc<Self> {
        let cap = NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::new(DEFAULT_CAP).unwrap());
        Arc::new(Self {
            inner: Mutex::new(CLruCache::new(cap)),
            ttl,
        })
    }

    /// Look up `key`. Expired entries are evicted on read and reported as
    /// a miss; TTL is never extended by a read.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.inner.lock().unwrap();
        let now = Instant::now();
        let hit = guard
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());
        if hit.is_none() {
            guard.pop(key);
        }
        hit
    }

    /// Insert or replace `key`. If at capacity, the least-recently-used
    /// entry is evicted to make room.
    pub fn set(&self, key: String, value: V) {
        let mut guard = self.inner.lock().unwrap();
        guard.put(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Remove every entry whose TTL has elapsed. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut guard = self.inner.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<String> = guard
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            guard.pop(key);
        }
        expired.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Handle to the background sweeper task. Dropping it does not stop the
/// task; call [`SweeperHandle::close`] for a prompt, explicit shutdown.
pub struct SweeperHandle {
    close: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn close(&self) {
        let _ = self.close.send(true);
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Spawn the sweeper task: wakes every `interval`, evicts expired entries,
/// and exits promptly when [`SweeperHandle::close`] is called.
pub fn spawn_sweeper<V>(cache: Arc<Cache<V>>, interval: Duration) -> SweeperHandle
where
    V: Send + Sync + 'static,
{
    let (tx, mut rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = cache.sweep();
                    if removed > 0 {
                        debug!("cache sweep removed {removed} expired entries");
                    }
                }
                _ = rx.changed() => {
                    debug!("cache sweeper received close signal");
                    return;
                }
            }
        }
    });
    SweeperHandle { close: tx, handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_within_ttl() {
        let cache = Cache::new(10, Duration::from_secs(60));
        cache.set("a.test".into(), 42);
        assert_eq!(cache.get("a.test"), Some(42));
    }

    #[test]
    fn miss_is_none() {
        let cache: Arc<Cache<u8>> = Cache::new(10, Duration::from_secs(60));
        assert_eq!(cache.get("missing.test"), None);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_and_not_observable() {
        let cache = Cache::new(10, Duration::from_millis(20));
        cache.set("a.test".into(), 1);
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("a.test"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn lru_eviction_on_overflow() {
        let cache = Cache::new(2, Duration::from_secs(60));
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        cache.set("c".into(), 3); // evicts "a", the LRU entry
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn access_order_protects_recently_used_entry() {
        let cache = Cache::new(2, Duration::from_secs(60));
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        assert_eq!(cache.get("a"), Some(1)); // touch "a", now "b" is LRU
        cache.set("c".into(), 3); // evicts "b"
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let cache = Cache::new(10, Duration::from_millis(20));
        cache.set("old".into(), 1);
        time::sleep(Duration::from_millis(60)).await;
        cache.set("fresh".into(), 2);
        let removed = cache.sweep();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh"), Some(2));
    }

    #[tokio::test]
    async fn sweeper_task_stops_on_close() {
        let cache = Cache::new(10, Duration::from_millis(10));
        cache.set("a".into(), 1);
        let sweeper = spawn_sweeper(cache.clone(), Duration::from_millis(10));
        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("a"), None);
        sweeper.close();
        sweeper.join().await;
    }

    #[test]
    fn defaults_apply_for_non_positive_values() {
        let (cap, ttl, interval) = resolve_defaults(0, -1, 0);
        assert_eq!(cap, DEFAULT_CAP);
        assert_eq!(ttl, DEFAULT_TTL);
        assert_eq!(interval, DEFAULT_INTERVAL);
    }
}
