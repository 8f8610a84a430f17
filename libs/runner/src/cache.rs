//! TTL cache with per-key single-flight loading.
//!
//! The first requester of a missing key installs a pending entry and runs
//! the loader; concurrent requesters await the same entry instead of
//! loading again. A failed load leaves the entry empty so the next caller
//! retries.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use piped_model::Manifest;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

struct Entry<V> {
    cell: Arc<OnceCell<V>>,
    inserted_at: Instant,
}

pub struct SingleFlightCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_load<F, Fut, E>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);
            entries
                .entry(key)
                .or_insert_with(|| Entry {
                    cell: Arc::new(OnceCell::new()),
                    inserted_at: now,
                })
                .cell
                .clone()
        };
        let value = cell.get_or_try_init(|| loader()).await?;
        Ok(value.clone())
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.remove(key);
    }
}

/// Cache of loaded application manifests keyed by (application id, commit).
pub type AppManifestsCache = SingleFlightCache<(String, String), Arc<Vec<Manifest>>>;

pub const DEFAULT_MANIFESTS_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_single_flight_loads_once() {
        let cache: SingleFlightCache<String, u64> =
            SingleFlightCache::new(Duration::from_secs(60));
        let loads = Arc::new(AtomicUsize::new(0));

        let load = |loads: Arc<AtomicUsize>| async move {
            loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<u64, ()>(42)
        };

        let (a, b) = tokio::join!(
            cache.get_or_load("k".to_string(), || load(loads.clone())),
            cache.get_or_load("k".to_string(), || load(loads.clone())),
        );
        assert_eq!(a.unwrap(), 42);
        assert_eq!(b.unwrap(), 42);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let cache: SingleFlightCache<String, u64> =
            SingleFlightCache::new(Duration::from_secs(60));

        let err: Result<u64, String> = cache
            .get_or_load("k".to_string(), || async { Err("nope".to_string()) })
            .await;
        assert!(err.is_err());

        let ok = cache
            .get_or_load("k".to_string(), || async { Ok::<u64, String>(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_reload() {
        let cache: SingleFlightCache<String, u64> =
            SingleFlightCache::new(Duration::from_secs(10));
        let loads = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let loads = loads.clone();
            let v = cache
                .get_or_load("k".to_string(), || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<u64, ()>(1)
                })
                .await;
            assert!(v.is_ok());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        let loads2 = loads.clone();
        cache
            .get_or_load("k".to_string(), || async move {
                loads2.fetch_add(1, Ordering::SeqCst);
                Ok::<u64, ()>(2)
            })
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
