use std::sync::Arc;

use moka::notification::RemovalCause;

use crate::engine::{Payload, Resource};

use super::CacheKey;

/// The bounded cache of resources that are no longer referenced by anyone.
///
/// Resources that leave the cache because of its size limit, or are refused admission, are
/// recycled. Taking a resource out via [`take`](Self::take) or [`drain`](Self::drain) hands
/// ownership back to the caller without recycling it.
pub struct MemoryCache<T: Payload> {
    cache: moka::sync::Cache<CacheKey, Arc<Resource<T>>>,
}

impl<T: Payload> MemoryCache<T> {
    /// Creates a cache holding resources up to a total weight of `capacity`.
    pub fn new(capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .name("resources")
            .max_capacity(capacity)
            .weigher(|_key, resource: &Arc<Resource<T>>| resource.weight())
            .eviction_listener(
                |key: Arc<CacheKey>, resource: Arc<Resource<T>>, cause: RemovalCause| {
                    if cause == RemovalCause::Explicit {
                        return;
                    }
                    metric!(
                        counter("caches.memory.evicted") += 1,
                        "cause" => removal_cause(cause),
                    );
                    tracing::trace!(key = %key, ?cause, "Evicting resource from memory");
                    if let Err(error) = resource.recycle() {
                        tracing::error!(
                            error = &error as &dyn std::error::Error,
                            key = %key,
                            "Failed to recycle evicted resource"
                        );
                    }
                },
            )
            .build();

        Self { cache }
    }

    pub fn insert(&self, key: CacheKey, resource: Arc<Resource<T>>) {
        self.cache.insert(key, resource);
    }

    /// Removes the resource stored under `key` and returns it.
    pub fn take(&self, key: &CacheKey) -> Option<Arc<Resource<T>>> {
        self.cache.remove(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    /// Returns `true` if this very resource is cached under its key.
    pub fn holds(&self, resource: &Arc<Resource<T>>) -> bool {
        self.cache
            .get(resource.key())
            .is_some_and(|cached| Arc::ptr_eq(&cached, resource))
    }

    /// Removes and returns all resources.
    pub fn drain(&self) -> Vec<Arc<Resource<T>>> {
        let keys: Vec<_> = self.cache.iter().map(|(key, _)| key).collect();
        keys.into_iter()
            .filter_map(|key| self.cache.remove(&*key))
            .collect()
    }

    /// The number of cached resources, after applying pending evictions.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// The total weight of cached resources, after applying pending evictions.
    pub fn weighted_size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}

impl<T: Payload> std::fmt::Debug for MemoryCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

fn removal_cause(cause: RemovalCause) -> &'static str {
    match cause {
        RemovalCause::Expired => "expired",
        RemovalCause::Replaced => "replaced",
        RemovalCause::Size => "size",
        _ => "explicit",
    }
}
