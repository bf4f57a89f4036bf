//! The resource engine.
//!
//! The [`Engine`] owns three collections, all keyed by [`CacheKey`]:
//!
//! - `active`: resources that are currently referenced by at least one caller,
//! - the [`MemoryCache`]: resources nobody references anymore, kept around until evicted,
//! - `jobs`: loads that are still in flight.
//!
//! A key is never in `active` and in the memory cache at the same time. Resources move from
//! `active` into the memory cache once their last reference is released, and back once they
//! are requested again. Every `0 -> 1` transition of a resource's reference count happens while
//! the engine lock is held, so that this handover can never lose a resource that is in use.
//!
//! Locks are always taken in the order engine, then job, then resource. No lock is held while a
//! decoder, downloader or callback runs.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::caching::{Cache, CacheKey, MemoryCache};
use crate::config::InMemoryCacheConfig;
use crate::decode::Decoder;
use crate::download::Downloader;
use crate::error::LoadError;
use crate::types::{Model, RequestOptions};
use crate::utils::{defer, panic_message};

mod delivery;
mod job;
mod resource;
mod status;

pub use delivery::{DeliveryExecutor, DeliveryTask, DeliveryThread};
pub use job::{Job, JobPhase};
pub use resource::{Resource, ResourceListener, ResourceRef};
pub use status::{CallbackId, LoadStatus};

/// A decoded value managed by the [`Engine`].
pub trait Payload: Send + Sync + 'static {
    /// The approximate size of the payload, used to bound the memory cache.
    fn weight(&self) -> u32 {
        1
    }

    /// Frees whatever the payload holds.
    ///
    /// Called exactly once, when the owning [`Resource`] is recycled.
    fn recycle(&self) {}
}

/// Where a delivered resource came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// A resource that was already referenced by another caller.
    ActiveResource,
    /// The in-memory cache of unreferenced resources.
    MemoryCache,
    /// An artifact from the disk cache.
    DiskCache,
    /// A download.
    RemoteFetch,
    /// A local file, in-memory data or a packaged asset.
    LocalSource,
}

impl DataSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveResource => "active_resource",
            Self::MemoryCache => "memory_cache",
            Self::DiskCache => "disk_cache",
            Self::RemoteFetch => "remote_fetch",
            Self::LocalSource => "local_source",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives the result of a load.
///
/// Exactly one of the two methods is called per load, unless the load was cancelled.
pub trait ResourceCallback<T: Payload>: Send + Sync {
    /// The resource is ready.
    ///
    /// `resource` is a reference owned by the callback. It is released when dropped.
    fn on_resource_ready(
        &self,
        resource: ResourceRef<T>,
        data_source: DataSource,
        from_alternate_key: bool,
    );

    /// The load failed.
    fn on_load_failed(&self, error: LoadError);
}

/// The collaborators shared by the engine and its jobs.
pub(crate) struct Services<T: Payload> {
    decoder: Arc<dyn Decoder<T>>,
    downloader: Option<Arc<dyn Downloader>>,
    disk: Option<Cache>,
    delivery: Arc<dyn DeliveryExecutor>,
    runtime: Handle,
    /// One permit per decode that may run at the same time.
    decode_permits: Semaphore,
}

struct EngineState<T: Payload> {
    active: HashMap<CacheKey, Arc<Resource<T>>>,
    jobs: HashMap<CacheKey, Arc<Job<T>>>,
    /// Set by [`Engine::shutdown`], loads fail right away afterwards.
    closed: bool,
}

pub(crate) struct EngineInner<T: Payload> {
    state: Mutex<EngineState<T>>,
    memory: MemoryCache<T>,
    services: Arc<Services<T>>,
    this: Weak<EngineInner<T>>,
}

/// Loads, deduplicates and caches payloads of type `T`.
///
/// Cloning an engine is cheap, all clones share the same state.
pub struct Engine<T: Payload> {
    inner: Arc<EngineInner<T>>,
}

impl<T: Payload> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> Engine<T> {
    pub fn builder(decoder: impl Decoder<T>) -> EngineBuilder<T> {
        EngineBuilder::new(Arc::new(decoder))
    }

    /// The key a load of `model` with `options` is tracked under.
    pub fn cache_key(model: &Model, options: &RequestOptions) -> CacheKey {
        CacheKey::new(model, options.cache_strategy)
    }

    /// Starts loading `model`.
    ///
    /// A resource that is already in memory is delivered to `callback` before this returns, and
    /// `None` is returned. Otherwise the load continues in the background and the returned
    /// [`LoadStatus`] can be used to stop waiting for it. Load failures are only ever reported
    /// to `callback`. After [`shutdown`](Self::shutdown), every load fails with
    /// [`LoadError::ShutDown`] before this returns.
    pub fn load(
        &self,
        model: Model,
        options: &RequestOptions,
        callback: Arc<dyn ResourceCallback<T>>,
    ) -> Option<LoadStatus<T>> {
        let inner = &self.inner;
        let key = Self::cache_key(&model, options);

        let started = Instant::now();
        let outcome = Cell::new("created");
        let _timer = defer(|| {
            metric!(timer("engine.load") = started.elapsed(), "outcome" => outcome.get());
        });

        let check_disk = options.uses_disk_cache()
            && model.is_remote()
            && inner.services.disk.as_ref().is_some_and(Cache::is_enabled);
        let mut cached = None;
        let mut disk_checked = !check_disk;

        loop {
            let mut state = inner.state.lock();

            if state.closed {
                drop(state);
                outcome.set("closed");
                tracing::debug!(%key, "Rejected load on a shut down engine");
                fail_now(&*callback, &key, LoadError::ShutDown);
                return None;
            }

            if let Some(resource) = state.active.get(&key) {
                let resource = Arc::clone(resource);
                if resource.acquire().is_ok() {
                    drop(state);
                    outcome.set("active");
                    metric!(counter("engine.active.hit") += 1);
                    tracing::trace!(%key, "Loaded resource from active resources");
                    deliver_now(&*callback, resource, DataSource::ActiveResource);
                    return None;
                }
                // recycled behind our back
                state.active.remove(&key);
            }

            if options.cache_strategy.allows_memory() {
                if let Some(resource) = inner.memory.take(&key) {
                    if resource.acquire().is_ok() {
                        state.active.insert(key.clone(), Arc::clone(&resource));
                        drop(state);
                        outcome.set("memory");
                        metric!(counter("engine.memory.hit") += 1);
                        tracing::trace!(%key, "Loaded resource from memory cache");
                        deliver_now(&*callback, resource, DataSource::MemoryCache);
                        return None;
                    }
                }
            }

            if !disk_checked {
                // the lookup does file system I/O, so it happens outside of the lock and all
                // of the above is checked again afterwards
                drop(state);
                cached = inner.services.disk.as_ref().and_then(|disk| disk.lookup(&key));
                disk_checked = true;
                continue;
            }

            if let Some(job) = state.jobs.get(&key) {
                let job = Arc::clone(job);
                match job.add_callback(Arc::clone(&callback)) {
                    Some(id) => {
                        drop(state);
                        outcome.set("attached");
                        metric!(counter("engine.job.attached") += 1);
                        tracing::trace!(%key, "Added callback to existing job");
                        return Some(LoadStatus::new(job, id));
                    }
                    None => {
                        state.jobs.remove(&key);
                    }
                }
            }

            let (job, id) = Job::new(
                key.clone(),
                model,
                options.clone(),
                cached,
                inner.this.clone(),
                Arc::clone(&inner.services),
                callback,
            );
            state.jobs.insert(key.clone(), Arc::clone(&job));
            drop(state);

            metric!(counter("engine.job.created") += 1);
            tracing::trace!(%key, "Started new job");
            if let Err(error) = job.start() {
                tracing::error!(
                    %key,
                    error = &error as &dyn std::error::Error,
                    "Failed to start job"
                );
            }
            return Some(LoadStatus::new(job, id));
        }
    }

    /// Empties all collections of the engine.
    ///
    /// Resources in the memory cache are recycled and in-flight jobs are cancelled. Resources
    /// that are still referenced stay valid, but are no longer tracked.
    pub fn clear(&self) {
        let inner = &self.inner;
        let (active, jobs, cached) = {
            let mut state = inner.state.lock();
            (
                std::mem::take(&mut state.active),
                std::mem::take(&mut state.jobs),
                inner.memory.drain(),
            )
        };
        tracing::debug!(
            active = active.len(),
            jobs = jobs.len(),
            cached = cached.len(),
            "Clearing engine"
        );

        for resource in cached {
            if let Err(error) = resource.recycle() {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    key = %resource.key(),
                    "Failed to recycle cached resource"
                );
            }
        }
        for job in jobs.into_values() {
            job.cancel();
        }
    }

    /// Stops accepting loads and empties the engine like [`clear`](Self::clear).
    ///
    /// Call this before the runtime or delivery context of the engine goes away.
    pub fn shutdown(&self) {
        self.inner.state.lock().closed = true;
        tracing::debug!("Shutting down engine");
        self.clear();
    }

    /// The number of referenced resources.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// The number of unreferenced resources in the memory cache.
    pub fn memory_count(&self) -> u64 {
        self.inner.memory.entry_count()
    }

    /// The total weight of the memory cache.
    pub fn memory_weight(&self) -> u64 {
        self.inner.memory.weighted_size()
    }

    /// The number of in-flight jobs.
    pub fn job_count(&self) -> usize {
        self.inner.state.lock().jobs.len()
    }

    pub fn is_active(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().active.contains_key(key)
    }

    pub fn is_in_memory(&self, key: &CacheKey) -> bool {
        self.inner.memory.contains(key)
    }

    pub fn has_job(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().jobs.contains_key(key)
    }
}

impl<T: Payload> fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Engine")
            .field("active", &state.active.len())
            .field("jobs", &state.jobs.len())
            .field("memory", &self.inner.memory)
            .finish()
    }
}

/// Reports a failure to a callback on the current thread.
fn fail_now<T: Payload>(callback: &dyn ResourceCallback<T>, key: &CacheKey, error: LoadError) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| callback.on_load_failed(error)));
    if let Err(payload) = result {
        tracing::error!(
            %key,
            panic = panic_message(&*payload),
            "Resource callback panicked"
        );
    }
}

/// Hands an already acquired resource to a callback on the current thread.
fn deliver_now<T: Payload>(
    callback: &dyn ResourceCallback<T>,
    resource: Arc<Resource<T>>,
    data_source: DataSource,
) {
    let key = resource.key().clone();
    let resource = ResourceRef::from_acquired(resource);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        callback.on_resource_ready(resource, data_source, false)
    }));
    if let Err(payload) = result {
        tracing::error!(
            %key,
            panic = panic_message(&*payload),
            "Resource callback panicked"
        );
    }
}

impl<T: Payload> EngineInner<T> {
    /// Called by a job that produced its result.
    ///
    /// Returns the job's delivery hold on the produced resource.
    fn on_job_complete(
        &self,
        job: &Arc<Job<T>>,
        resource: Option<&Arc<Resource<T>>>,
    ) -> Option<ResourceRef<T>> {
        let key = job.key();
        let mut state = self.state.lock();
        if state.jobs.get(key).is_some_and(|j| Arc::ptr_eq(j, job)) {
            state.jobs.remove(key);
        }

        let resource = resource?;
        if let Err(error) = resource.acquire() {
            tracing::error!(
                %key,
                error = &error as &dyn std::error::Error,
                "Failed to acquire finished resource"
            );
            return None;
        }
        // a second resource for the key is possible after `clear`, it stays untracked
        state
            .active
            .entry(key.clone())
            .or_insert_with(|| Arc::clone(resource));
        Some(ResourceRef::from_acquired(Arc::clone(resource)))
    }

    fn on_job_cancelled(&self, job: &Arc<Job<T>>) {
        let key = job.key();
        let mut state = self.state.lock();
        if state.jobs.get(key).is_some_and(|j| Arc::ptr_eq(j, job)) {
            state.jobs.remove(key);
        }
    }

    /// Takes a new reference to `resource`, moving it back into `active` if needed.
    ///
    /// Fails once the resource is on its way to being recycled, that is when it is neither
    /// referenced nor held by one of the engine's collections. Otherwise the reference is
    /// returned with the collection it was taken from.
    fn reacquire(&self, resource: &Arc<Resource<T>>) -> Option<(ResourceRef<T>, DataSource)> {
        let key = resource.key();
        let mut state = self.state.lock();

        let is_active = state
            .active
            .get(key)
            .is_some_and(|active| Arc::ptr_eq(active, resource));
        let in_memory = !is_active && self.memory.holds(resource);
        if !is_active && !in_memory && resource.acquired() == 0 {
            return None;
        }
        resource.acquire().ok()?;

        let data_source = if in_memory {
            self.memory.take(key);
            DataSource::MemoryCache
        } else {
            DataSource::ActiveResource
        };
        state
            .active
            .entry(key.clone())
            .or_insert_with(|| Arc::clone(resource));
        Some((ResourceRef::from_acquired(Arc::clone(resource)), data_source))
    }
}

impl<T: Payload> ResourceListener<T> for EngineInner<T> {
    fn on_resource_released(&self, resource: Arc<Resource<T>>) {
        let key = resource.key();
        let retained = {
            let mut state = self.state.lock();
            // acquired again before we got the lock, or an earlier release already handled it
            if resource.acquired() > 0 || resource.is_recycled() || self.memory.holds(&resource) {
                return;
            }

            let tracked = match state.active.get(key) {
                Some(active) if Arc::ptr_eq(active, &resource) => {
                    state.active.remove(key);
                    true
                }
                Some(_) => false,
                // untracked since `clear`, a running job will produce the replacement
                None => !state.jobs.contains_key(key),
            };

            if tracked && resource.is_cacheable() && !self.memory.contains(key) {
                self.memory.insert(key.clone(), Arc::clone(&resource));
                true
            } else {
                false
            }
        };

        metric!(
            counter("engine.disposition") += 1,
            "disposition" => if retained { "memory" } else { "recycled" },
        );
        if retained {
            tracing::trace!(%key, "Moved released resource to memory cache");
        } else if let Err(error) = resource.recycle() {
            tracing::error!(
                %key,
                error = &error as &dyn std::error::Error,
                "Failed to recycle released resource"
            );
        }
    }
}

/// Builds an [`Engine`].
pub struct EngineBuilder<T: Payload> {
    decoder: Arc<dyn Decoder<T>>,
    downloader: Option<Arc<dyn Downloader>>,
    disk: Option<Cache>,
    memory_capacity: u64,
    runtime: Option<Handle>,
    decode_threads: Option<usize>,
    delivery: Option<Arc<dyn DeliveryExecutor>>,
}

impl<T: Payload> EngineBuilder<T> {
    pub fn new(decoder: Arc<dyn Decoder<T>>) -> Self {
        Self {
            decoder,
            downloader: None,
            disk: None,
            memory_capacity: InMemoryCacheConfig::default().resources_capacity,
            runtime: None,
            decode_threads: None,
            delivery: None,
        }
    }

    /// Sets the downloader for remote models. Without one, remote models fail to load.
    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn disk_cache(mut self, cache: Cache) -> Self {
        self.disk = Some(cache);
        self
    }

    /// The total weight of unreferenced resources kept in memory.
    pub fn memory_capacity(mut self, capacity: u64) -> Self {
        self.memory_capacity = capacity;
        self
    }

    /// The runtime jobs run on. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// The number of decodes that may run at the same time.
    ///
    /// Defaults to the number of available cores.
    pub fn decode_threads(mut self, threads: usize) -> Self {
        self.decode_threads = Some(threads);
        self
    }

    /// The context callbacks are notified on. Defaults to a new [`DeliveryThread`].
    pub fn delivery(mut self, delivery: Arc<dyn DeliveryExecutor>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn build(self) -> Result<Engine<T>> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().context("no runtime to run jobs on")?,
        };
        let delivery: Arc<dyn DeliveryExecutor> = match self.delivery {
            Some(delivery) => delivery,
            None => Arc::new(
                DeliveryThread::spawn("animload-delivery")
                    .context("failed to spawn delivery thread")?,
            ),
        };

        let decode_threads = self
            .decode_threads
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1);

        let services = Arc::new(Services {
            decoder: self.decoder,
            downloader: self.downloader,
            disk: self.disk.filter(Cache::is_enabled),
            delivery,
            runtime,
            decode_permits: Semaphore::new(decode_threads),
        });
        let memory = MemoryCache::new(self.memory_capacity);

        let inner = Arc::new_cyclic(|this| EngineInner {
            state: Mutex::new(EngineState {
                active: HashMap::new(),
                jobs: HashMap::new(),
                closed: false,
            }),
            memory,
            services,
            this: this.clone(),
        });
        Ok(Engine { inner })
    }
}
