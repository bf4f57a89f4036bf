use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use url::Url;

use crate::caching::{Artifact, CacheKey};
use crate::decode::SourceData;
use crate::error::{FetchError, JobStateError, LoadError};
use crate::types::{Model, RequestOptions};
use crate::utils::{defer, panic_message};

use super::status::CallbackId;
use super::{
    DataSource, EngineInner, Payload, Resource, ResourceCallback, ResourceListener, ResourceRef,
    Services,
};

/// The lifecycle of a [`Job`].
///
/// `Complete` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Running,
    Complete,
    Cancelled,
}

impl JobPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }
}

/// What a successful job hands to its callbacks.
struct Delivered<T: Payload> {
    resource: Arc<Resource<T>>,
    data_source: DataSource,
    from_alternate_key: bool,
}

impl<T: Payload> Clone for Delivered<T> {
    fn clone(&self) -> Self {
        Self {
            resource: Arc::clone(&self.resource),
            data_source: self.data_source,
            from_alternate_key: self.from_alternate_key,
        }
    }
}

type Outcome<T> = Result<Delivered<T>, LoadError>;

/// A freshly decoded payload, before it is wrapped into a [`Resource`].
struct Produced<T> {
    payload: T,
    data_source: DataSource,
    from_alternate_key: bool,
}

struct JobState<T: Payload> {
    phase: JobPhase,
    next_callback: u64,
    callbacks: VecDeque<(CallbackId, Arc<dyn ResourceCallback<T>>)>,
    outcome: Option<Outcome<T>>,
    /// Whether a delivery task is scheduled or running.
    draining: bool,
}

/// One in-flight load of a single [`CacheKey`].
///
/// All callers requesting the same key while the job runs share it. The job decodes exactly
/// once and notifies every registered callback, in registration order, on the delivery context.
pub struct Job<T: Payload> {
    key: CacheKey,
    model: Model,
    options: RequestOptions,
    cached: Option<Artifact>,
    engine: Weak<EngineInner<T>>,
    services: Arc<Services<T>>,
    state: Mutex<JobState<T>>,
}

impl<T: Payload> Job<T> {
    /// Creates a job with its first callback already registered.
    pub(super) fn new(
        key: CacheKey,
        model: Model,
        options: RequestOptions,
        cached: Option<Artifact>,
        engine: Weak<EngineInner<T>>,
        services: Arc<Services<T>>,
        callback: Arc<dyn ResourceCallback<T>>,
    ) -> (Arc<Self>, CallbackId) {
        let id = CallbackId(0);
        let state = JobState {
            phase: JobPhase::Pending,
            next_callback: 1,
            callbacks: VecDeque::from([(id, callback)]),
            outcome: None,
            draining: false,
        };
        let job = Self {
            key,
            model,
            options,
            cached,
            engine,
            services,
            state: Mutex::new(state),
        };
        (Arc::new(job), id)
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn phase(&self) -> JobPhase {
        self.state.lock().phase
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase() == JobPhase::Cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.phase() == JobPhase::Complete
    }

    /// The number of callbacks still waiting for a notification.
    pub fn pending_callbacks(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Submits the decode to the worker pool.
    ///
    /// Only the first call has an effect. Starting a job that already ran, finished or was
    /// cancelled reports why nothing happened and leaves the job untouched.
    ///
    /// If the runtime drops the task without running it to the end, because it is shutting
    /// down or already shut down, the job fails with [`LoadError::ShutDown`].
    pub fn start(self: &Arc<Self>) -> Result<(), JobStateError> {
        {
            let mut state = self.state.lock();
            match state.phase {
                JobPhase::Pending => state.phase = JobPhase::Running,
                JobPhase::Running => return Err(JobStateError::AlreadyStarted),
                phase => return Err(JobStateError::Terminal(phase.as_str())),
            }
        }

        let abandoned = {
            let job = Arc::clone(self);
            defer(move || job.abandon())
        };
        let job = Arc::clone(self);
        self.services.runtime.spawn(async move {
            let _abandoned = abandoned;
            job.run().await
        });
        Ok(())
    }

    /// Registers another callback.
    ///
    /// Returns `None` if the job was cancelled. A callback added to a complete job is notified
    /// of the known outcome on the delivery context.
    pub fn add_callback(
        self: &Arc<Self>,
        callback: Arc<dyn ResourceCallback<T>>,
    ) -> Option<CallbackId> {
        let mut state = self.state.lock();
        if state.phase == JobPhase::Cancelled {
            return None;
        }

        let id = CallbackId(state.next_callback);
        state.next_callback += 1;
        state.callbacks.push_back((id, callback));

        if state.phase == JobPhase::Complete && !state.draining {
            let outcome = state.outcome.clone();
            state.draining = true;
            drop(state);

            let job = Arc::clone(self);
            self.services.delivery.execute(Box::new(move || {
                let Some(outcome) = outcome else {
                    return;
                };
                // the original delivery hold is gone, take a fresh one
                let (outcome, hold) = match outcome {
                    Ok(delivered) => match job.reacquire(&delivered.resource) {
                        Some((hold, data_source)) => (
                            Ok(Delivered {
                                data_source,
                                from_alternate_key: false,
                                ..delivered
                            }),
                            Some(hold),
                        ),
                        None => (Ok(delivered), None),
                    },
                    Err(error) => (Err(error), None),
                };
                job.drain(outcome, hold);
            }));
        }

        Some(id)
    }

    /// Removes a callback that was not notified yet.
    ///
    /// The job keeps running even if no callback is left.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = self.state.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(cb_id, _)| *cb_id != id);
        state.callbacks.len() != before
    }

    /// Cancels the job unless it already completed.
    ///
    /// Pending callbacks are dropped without being notified. A payload that finishes decoding
    /// after this is recycled right away.
    pub fn cancel(self: &Arc<Self>) {
        let cancelled = {
            let mut state = self.state.lock();
            match state.phase {
                JobPhase::Pending | JobPhase::Running => {
                    state.phase = JobPhase::Cancelled;
                    state.callbacks.clear();
                    true
                }
                JobPhase::Complete | JobPhase::Cancelled => false,
            }
        };

        if cancelled {
            tracing::debug!(key = %self.key, "Cancelled job");
            metric!(counter("engine.job.cancelled") += 1);
            if let Some(engine) = self.engine.upgrade() {
                engine.on_job_cancelled(self);
            }
        }
    }

    /// Fails a job whose task ended before the job completed.
    ///
    /// A job that completed or was cancelled is left alone.
    fn abandon(self: &Arc<Self>) {
        if self.phase() != JobPhase::Running {
            return;
        }
        tracing::warn!(key = %self.key, "Job was dropped by its runtime");
        self.complete(Err(LoadError::ShutDown));
    }

    async fn run(self: Arc<Self>) {
        if self.is_cancelled() {
            return;
        }

        let started = Instant::now();
        let result = self.produce().await;
        metric!(
            timer("job.decode") = started.elapsed(),
            "status" => if result.is_ok() { "ok" } else { "error" },
            "model" => self.model.kind(),
        );

        if let Err(error) = &result {
            tracing::debug!(
                key = %self.key,
                model = %self.model,
                error = error as &dyn std::error::Error,
                "Failed to load animation"
            );
        }
        self.complete(result);
    }

    /// Obtains the source, decodes it, and persists downloaded artifacts.
    async fn produce(&self) -> Result<Produced<T>, LoadError> {
        let services = &self.services;
        if !services.decoder.handles(&self.model) {
            return Err(LoadError::UnsupportedSource(self.model.to_string()));
        }

        // keeps a downloaded file alive until it was decoded
        let mut download = None;

        let (source, data_source, from_alternate_key) = match (&self.cached, &self.model) {
            (Some(artifact), _) => (
                SourceData::File(artifact.path.clone()),
                DataSource::DiskCache,
                artifact.is_fallback,
            ),
            (None, Model::Url(url)) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| LoadError::UnsupportedSource(url.to_string()))?;
                (SourceData::File(path), DataSource::LocalSource, false)
            }
            (None, Model::Url(url)) => {
                let file = self.fetch(url).await?;
                let path = file.path().to_path_buf();
                download = Some(file);
                (SourceData::File(path), DataSource::RemoteFetch, false)
            }
            (None, Model::File(path)) => {
                (SourceData::File(path.clone()), DataSource::LocalSource, false)
            }
            (None, Model::Bytes(bytes)) => {
                (SourceData::Bytes(bytes.clone()), DataSource::LocalSource, false)
            }
            (None, Model::Asset(name)) => {
                (SourceData::Asset(name.clone()), DataSource::LocalSource, false)
            }
        };

        // waits for a free decode slot, the permit is held until the decode returned
        let _permit = services
            .decode_permits
            .acquire()
            .await
            .map_err(|_| LoadError::ShutDown)?;
        let decoder = Arc::clone(&services.decoder);
        let payload = tokio::task::spawn_blocking(move || decoder.decode(source))
            .await
            .map_err(|error| {
                if error.is_panic() {
                    let payload = error.into_panic();
                    tracing::error!(
                        key = %self.key,
                        panic = panic_message(&*payload),
                        "Decoder panicked"
                    );
                }
                LoadError::InternalError
            })??;

        if let Some(file) = download {
            self.store_download(file);
        }

        Ok(Produced {
            payload,
            data_source,
            from_alternate_key,
        })
    }

    async fn fetch(&self, url: &Url) -> Result<NamedTempFile, LoadError> {
        let Some(downloader) = self.services.downloader.as_ref() else {
            return Err(LoadError::UnsupportedSource(format!(
                "no downloader configured for `{url}`"
            )));
        };

        let mut file = match self.disk_cache() {
            Some(cache) => cache.tempfile(),
            None => NamedTempFile::new(),
        }
        .map_err(FetchError::from)?;

        let started = Instant::now();
        let result = downloader.fetch(url, &mut file).await;
        metric!(
            timer("job.fetch") = started.elapsed(),
            "status" => if result.is_ok() { "ok" } else { "error" },
        );
        result?;

        Ok(file)
    }

    /// Persists a downloaded file into the disk cache, if the request allows it.
    ///
    /// This is best effort, failures are only logged.
    fn store_download(&self, file: NamedTempFile) {
        let Some(cache) = self.disk_cache() else {
            return;
        };
        if let Err(e) = cache.store(&self.key, file) {
            tracing::error!(
                key = %self.key,
                error = &e as &dyn std::error::Error,
                "Failed to store download in disk cache"
            );
        }
    }

    fn disk_cache(&self) -> Option<&crate::caching::Cache> {
        self.services
            .disk
            .as_ref()
            .filter(|_| self.options.uses_disk_cache())
    }

    /// Publishes the result of the decode.
    ///
    /// The engine learns about the result before any callback is notified.
    fn complete(self: &Arc<Self>, result: Result<Produced<T>, LoadError>) {
        let outcome = result.map(|produced| {
            let listener: Weak<dyn ResourceListener<T>> = self.engine.clone();
            let resource = Resource::new(
                self.key.clone(),
                produced.payload,
                self.options.is_memory_cacheable(),
                listener,
            );
            Delivered {
                resource: Arc::new(resource),
                data_source: produced.data_source,
                from_alternate_key: produced.from_alternate_key,
            }
        });

        {
            let mut state = self.state.lock();
            if state.phase == JobPhase::Cancelled {
                drop(state);
                if let Ok(orphan) = outcome {
                    tracing::debug!(key = %self.key, "Recycling resource of cancelled job");
                    if let Err(error) = orphan.resource.recycle() {
                        tracing::error!(
                            error = &error as &dyn std::error::Error,
                            key = %self.key,
                            "Failed to recycle orphaned resource"
                        );
                    }
                }
                return;
            }
            state.phase = JobPhase::Complete;
            state.outcome = Some(outcome.clone());
            state.draining = true;
        }

        let resource = outcome.as_ref().ok().map(|delivered| &delivered.resource);
        let hold = match self.engine.upgrade() {
            Some(engine) => engine.on_job_complete(self, resource),
            None => resource.and_then(|r| ResourceRef::acquire(Arc::clone(r)).ok()),
        };

        let job = Arc::clone(self);
        self.services
            .delivery
            .execute(Box::new(move || job.drain(outcome, hold)));
    }

    /// Takes a new reference to a resource this job produced earlier.
    ///
    /// Also returns where the resource was found at that point.
    fn reacquire(&self, resource: &Arc<Resource<T>>) -> Option<(ResourceRef<T>, DataSource)> {
        match self.engine.upgrade() {
            Some(engine) => engine.reacquire(resource),
            None => ResourceRef::acquire(Arc::clone(resource))
                .ok()
                .map(|hold| (hold, DataSource::ActiveResource)),
        }
    }

    /// Notifies callbacks one by one until none is left.
    ///
    /// `hold` keeps a successful resource alive during the fan-out and is released afterwards.
    fn drain(&self, outcome: Outcome<T>, hold: Option<ResourceRef<T>>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.callbacks.pop_front() {
                    Some(next) => next,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            self.notify(&outcome, hold.is_some(), next);
        }
        drop(hold);
    }

    fn notify(
        &self,
        outcome: &Outcome<T>,
        held: bool,
        (id, callback): (CallbackId, Arc<dyn ResourceCallback<T>>),
    ) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match outcome {
            Ok(delivered) => {
                let resource = held
                    .then(|| ResourceRef::acquire(Arc::clone(&delivered.resource)).ok())
                    .flatten();
                match resource {
                    Some(resource) => callback.on_resource_ready(
                        resource,
                        delivered.data_source,
                        delivered.from_alternate_key,
                    ),
                    None => callback.on_load_failed(LoadError::Recycled),
                }
            }
            Err(error) => callback.on_load_failed(error.clone()),
        }));

        if let Err(payload) = result {
            tracing::error!(
                key = %self.key,
                callback = id.0,
                panic = panic_message(&*payload),
                "Resource callback panicked"
            );
        }
    }
}

impl<T: Payload> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("model", &self.model)
            .field("phase", &state.phase)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}
