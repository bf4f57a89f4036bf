use std::fmt;
use std::sync::Arc;

use crate::caching::CacheKey;

use super::Payload;
use super::job::Job;

/// Identifies one callback registered with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub(super) u64);

/// A handle to one caller's pending load.
///
/// Returned by [`Engine::load`](super::Engine::load) when the result is not available
/// immediately.
pub struct LoadStatus<T: Payload> {
    job: Arc<Job<T>>,
    id: CallbackId,
}

impl<T: Payload> LoadStatus<T> {
    pub(super) fn new(job: Arc<Job<T>>, id: CallbackId) -> Self {
        Self { job, id }
    }

    /// Detaches this caller's callback from the load.
    ///
    /// Once this returns, the callback is not invoked anymore, unless a notification was
    /// already running. Other callers waiting on the same job are unaffected, and the job itself
    /// keeps running.
    pub fn cancel(&self) {
        self.job.remove_callback(self.id);
    }

    pub fn key(&self) -> &CacheKey {
        self.job.key()
    }

    pub fn callback_id(&self) -> CallbackId {
        self.id
    }

    /// The job this load is waiting on.
    pub fn job(&self) -> &Arc<Job<T>> {
        &self.job
    }
}

impl<T: Payload> fmt::Debug for LoadStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadStatus")
            .field("key", self.job.key())
            .field("id", &self.id)
            .finish()
    }
}
