use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::caching::CacheKey;
use crate::error::ResourceError;

use super::Payload;

/// Receives a [`Resource`] once its last reference was released.
pub trait ResourceListener<T: Payload>: Send + Sync {
    /// Called exactly once for each transition of the reference count from `1` to `0`.
    ///
    /// This is invoked synchronously from [`Resource::release`].
    fn on_resource_released(&self, resource: Arc<Resource<T>>);
}

#[derive(Debug, Default)]
struct RefState {
    acquired: usize,
    recycled: bool,
}

/// A reference counted wrapper around one decoded payload.
///
/// The count is only changed through [`acquire`](Self::acquire) and
/// [`release`](Self::release). Once it drops back to zero, the [`ResourceListener`] decides
/// whether the resource is retained in a cache or [`recycle`](Self::recycle)d.
pub struct Resource<T: Payload> {
    key: CacheKey,
    payload: T,
    cacheable: bool,
    state: Mutex<RefState>,
    listener: Weak<dyn ResourceListener<T>>,
}

impl<T: Payload> Resource<T> {
    pub fn new(
        key: CacheKey,
        payload: T,
        cacheable: bool,
        listener: Weak<dyn ResourceListener<T>>,
    ) -> Self {
        Self {
            key,
            payload,
            cacheable,
            state: Mutex::new(RefState::default()),
            listener,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Returns the payload, unless the resource was recycled.
    pub fn get(&self) -> Result<&T, ResourceError> {
        if self.state.lock().recycled {
            return Err(ResourceError::Recycled);
        }
        Ok(&self.payload)
    }

    pub fn acquire(&self) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        if state.recycled {
            return Err(ResourceError::Recycled);
        }
        state.acquired += 1;
        Ok(())
    }

    /// Gives up one reference.
    ///
    /// Releasing the last reference calls the [`ResourceListener`] before returning, so the
    /// caller must not hold any lock the listener needs.
    pub fn release(self: &Arc<Self>) -> Result<(), ResourceError> {
        let released = {
            let mut state = self.state.lock();
            if state.acquired == 0 {
                return Err(ResourceError::NegativeReference);
            }
            state.acquired -= 1;
            state.acquired == 0
        };

        if released {
            match self.listener.upgrade() {
                Some(listener) => listener.on_resource_released(Arc::clone(self)),
                None => tracing::trace!(key = %self.key, "Resource released without a listener"),
            }
        }
        Ok(())
    }

    /// Destroys the resource.
    ///
    /// This is a one-way transition: a recycled resource can no longer be acquired, and the
    /// payload gets the chance to free whatever it holds via [`Payload::recycle`].
    pub fn recycle(&self) -> Result<(), ResourceError> {
        {
            let mut state = self.state.lock();
            if state.recycled {
                return Err(ResourceError::AlreadyRecycled);
            }
            if state.acquired > 0 {
                return Err(ResourceError::StillAcquired(state.acquired));
            }
            state.recycled = true;
        }
        tracing::trace!(key = %self.key, "Recycling resource");
        self.payload.recycle();
        Ok(())
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_recycled(&self) -> bool {
        self.state.lock().recycled
    }

    /// The current number of references.
    pub fn acquired(&self) -> usize {
        self.state.lock().acquired
    }

    pub(crate) fn weight(&self) -> u32 {
        self.payload.weight()
    }
}

impl<T: Payload> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Resource")
            .field("key", &self.key)
            .field("cacheable", &self.cacheable)
            .field("acquired", &state.acquired)
            .field("recycled", &state.recycled)
            .finish()
    }
}

/// One acquired reference to a [`Resource`].
///
/// Dropping the guard releases the reference again.
pub struct ResourceRef<T: Payload> {
    resource: Arc<Resource<T>>,
}

impl<T: Payload> ResourceRef<T> {
    /// Acquires a new reference to `resource`.
    pub fn acquire(resource: Arc<Resource<T>>) -> Result<Self, ResourceError> {
        resource.acquire()?;
        Ok(Self { resource })
    }

    /// Wraps a reference that was already acquired.
    pub(crate) fn from_acquired(resource: Arc<Resource<T>>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &Arc<Resource<T>> {
        &self.resource
    }
}

impl<T: Payload> Deref for ResourceRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // holding a reference prevents recycling
        &self.resource.payload
    }
}

impl<T: Payload> Drop for ResourceRef<T> {
    fn drop(&mut self) {
        if let Err(error) = self.resource.release() {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                key = %self.resource.key,
                "Failed to release resource"
            );
        }
    }
}

impl<T: Payload> fmt::Debug for ResourceRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceRef").field(&self.resource).finish()
    }
}
