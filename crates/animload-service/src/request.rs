//! Building load requests.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::caching::CacheKey;
use crate::engine::{Engine, LoadStatus, Payload, ResourceCallback};
use crate::types::{CacheStrategy, Model, RequestOptions};

/// A load request for a payload of type `T`.
///
/// The configuration lives in a plain [`RequestOptions`] value, so a request can be moved to an
/// engine of another payload type with [`retarget`](Self::retarget) without losing any of it.
pub struct RequestBuilder<T> {
    model: Model,
    options: RequestOptions,
    payload: PhantomData<fn() -> T>,
}

impl<T: Payload> RequestBuilder<T> {
    /// Creates a request for `model` with default options.
    pub fn new(model: impl Into<Model>) -> Self {
        Self::with_options(model, RequestOptions::default())
    }

    pub fn with_options(model: impl Into<Model>, options: RequestOptions) -> Self {
        Self {
            model: model.into(),
            options,
            payload: PhantomData,
        }
    }

    /// Replaces all options at once.
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.options.cache_strategy = strategy;
        self
    }

    pub fn disk_cache(mut self, enabled: bool) -> Self {
        self.options.disk_cache = enabled;
        self
    }

    pub fn skip_memory_cache(mut self, skip: bool) -> Self {
        self.options.skip_memory_cache = skip;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn request_options(&self) -> &RequestOptions {
        &self.options
    }

    /// The key this request is deduplicated and cached under.
    pub fn cache_key(&self) -> CacheKey {
        Engine::<T>::cache_key(&self.model, &self.options)
    }

    /// Turns this into a request for another payload type, keeping model and options.
    pub fn retarget<U: Payload>(self) -> RequestBuilder<U> {
        RequestBuilder {
            model: self.model,
            options: self.options,
            payload: PhantomData,
        }
    }

    /// Submits the request. See [`Engine::load`].
    pub fn load(
        self,
        engine: &Engine<T>,
        callback: Arc<dyn ResourceCallback<T>>,
    ) -> Option<LoadStatus<T>> {
        engine.load(self.model, &self.options, callback)
    }
}

impl<T> Clone for RequestBuilder<T> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            options: self.options.clone(),
            payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RequestBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("model", &self.model)
            .field("options", &self.options)
            .finish()
    }
}
