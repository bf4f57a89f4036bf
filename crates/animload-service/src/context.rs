//! The application-wide animload instance.
//!
//! An [`AnimationContext`] is created once at startup and handed to everything that loads
//! animations. It owns the worker runtime, the delivery thread and the [`Engine`], and moves
//! through the states `Uninitialized -> Ready -> TornDown`. There is no way back from
//! `TornDown`: create a new context instead.

use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::caching::{Cache, CacheName, clear_tmp};
use crate::config::Config;
use crate::decode::AnimationDecoder;
use crate::download::Downloader;
use crate::engine::{DeliveryThread, Engine};
use crate::error::ContextError;
use crate::request::RequestBuilder;
use crate::types::{Animation, Model, RequestOptions};

struct Services {
    engine: Engine<Animation>,
    defaults: RequestOptions,
    delivery: Arc<DeliveryThread>,
    runtime: Runtime,
}

enum State {
    Uninitialized,
    Ready(Box<Services>),
    TornDown,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready(_) => "ready",
            Self::TornDown => "torn down",
        }
    }
}

/// Owns the animload services and their lifecycle.
pub struct AnimationContext {
    state: Mutex<State>,
}

impl AnimationContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Uninitialized),
        }
    }

    /// Creates all services according to `config`.
    ///
    /// Remote models can only be loaded if a `downloader` is given.
    pub fn init(
        &self,
        config: &Config,
        downloader: Option<Arc<dyn Downloader>>,
    ) -> Result<(), ContextError> {
        let mut state = self.state.lock();
        match *state {
            State::Uninitialized => {}
            State::Ready(_) => return Err(ContextError::AlreadyInitialized),
            State::TornDown => return Err(ContextError::TornDown),
        }

        let services = create_services(config, downloader).map_err(ContextError::Setup)?;
        tracing::info!(
            worker_threads = config.worker_threads(),
            cache_dir = ?config.cache_dir,
            "Initialized animload"
        );
        *state = State::Ready(Box::new(services));
        Ok(())
    }

    /// Returns the engine while the context is ready.
    pub fn engine(&self) -> Result<Engine<Animation>, ContextError> {
        match &*self.state.lock() {
            State::Ready(services) => Ok(services.engine.clone()),
            State::Uninitialized => Err(ContextError::NotInitialized),
            State::TornDown => Err(ContextError::TornDown),
        }
    }

    /// Starts a request for `model` using the configured default options.
    pub fn request(
        &self,
        model: impl Into<Model>,
    ) -> Result<RequestBuilder<Animation>, ContextError> {
        match &*self.state.lock() {
            State::Ready(services) => {
                Ok(RequestBuilder::with_options(model, services.defaults.clone()))
            }
            State::Uninitialized => Err(ContextError::NotInitialized),
            State::TornDown => Err(ContextError::TornDown),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), State::Ready(_))
    }

    /// Stops all services.
    ///
    /// Cached animations are recycled and in-flight loads are cancelled. Deliveries that were
    /// already scheduled still run before this returns. Engines obtained earlier from
    /// [`engine`](Self::engine) fail every later load with
    /// [`LoadError::ShutDown`](crate::LoadError::ShutDown).
    pub fn teardown(&self) -> Result<(), ContextError> {
        let services = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::TornDown) {
                State::Ready(services) => services,
                State::Uninitialized => {
                    *state = State::Uninitialized;
                    return Err(ContextError::NotInitialized);
                }
                State::TornDown => return Err(ContextError::TornDown),
            }
        };

        let Services {
            engine,
            delivery,
            runtime,
            ..
        } = *services;
        engine.shutdown();
        delivery.shutdown();
        runtime.shutdown_background();
        tracing::info!("Tore down animload");
        Ok(())
    }
}

impl Default for AnimationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AnimationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimationContext")
            .field("state", &self.state.lock().name())
            .finish()
    }
}

fn create_services(
    config: &Config,
    downloader: Option<Arc<dyn Downloader>>,
) -> anyhow::Result<Services> {
    clear_tmp(config).context("failed to clear tmp cache")?;
    let disk = Cache::from_config(CacheName::Artifacts, config)
        .context("failed to create artifact cache")?;

    let delivery =
        Arc::new(DeliveryThread::spawn("animload-delivery").context("failed to spawn delivery")?);

    // created last, a runtime must not be dropped from within async code
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("animload-worker")
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
        .context("failed to create worker runtime")?;

    let mut builder = Engine::builder(AnimationDecoder::new(config.asset_dir.clone()))
        .memory_capacity(config.caches.in_memory.resources_capacity)
        .runtime(runtime.handle().clone())
        .decode_threads(config.worker_threads())
        .delivery(delivery.clone())
        .disk_cache(disk);
    if let Some(downloader) = downloader {
        builder = builder.downloader(downloader);
    }
    let engine = builder.build()?;

    Ok(Services {
        engine,
        defaults: config.defaults.clone(),
        delivery,
        runtime,
    })
}
