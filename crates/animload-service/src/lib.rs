//! The animload resource engine and its supporting services.
//!
//! Animations of several container formats (GIF, Lottie, SVGA, PAG and VAP overlays) are
//! requested through a single [`Engine`](engine::Engine), which deduplicates concurrent
//! requests, keeps decoded animations alive while they are referenced and caches them in
//! memory (and their downloaded artifacts on disk) afterwards.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod context;
pub mod decode;
pub mod download;
pub mod engine;
pub mod error;
pub mod logging;
pub mod request;
pub mod types;
pub mod utils;

pub use engine::{
    DataSource, DeliveryExecutor, DeliveryThread, Engine, EngineBuilder, LoadStatus, Payload,
    Resource, ResourceCallback, ResourceListener, ResourceRef,
};
pub use error::{ContextError, DecodeError, FetchError, JobStateError, LoadError, ResourceError};
