//! # animload caching infrastructure
//!
//! Decoding an animation is expensive, and downloading it even more so. animload therefore caches
//! on two layers:
//!
//! - An in-memory layer of decoded animations. Resources move into it once nobody references
//!   them anymore, and move back out when they are requested again. This layer is bounded by the
//!   weight of its contents, and anything it evicts is recycled.
//! - A file-system layer that persists downloaded artifacts, so that a later load of the same
//!   remote animation skips the network.
//!
//! Resources that are currently referenced are tracked by the [`Engine`](crate::engine::Engine)
//! itself and are not part of either layer.
//!
//! ## [`CacheKey`]
//!
//! The [`CacheKey`] is used both as the key for the in-memory layer, and as the path of the
//! file-system layer. It contains human-readable (but not necessarily machine-readable) metadata
//! describing the model and the cache strategy of the request. This metadata is SHA256-hashed to
//! form the file name, and written into a `.metadata` file next to the cached artifact.
//!
//! **NOTE**: Care must be taken to make sure that this metadata is stable, as it would otherwise
//! lead to bad cache reuse.
//!
//! ## Cache Fallback and [`CacheVersions`]
//!
//! The file-system layer defines both a current cache version and a list of fallback versions,
//! each stored in its own directory. A lookup tries the current version first, followed by each
//! fallback version in order. An artifact found under a fallback version is still used, but it
//! is reported to callbacks as coming from an alternate key.
//!
//! ## Expiry and cleanup
//!
//! Artifacts expire once they were not used for `caches.downloaded.max_unused_for`. File-system
//! `mtime` is used to check for this, and artifacts that are in use have their `mtime` updated
//! once an hour. Expired files are only removed by an explicit [`cleanup`] run.
//!
//! ### Metrics
//!
//! - `caches.file.hit` / `caches.file.miss`: Lookups in the file-system layer.
//! - `caches.file.fallback`: Hits served from a fallback version.
//! - `caches.file.write`: Artifacts written to disk.
//! - `caches.file.size`: A histogram for the size (in bytes) of the loaded / written artifacts.
//! - `caches.memory.evicted`: Resources evicted from the in-memory layer.

mod cache_key;
mod cleanup;
mod config;
mod fs;
mod memory;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use cleanup::{CleanupStats, cleanup, clear_tmp};
pub use config::CacheName;
pub use fs::{
    ARTIFACT_VERSIONS, Artifact, Cache, CacheVersions, Metadata, metadata_path, read_metadata,
};
pub use memory::MemoryCache;
