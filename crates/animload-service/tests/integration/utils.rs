use std::path::Path;

use bytes::Bytes;

use animload_service::caching::{Cache, CacheKey, CacheName, CacheVersions, clear_tmp};
use animload_service::config::Config;
use animload_service::types::{Model, RequestOptions};
use animload_service::{Engine, EngineBuilder};
use animload_test::{self as test, TestDecoder, TestPayload};

pub use test::{Event, Events, Gate, TestCallback, TestDownloader};

/// Setup tests and create an engine decoding with `decoder`.
///
/// The `configure` closure can add a downloader, disk cache or other settings before the engine
/// is built. Must be called from within a tokio runtime.
pub fn setup_engine(
    decoder: &TestDecoder,
    configure: impl FnOnce(EngineBuilder<TestPayload>) -> EngineBuilder<TestPayload>,
) -> Engine<TestPayload> {
    test::setup();
    configure(Engine::builder(decoder.clone())).build().unwrap()
}

/// Creates an artifact cache inside `cache_dir`.
pub fn disk_cache(cache_dir: &Path, versions: Option<CacheVersions>) -> Cache {
    let config = Config {
        cache_dir: Some(cache_dir.to_owned()),
        ..Default::default()
    };
    clear_tmp(&config).unwrap();
    let cache = Cache::from_config(CacheName::Artifacts, &config).unwrap();
    match versions {
        Some(versions) => cache.with_versions(versions),
        None => cache,
    }
}

pub fn bytes_model(data: &'static [u8]) -> Model {
    Model::Bytes(Bytes::from_static(data))
}

pub fn key_of(model: &Model, options: &RequestOptions) -> CacheKey {
    Engine::<TestPayload>::cache_key(model, options)
}

/// Checks that `key` is not both referenced and cached at the same time.
///
/// Only meaningful while no load or release is in progress.
#[track_caller]
pub fn assert_exclusive(engine: &Engine<TestPayload>, key: &CacheKey) {
    assert!(
        !(engine.is_active(key) && engine.is_in_memory(key)),
        "{key} is both active and cached"
    );
}
