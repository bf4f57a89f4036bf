use std::sync::Arc;

use animload_service::config::Config;
use animload_service::context::AnimationContext;
use animload_service::download::FilesystemDownloader;
use animload_service::types::{Animation, Model};
use animload_service::{ContextError, DataSource, LoadError};
use animload_test::{self as test, fixtures, wait_until};

use crate::TestCallback;

#[tokio::test(flavor = "multi_thread")]
async fn test_mirror_and_disk_cache() {
    test::setup();
    let mirror = test::tempdir();
    let cache_dir = test::tempdir();
    test::write_file(mirror.path(), "cdn.example.com/anims/intro.svga", &fixtures::svga());

    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    let context = AnimationContext::new();
    let downloader = Arc::new(FilesystemDownloader::new(mirror.path()));
    context.init(&config, Some(downloader)).unwrap();
    let engine = context.engine().unwrap();

    let model = Model::parse("https://cdn.example.com/anims/intro.svga");
    let (callback, mut events) = TestCallback::<Animation>::new();
    context.request(model.clone()).unwrap().load(&engine, callback);
    let (held, data_source, _) = events.next().await.unwrap_ready();
    assert_eq!(data_source, DataSource::RemoteFetch);
    let resource = Arc::clone(held.resource());
    drop(held);
    wait_until(|| resource.acquired() == 0).await;

    // the mirror is no longer needed
    drop(mirror);
    engine.clear();
    assert!(resource.is_recycled());

    let (callback, mut events) = TestCallback::<Animation>::new();
    context.request(model).unwrap().load(&engine, callback);
    let (animation, data_source, _) = events.next().await.unwrap_ready();
    assert_eq!(data_source, DataSource::DiskCache);
    assert_eq!(animation.data(), &fixtures::svga());

    context.teardown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_teardown_keeps_held_animations() {
    test::setup();
    let assets = test::tempdir();
    test::write_file(assets.path(), "spinner.gif", &fixtures::gif());

    let config = Config {
        asset_dir: Some(assets.path().to_owned()),
        ..Default::default()
    };
    let context = AnimationContext::new();
    context.init(&config, None).unwrap();
    let engine = context.engine().unwrap();

    let (callback, mut events) = TestCallback::<Animation>::new();
    engine.load(Model::Asset("spinner.gif".into()), &Default::default(), callback);
    let (animation, _, _) = events.next().await.unwrap_ready();

    context.teardown().unwrap();
    assert!(matches!(context.engine(), Err(ContextError::TornDown)));
    assert!(matches!(
        context.request(Model::Asset("spinner.gif".into())),
        Err(ContextError::TornDown)
    ));

    // still referenced, so still alive
    assert!(!animation.resource().is_recycled());
    assert_eq!(animation.dimensions(), Some((320, 240)));

    // an engine obtained before the teardown refuses to load
    let (callback, mut events) = TestCallback::<Animation>::new();
    let status = engine.load(Model::Asset("spinner.gif".into()), &Default::default(), callback);
    assert!(status.is_none());
    assert_eq!(events.try_next().unwrap().unwrap_failed(), LoadError::ShutDown);
    assert_eq!(engine.job_count(), 0);
}
