use std::time::Duration;

use animload_service::config::Config;
use animload_service::context::AnimationContext;
use animload_service::types::{Animation, Model};
use animload_service::{DataSource, DecodeError, LoadError};
use animload_test::{self as test, fixtures};

use crate::TestCallback;

fn setup_context(assets: &test::TempDir) -> AnimationContext {
    test::setup();
    let config = Config {
        asset_dir: Some(assets.path().to_owned()),
        ..Default::default()
    };
    let context = AnimationContext::new();
    context.init(&config, None).unwrap();
    context
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_every_format() {
    let assets = test::tempdir();
    let names = [
        ("spinner.gif", fixtures::gif()),
        ("spinner.json", fixtures::lottie()),
        ("intro.svga", fixtures::svga()),
        ("gift.pag", fixtures::pag()),
        ("overlay.mp4", fixtures::vap()),
    ];
    for (name, data) in &names {
        test::write_file(assets.path(), name, data);
    }

    let context = setup_context(&assets);
    let engine = context.engine().unwrap();

    let mut lines = Vec::new();
    for (name, _) in &names {
        let (callback, mut events) = TestCallback::<Animation>::new();
        let request = context.request(Model::Asset(name.to_string())).unwrap();
        request.load(&engine, callback);

        let (animation, data_source, _) = events.next().await.unwrap_ready();
        assert_eq!(data_source, DataSource::LocalSource);
        let size = match animation.dimensions() {
            Some((width, height)) => format!("{width}x{height}"),
            None => "-".into(),
        };
        lines.push(format!("{name}: {} {size}", animation.kind()));
    }

    insta::assert_snapshot!(lines.join("\n"), @r###"
    spinner.gif: gif 320x240
    spinner.json: lottie 200x100
    intro.svga: svga -
    gift.pag: pag -
    overlay.mp4: vap 750x1334
    "###);

    context.teardown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_durations() {
    let assets = test::tempdir();
    test::write_file(assets.path(), "spinner.json", &fixtures::lottie());
    test::write_file(assets.path(), "overlay.mp4", &fixtures::vap());

    let context = setup_context(&assets);
    let engine = context.engine().unwrap();

    for (name, duration) in [
        ("spinner.json", Duration::from_secs(2)),
        ("overlay.mp4", Duration::from_secs(2)),
    ] {
        let (callback, mut events) = TestCallback::<Animation>::new();
        engine.load(Model::Asset(name.into()), &Default::default(), callback);
        let (animation, _, _) = events.next().await.unwrap_ready();
        assert_eq!(animation.duration(), Some(duration));
    }

    context.teardown().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_errors() {
    let assets = test::tempdir();
    test::write_file(assets.path(), "broken.json", b"{\"v\": ");
    test::write_file(assets.path(), "empty.gif", b"");

    let context = setup_context(&assets);
    let engine = context.engine().unwrap();

    let cases = [
        Model::Asset("broken.json".into()),
        Model::Asset("empty.gif".into()),
        Model::Asset("missing.gif".into()),
        Model::File(assets.path().join("clip.avi")),
    ];
    let mut errors = Vec::new();
    for model in cases {
        let (callback, mut events) = TestCallback::<Animation>::new();
        engine.load(model, &Default::default(), callback);
        errors.push(events.next().await.unwrap_failed());
    }

    assert!(matches!(errors[0], LoadError::Decode(DecodeError::Malformed(_))));
    assert_eq!(
        errors[1],
        LoadError::Decode(DecodeError::Malformed("empty source".into()))
    );
    assert!(matches!(errors[2], LoadError::Decode(DecodeError::Io(_))));
    assert!(matches!(errors[3], LoadError::UnsupportedSource(_)));
    assert_eq!(engine.job_count(), 0);

    context.teardown().unwrap();
}
