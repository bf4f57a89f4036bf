use std::sync::{Arc, Barrier};
use std::time::Duration;

use animload_service::types::{CacheStrategy, Model, RequestOptions};
use animload_service::{
    DataSource, DecodeError, JobStateError, LoadError, ResourceCallback, ResourceRef,
};
use animload_test::{PanickingCallback, TestDecoder, TestPayload, wait_until};
use parking_lot::Mutex;

use crate::{Gate, TestCallback, assert_exclusive, bytes_model, key_of, setup_engine};

#[tokio::test(flavor = "multi_thread")]
async fn test_load_from_local_source() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"GIF89a spinner");
    let key = key_of(&model, &RequestOptions::default());
    let (callback, mut events) = TestCallback::<TestPayload>::new();

    let status = engine.load(model, &RequestOptions::default(), callback.clone());
    assert!(status.is_some());

    let (resource, data_source, from_alternate_key) = events.next().await.unwrap_ready();
    assert_eq!(data_source, DataSource::LocalSource);
    assert!(!from_alternate_key);
    assert_eq!(&resource.data[..], b"GIF89a spinner");
    assert_eq!(decoder.calls(), 1);

    // the engine tracks the resource before any callback sees it
    assert!(engine.is_active(&key));
    assert!(!engine.has_job(&key));
    assert_eq!(callback.deliveries(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_released_resource_is_served_from_memory() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"lottie");
    let options = RequestOptions::default();
    let key = key_of(&model, &options);

    let (callback, mut events) = TestCallback::<TestPayload>::new();
    engine.load(model.clone(), &options, callback);
    let (resource, _, _) = events.next().await.unwrap_ready();
    let first = Arc::clone(resource.resource());
    drop(resource);

    wait_until(|| engine.is_in_memory(&key)).await;
    assert!(!engine.is_active(&key));
    assert_eq!(first.acquired(), 0);
    assert!(!first.is_recycled());

    let (callback, mut events) = TestCallback::<TestPayload>::new();
    let status = engine.load(model, &options, callback);
    assert!(status.is_none());

    // delivered before `load` returned
    let (resource, data_source, _) = events.try_next().unwrap().unwrap_ready();
    assert_eq!(data_source, DataSource::MemoryCache);
    assert!(Arc::ptr_eq(resource.resource(), &first));
    assert!(engine.is_active(&key));
    assert!(!engine.is_in_memory(&key));
    assert_eq!(decoder.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_active_resource_is_shared() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"svga");
    let options = RequestOptions::default();
    let key = key_of(&model, &options);

    let (callback, mut events) = TestCallback::<TestPayload>::new();
    engine.load(model.clone(), &options, callback);
    let (first, _, _) = events.next().await.unwrap_ready();
    // the job hands back its own reference once every callback was notified
    wait_until(|| first.resource().acquired() == 1).await;

    let mut held = Vec::new();
    for _ in 0..2 {
        let (callback, mut events) = TestCallback::<TestPayload>::new();
        assert!(engine.load(model.clone(), &options, callback).is_none());
        let (resource, data_source, _) = events.try_next().unwrap().unwrap_ready();
        assert_eq!(data_source, DataSource::ActiveResource);
        assert!(Arc::ptr_eq(resource.resource(), first.resource()));
        held.push(resource);
    }
    assert_eq!(first.resource().acquired(), 3);

    drop(held);
    assert_eq!(first.resource().acquired(), 1);
    assert!(engine.is_active(&key));
    assert!(!engine.is_in_memory(&key));

    drop(first);
    assert!(!engine.is_active(&key));
    assert!(engine.is_in_memory(&key));
    assert_eq!(decoder.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_loads_share_one_job() {
    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"pag");
    let options = RequestOptions::default();
    let key = key_of(&model, &options);

    let mut waiting = Vec::new();
    for _ in 0..8 {
        let (callback, events) = TestCallback::<TestPayload>::new();
        let status = engine.load(model.clone(), &options, callback);
        assert!(status.is_some());
        assert_eq!(engine.job_count(), 1);
        waiting.push(events);
    }
    assert!(engine.has_job(&key));

    gate.open();

    let mut resources = Vec::new();
    for events in &mut waiting {
        let (resource, data_source, _) = events.next().await.unwrap_ready();
        assert_eq!(data_source, DataSource::LocalSource);
        resources.push(resource);
    }
    assert!(
        resources
            .iter()
            .all(|r| Arc::ptr_eq(r.resource(), resources[0].resource()))
    );
    assert_eq!(decoder.calls(), 1);
    assert_eq!(engine.job_count(), 0);

    wait_until(|| resources[0].resource().acquired() == 8).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_racing_loads_share_one_job() {
    const LOADERS: usize = 16;

    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"lottie");
    let options = RequestOptions::default();
    let barrier = Arc::new(Barrier::new(LOADERS));

    let mut loaders = Vec::new();
    let mut waiting = Vec::new();
    for _ in 0..LOADERS {
        let (callback, events) = TestCallback::<TestPayload>::new();
        waiting.push(events);

        let (engine, model, options) = (engine.clone(), model.clone(), options.clone());
        let barrier = Arc::clone(&barrier);
        loaders.push(tokio::task::spawn_blocking(move || {
            barrier.wait();
            engine.load(model, &options, callback)
        }));
    }

    let mut statuses = Vec::new();
    for loader in loaders {
        statuses.push(loader.await.unwrap().unwrap());
    }
    assert_eq!(engine.job_count(), 1);
    assert!(
        statuses
            .iter()
            .all(|status| Arc::ptr_eq(status.job(), statuses[0].job()))
    );

    gate.open();
    let mut resources = Vec::new();
    for events in &mut waiting {
        let (resource, data_source, _) = events.next().await.unwrap_ready();
        assert_eq!(data_source, DataSource::LocalSource);
        resources.push(resource);
    }
    assert!(
        resources
            .iter()
            .all(|r| Arc::ptr_eq(r.resource(), resources[0].resource()))
    );
    assert_eq!(decoder.calls(), 1);
}

/// Records the order in which callbacks of one load are notified.
struct OrderedCallback {
    index: usize,
    seen: Arc<Mutex<Vec<usize>>>,
}

impl ResourceCallback<TestPayload> for OrderedCallback {
    fn on_resource_ready(&self, _: ResourceRef<TestPayload>, _: DataSource, _: bool) {
        self.seen.lock().push(self.index);
    }

    fn on_load_failed(&self, _: LoadError) {
        self.seen.lock().push(self.index);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callbacks_are_notified_in_registration_order() {
    let options = RequestOptions::default();
    for model in [bytes_model(b"svga"), bytes_model(b"broken svga")] {
        let gate = Gate::new();
        let decoder = TestDecoder::new().gated(gate.clone());
        let engine = setup_engine(&decoder, |builder| builder);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..12 {
            let callback = Arc::new(OrderedCallback {
                index,
                seen: Arc::clone(&seen),
            });
            assert!(engine.load(model.clone(), &options, callback).is_some());
        }

        gate.open();
        wait_until(|| seen.lock().len() == 12).await;
        assert_eq!(*seen.lock(), (0..12).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decodes_are_bounded() {
    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder.decode_threads(2));
    let options = RequestOptions::default();

    let mut waiting = Vec::new();
    for i in 0..8u8 {
        let (callback, events) = TestCallback::<TestPayload>::new();
        engine.load(Model::Bytes(vec![b'a', i].into()), &options, callback);
        waiting.push(events);
    }
    assert_eq!(engine.job_count(), 8);

    wait_until(|| gate.waiting() == 2).await;
    // give the other jobs a chance to start decoding, they must not
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gate.waiting(), 2);
    assert_eq!(decoder.calls(), 2);

    gate.open();
    for events in &mut waiting {
        events.next().await.unwrap_ready();
    }
    assert_eq!(decoder.calls(), 8);
    assert!(decoder.peak() <= 2, "{} decodes ran at once", decoder.peak());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_after_runtime_shutdown() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .build()
        .unwrap();
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder.runtime(runtime.handle().clone()));
    runtime.shutdown_background();

    let model = bytes_model(b"pag");
    let options = RequestOptions::default();
    let key = key_of(&model, &options);

    for _ in 0..2 {
        let (callback, mut events) = TestCallback::<TestPayload>::new();
        assert!(engine.load(model.clone(), &options, callback).is_some());
        assert_eq!(events.next().await.unwrap_failed(), LoadError::ShutDown);
        wait_until(|| !engine.has_job(&key)).await;
    }
    assert_eq!(engine.job_count(), 0);
    assert_eq!(decoder.calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_after_engine_shutdown() {
    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder);
    let options = RequestOptions::default();

    let (pending, _pending_events) = TestCallback::<TestPayload>::new();
    engine.load(bytes_model(b"gif"), &options, pending.clone());
    wait_until(|| gate.waiting() == 1).await;
    engine.shutdown();
    assert_eq!(engine.job_count(), 0);

    // rejected before `load` returns
    let (callback, mut events) = TestCallback::<TestPayload>::new();
    assert!(engine.load(bytes_model(b"vap"), &options, callback).is_none());
    assert_eq!(events.try_next().unwrap().unwrap_failed(), LoadError::ShutDown);

    gate.open();
    wait_until(|| decoder.recycled() == 1).await;
    assert_eq!(pending.deliveries(), 0);
    assert_eq!(decoder.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decode_error_reaches_every_callback() {
    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"broken vap");
    let options = RequestOptions::default();
    let key = key_of(&model, &options);

    let (first, mut first_events) = TestCallback::<TestPayload>::new();
    let (second, mut second_events) = TestCallback::<TestPayload>::new();
    assert!(engine.load(model.clone(), &options, first).is_some());
    assert!(engine.load(model, &options, second).is_some());
    gate.open();

    for events in [&mut first_events, &mut second_events] {
        let error = events.next().await.unwrap_failed();
        assert!(matches!(error, LoadError::Decode(DecodeError::Malformed(_))));
    }

    assert!(!engine.has_job(&key));
    assert!(!engine.is_active(&key));
    assert!(!engine.is_in_memory(&key));
    assert_eq!(engine.active_count(), 0);
    assert_eq!(engine.memory_count(), 0);
    assert_eq!(decoder.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uncacheable_resource_is_recycled() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"gif");
    let options = RequestOptions {
        skip_memory_cache: true,
        ..Default::default()
    };
    let key = key_of(&model, &options);

    let (callback, mut events) = TestCallback::<TestPayload>::new();
    engine.load(model, &options, callback);
    let (resource, _, _) = events.next().await.unwrap_ready();
    let recycled = Arc::clone(resource.resource());
    assert!(!recycled.is_cacheable());
    drop(resource);

    wait_until(|| decoder.recycled() == 1).await;
    assert!(recycled.is_recycled());
    assert!(!engine.is_in_memory(&key));
    assert!(!engine.is_active(&key));
    assert_eq!(engine.memory_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_status_does_not_affect_others() {
    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"lottie");
    let options = RequestOptions::default();

    let (first, _first_events) = TestCallback::<TestPayload>::new();
    let (second, mut second_events) = TestCallback::<TestPayload>::new();
    let first_status = engine.load(model.clone(), &options, first.clone()).unwrap();
    let second_status = engine.load(model, &options, second.clone()).unwrap();
    assert!(Arc::ptr_eq(first_status.job(), second_status.job()));

    first_status.cancel();
    assert_eq!(first_status.job().pending_callbacks(), 1);
    gate.open();

    let (resource, _, _) = second_events.next().await.unwrap_ready();
    assert_eq!(&resource.data[..], b"lottie");
    // callbacks are notified in order, the first one would have been notified already
    assert_eq!(first.deliveries(), 0);
    assert_eq!(second.deliveries(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_job_recycles_its_result() {
    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"svga");
    let options = RequestOptions::default();
    let key = key_of(&model, &options);

    let (callback, _events) = TestCallback::<TestPayload>::new();
    let status = engine.load(model.clone(), &options, callback.clone()).unwrap();
    wait_until(|| gate.waiting() == 1).await;

    let job = Arc::clone(status.job());
    job.cancel();
    assert!(job.is_cancelled());
    assert!(!engine.has_job(&key));
    // cancelling twice is fine
    job.cancel();
    assert_eq!(job.start(), Err(JobStateError::Terminal("cancelled")));

    gate.open();
    wait_until(|| decoder.recycled() == 1).await;
    assert_eq!(callback.deliveries(), 0);
    assert!(!engine.is_active(&key));
    assert!(!engine.is_in_memory(&key));

    // a new load starts over
    let (callback, mut events) = TestCallback::<TestPayload>::new();
    assert!(engine.load(model, &options, callback).is_some());
    events.next().await.unwrap_ready();
    assert_eq!(decoder.calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_state_errors() {
    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder);

    let (callback, mut events) = TestCallback::<TestPayload>::new();
    let status = engine
        .load(bytes_model(b"pag"), &RequestOptions::default(), callback)
        .unwrap();
    assert_eq!(status.job().start(), Err(JobStateError::AlreadyStarted));

    gate.open();
    let (_resource, _, _) = events.next().await.unwrap_ready();
    assert!(status.job().is_complete());
    assert_eq!(status.job().start(), Err(JobStateError::Terminal("complete")));

    // cancelling a complete job has no effect
    status.job().cancel();
    assert!(status.job().is_complete());
    assert_eq!(decoder.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_callbacks_are_isolated() {
    let gate = Gate::new();
    let decoder = TestDecoder::new().gated(gate.clone());
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"vap");
    let options = RequestOptions::default();
    let key = key_of(&model, &options);

    let (callback, mut events) = TestCallback::<TestPayload>::new();
    engine.load(model.clone(), &options, Arc::new(PanickingCallback));
    engine.load(model.clone(), &options, callback);
    gate.open();

    let (resource, _, _) = events.next().await.unwrap_ready();
    wait_until(|| resource.resource().acquired() == 1).await;

    // a panic on the synchronous path does not escape `load`, and still releases its reference
    assert!(engine.load(model, &options, Arc::new(PanickingCallback)).is_none());
    assert_eq!(resource.resource().acquired(), 1);

    drop(resource);
    assert!(engine.is_in_memory(&key));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_source() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let model = Model::Asset("gift.pag".into());
    let (callback, mut events) = TestCallback::<TestPayload>::new();
    assert!(engine.load(model, &RequestOptions::default(), callback).is_some());

    let error = events.next().await.unwrap_failed();
    assert!(matches!(error, LoadError::UnsupportedSource(_)));
    assert_eq!(decoder.calls(), 0);
    assert_eq!(engine.job_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_decoder() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let (callback, mut events) = TestCallback::<TestPayload>::new();
    engine.load(bytes_model(b"panic"), &RequestOptions::default(), callback);

    assert_eq!(events.next().await.unwrap_failed(), LoadError::InternalError);
    assert_eq!(engine.job_count(), 0);
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_callback_on_complete_job() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"gif");
    let options = RequestOptions::default();
    let key = key_of(&model, &options);

    let (callback, mut events) = TestCallback::<TestPayload>::new();
    let status = engine.load(model, &options, callback).unwrap();
    let (resource, _, _) = events.next().await.unwrap_ready();
    let job = Arc::clone(status.job());
    assert!(job.is_complete());

    // the job released its delivery hold, the resource is only referenced by its caller
    wait_until(|| resource.resource().acquired() == 1).await;

    let (late, mut late_events) = TestCallback::<TestPayload>::new();
    assert!(job.add_callback(late).is_some());
    let (late_resource, data_source, _) = late_events.next().await.unwrap_ready();
    assert_eq!(data_source, DataSource::ActiveResource);
    assert!(Arc::ptr_eq(late_resource.resource(), resource.resource()));

    // moving through the memory cache and back
    drop(resource);
    drop(late_resource);
    wait_until(|| engine.is_in_memory(&key)).await;

    let (late, mut late_events) = TestCallback::<TestPayload>::new();
    job.add_callback(late);
    let (_late_resource, data_source, _) = late_events.next().await.unwrap_ready();
    assert_eq!(data_source, DataSource::MemoryCache);
    assert!(engine.is_active(&key));
    assert_exclusive(&engine, &key);
    assert_eq!(decoder.calls(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_callback_after_recycle() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let options = RequestOptions {
        skip_memory_cache: true,
        ..Default::default()
    };
    let (callback, mut events) = TestCallback::<TestPayload>::new();
    let status = engine.load(bytes_model(b"gif"), &options, callback).unwrap();
    drop(events.next().await.unwrap_ready());
    wait_until(|| decoder.recycled() == 1).await;

    let (late, mut late_events) = TestCallback::<TestPayload>::new();
    assert!(status.job().add_callback(late).is_some());
    assert_eq!(late_events.next().await.unwrap_failed(), LoadError::Recycled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clear() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);
    let options = RequestOptions::default();

    // one active resource
    let active = bytes_model(b"active");
    let active_key = key_of(&active, &options);
    let (callback, mut events) = TestCallback::<TestPayload>::new();
    engine.load(active, &options, callback);
    let (held, _, _) = events.next().await.unwrap_ready();

    // one cached resource
    let cached = bytes_model(b"cached");
    let cached_key = key_of(&cached, &options);
    let (callback, mut events) = TestCallback::<TestPayload>::new();
    engine.load(cached, &options, callback);
    drop(events.next().await.unwrap_ready());
    wait_until(|| engine.is_in_memory(&cached_key)).await;

    // one job in flight
    let gate = Gate::new();
    let blocked = TestDecoder::new().gated(gate.clone());
    let blocked_engine = setup_engine(&blocked, |builder| builder);
    let (pending, _pending_events) = TestCallback::<TestPayload>::new();
    blocked_engine.load(bytes_model(b"pending"), &options, pending.clone());
    assert_eq!(blocked_engine.job_count(), 1);
    wait_until(|| gate.waiting() == 1).await;

    wait_until(|| held.resource().acquired() == 1).await;
    engine.clear();
    blocked_engine.clear();

    assert_eq!(engine.active_count(), 0);
    assert_eq!(engine.memory_count(), 0);
    assert_eq!(blocked_engine.job_count(), 0);
    // only the cached resource is recycled, the held one stays usable
    assert_eq!(decoder.recycled(), 1);
    assert!(!held.resource().is_recycled());
    assert_eq!(&held.data[..], b"active");

    // the cancelled job still finishes its decode, but nobody gets the result
    gate.open();
    wait_until(|| blocked.recycled() == 1).await;
    assert_eq!(pending.deliveries(), 0);

    // the untracked resource is disposed of normally once released
    drop(held);
    assert!(engine.is_in_memory(&active_key));
    assert!(!engine.is_active(&active_key));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_memory_cache_is_bounded() {
    let decoder = TestDecoder::new().with_weight(6);
    let engine = setup_engine(&decoder, |builder| builder.memory_capacity(10));
    let options = RequestOptions::default();

    for data in [&b"first"[..], &b"second"[..]] {
        let (callback, mut events) = TestCallback::<TestPayload>::new();
        engine.load(Model::Bytes(data.to_vec().into()), &options, callback);
        let (held, _, _) = events.next().await.unwrap_ready();
        let resource = Arc::clone(held.resource());
        drop(held);
        wait_until(|| resource.acquired() == 0).await;
    }

    // only one of both fits, the other one is recycled
    wait_until(|| engine.memory_weight() <= 10).await;
    assert_eq!(decoder.recycled(), 1);
    assert_eq!(engine.memory_count(), 1);
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_strategy_without_memory_cache() {
    let decoder = TestDecoder::new();
    let engine = setup_engine(&decoder, |builder| builder);

    let model = bytes_model(b"gif");
    let options = RequestOptions {
        cache_strategy: CacheStrategy::None,
        ..Default::default()
    };
    let key = key_of(&model, &options);

    for expected_calls in 1..=2 {
        let (callback, mut events) = TestCallback::<TestPayload>::new();
        engine.load(model.clone(), &options, callback);
        let (held, _, _) = events.next().await.unwrap_ready();
        let resource = Arc::clone(held.resource());
        drop(held);
        wait_until(|| resource.is_recycled()).await;
        assert!(!engine.is_in_memory(&key));
        assert_eq!(decoder.calls(), expected_calls);
    }
}
