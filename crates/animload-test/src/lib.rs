//! Helpers for testing the animload engine and its services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the disk cache loses its files in the
//!    middle of the test.
//!
//!  - Deliveries happen on the engine's delivery thread. Use [`TestCallback`] to receive them
//!    as [`Event`]s, and [`wait_until`] for state that settles after a delivery, like the job
//!    releasing its own reference to a resource.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

use animload_service::caching::CacheKey;
use animload_service::decode::{Decoder, SourceData};
use animload_service::download::Downloader;
use animload_service::types::Model;
use animload_service::{
    DataSource, DecodeError, FetchError, LoadError, Payload, ResourceCallback, ResourceRef,
};

pub use tempfile::TempDir;

/// How long tests wait for a delivery before giving up.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `animload_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("animload_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` to `dir/name` and returns the full path.
pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within [`TIMEOUT`].
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waiting = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, waiting)
        .await
        .expect("condition did not hold in time");
}

/// Minimal but well-formed animations of every supported format.
pub mod fixtures {
    use bytes::Bytes;

    /// A 320x240 GIF.
    pub fn gif() -> Bytes {
        Bytes::from_static(b"GIF89a\x40\x01\xf0\x00\x80\x00\x00;")
    }

    /// A 200x100 Lottie composition, 2 seconds at 30 fps.
    pub fn lottie() -> Bytes {
        Bytes::from_static(
            br#"{"v":"5.7.4","nm":"spinner","w":200,"h":100,"fr":30,"ip":0,"op":60,"layers":[]}"#,
        )
    }

    /// An SVGA 2.x container.
    pub fn svga() -> Bytes {
        Bytes::from_static(b"\x78\x9c\x03\x00\x00\x00\x00\x01")
    }

    /// A PAG file of version 3.
    pub fn pag() -> Bytes {
        Bytes::from_static(b"PAG\x03\x00\x00\x00\x00")
    }

    /// A VAP overlay with a `vapc` box declaring 750x1334, 20 fps and 40 frames.
    pub fn vap() -> Bytes {
        let config = br#"{"info":{"v":2,"f":40,"w":750,"h":1334,"fps":20}}"#;
        let mut data = Vec::new();
        data.extend_from_slice(&20u32.to_be_bytes());
        data.extend_from_slice(b"ftypisom\x00\x00\x02\x00isom");
        data.extend_from_slice(&((config.len() + 8) as u32).to_be_bytes());
        data.extend_from_slice(b"vapc");
        data.extend_from_slice(config);
        Bytes::from(data)
    }
}

/// A delivery received by a [`TestCallback`].
pub enum Event<T: Payload> {
    Ready {
        resource: ResourceRef<T>,
        data_source: DataSource,
        from_alternate_key: bool,
    },
    Failed(LoadError),
}

impl<T: Payload> Event<T> {
    /// Unwraps a successful delivery.
    ///
    /// # Panics
    ///
    /// Panics if the load failed.
    pub fn unwrap_ready(self) -> (ResourceRef<T>, DataSource, bool) {
        match self {
            Self::Ready {
                resource,
                data_source,
                from_alternate_key,
            } => (resource, data_source, from_alternate_key),
            Self::Failed(error) => panic!("expected a resource, got `{error}`"),
        }
    }

    /// Unwraps a failed delivery.
    ///
    /// # Panics
    ///
    /// Panics if the load succeeded.
    pub fn unwrap_failed(self) -> LoadError {
        match self {
            Self::Failed(error) => error,
            Self::Ready { data_source, .. } => {
                panic!("expected a failure, got a resource from {data_source}")
            }
        }
    }
}

/// A callback forwarding every delivery into a channel.
pub struct TestCallback<T: Payload> {
    sender: mpsc::UnboundedSender<Event<T>>,
    deliveries: AtomicUsize,
}

impl<T: Payload> TestCallback<T> {
    pub fn new() -> (Arc<Self>, Events<T>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let callback = Arc::new(Self {
            sender,
            deliveries: AtomicUsize::new(0),
        });
        (callback, Events { receiver })
    }

    /// The number of times this callback was invoked.
    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

impl<T: Payload> ResourceCallback<T> for TestCallback<T> {
    fn on_resource_ready(
        &self,
        resource: ResourceRef<T>,
        data_source: DataSource,
        from_alternate_key: bool,
    ) {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        let event = Event::Ready {
            resource,
            data_source,
            from_alternate_key,
        };
        // a test that stopped listening releases the resource right here
        self.sender.send(event).ok();
    }

    fn on_load_failed(&self, error: LoadError) {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        self.sender.send(Event::Failed(error)).ok();
    }
}

/// The receiving end of a [`TestCallback`].
pub struct Events<T: Payload> {
    receiver: mpsc::UnboundedReceiver<Event<T>>,
}

impl<T: Payload> Events<T> {
    /// Waits for the next delivery.
    ///
    /// # Panics
    ///
    /// Panics if nothing is delivered within [`TIMEOUT`].
    pub async fn next(&mut self) -> Event<T> {
        tokio::time::timeout(TIMEOUT, self.receiver.recv())
            .await
            .expect("no delivery in time")
            .expect("callback was dropped")
    }

    /// Returns a delivery that already happened, if any.
    pub fn try_next(&mut self) -> Option<Event<T>> {
        self.receiver.try_recv().ok()
    }
}

/// A callback that panics on every delivery.
pub struct PanickingCallback;

impl<T: Payload> ResourceCallback<T> for PanickingCallback {
    fn on_resource_ready(&self, _: ResourceRef<T>, data_source: DataSource, _: bool) {
        panic!("callback exploded on a resource from {data_source}");
    }

    fn on_load_failed(&self, error: LoadError) {
        panic!("callback exploded on `{error}`");
    }
}

/// The payload produced by [`TestDecoder`].
#[derive(Debug)]
pub struct TestPayload {
    pub data: Bytes,
    weight: u32,
    recycled: Arc<AtomicUsize>,
}

impl Payload for TestPayload {
    fn weight(&self) -> u32 {
        self.weight
    }

    fn recycle(&self) {
        self.recycled.fetch_add(1, Ordering::SeqCst);
    }
}

/// A latch that blocks decodes until it is opened.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    condvar: Condvar,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.condvar.notify_all();
    }

    /// The number of decodes currently blocked on the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        while !*open {
            self.condvar.wait(&mut open);
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A decoder producing [`TestPayload`]s and counting what it does.
///
/// Sources starting with `broken` fail to decode, sources starting with `panic` make the
/// decoder panic. Asset models are not supported. Clones share their counters.
#[derive(Debug, Clone)]
pub struct TestDecoder {
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    recycled: Arc<AtomicUsize>,
    gate: Option<Arc<Gate>>,
    weight: u32,
}

impl TestDecoder {
    pub fn new() -> Self {
        Self {
            calls: Arc::default(),
            running: Arc::default(),
            peak: Arc::default(),
            recycled: Arc::default(),
            gate: None,
            weight: 1,
        }
    }

    /// Blocks every decode until `gate` is opened.
    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// The weight of every produced payload.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// The number of decodes started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The highest number of decodes that ran at the same time so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// The number of produced payloads that were recycled so far.
    pub fn recycled(&self) -> usize {
        self.recycled.load(Ordering::SeqCst)
    }
}

impl Default for TestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder<TestPayload> for TestDecoder {
    fn handles(&self, model: &Model) -> bool {
        !matches!(model, Model::Asset(_))
    }

    fn decode(&self, source: SourceData) -> Result<TestPayload, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _running = Running(&self.running);

        if let Some(gate) = &self.gate {
            gate.wait();
        }

        let data = match source {
            SourceData::Bytes(bytes) => bytes,
            SourceData::File(path) => Bytes::from(std::fs::read(path)?),
            SourceData::Asset(name) => return Err(DecodeError::Unsupported(name)),
        };
        if data.starts_with(b"broken") {
            return Err(DecodeError::Malformed("broken test data".into()));
        }
        if data.starts_with(b"panic") {
            panic!("decoder exploded");
        }

        Ok(TestPayload {
            data,
            weight: self.weight,
            recycled: Arc::clone(&self.recycled),
        })
    }
}

/// Counts a decode as finished when dropped, even if it panicked.
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A downloader serving URLs from memory.
#[derive(Debug, Clone, Default)]
pub struct TestDownloader {
    files: Arc<Mutex<HashMap<Url, Bytes>>>,
    fetches: Arc<AtomicUsize>,
}

impl TestDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `contents` for `url` from now on.
    pub fn insert(&self, url: &str, contents: Bytes) -> Url {
        let url = Url::parse(url).unwrap();
        self.files.lock().insert(url.clone(), contents);
        url
    }

    /// The number of fetches so far, including failed ones.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Downloader for TestDownloader {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a mut NamedTempFile,
    ) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let contents = self.files.lock().get(url).cloned();
            let contents = contents.ok_or(FetchError::NotFound)?;
            destination.write_all(&contents)?;
            destination.flush()?;
            Ok(())
        })
    }
}

/// The key the engine uses for `model` with default options.
pub fn default_key(model: &Model) -> CacheKey {
    CacheKey::new(model, Default::default())
}
