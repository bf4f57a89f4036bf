//! Reporting engine and cache statistics to statsd.
//!
//! Nothing is reported until [`configure`] succeeded. Before that, and in processes that never
//! configure a statsd host, every [`metric!`](crate::metric) is a no-op.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

use crate::config::Metrics;

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Traits the [`metric!`](crate::metric) macro needs in scope.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches a fixed set of tags to everything it sends.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    global_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    #[inline(always)]
    pub fn send<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.global_tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }

    pub fn global_tags(&self) -> &BTreeMap<String, String> {
        &self.global_tags
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd
    }
}

/// The custom tags of `config`, plus the hostname under `hostname_tag` if it can be determined.
fn global_tags(config: &Metrics, hostname: Option<String>) -> BTreeMap<String, String> {
    let mut tags = config.custom_tags.clone();
    if let Some((tag, name)) = config.hostname_tag.clone().zip(hostname) {
        tags.insert(tag, name);
    }
    tags
}

/// Starts reporting to the statsd host in `config`.
///
/// Returns `false` without doing anything if no host is configured. A process reports to at most
/// one host, later calls only log a warning.
pub fn configure(config: &Metrics) -> Result<bool> {
    let Some(host) = config.statsd.as_deref() else {
        return Ok(false);
    };

    let addrs: Vec<_> = host
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve statsd host `{host}`"))?
        .collect();
    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket)?;

    let hostname = hostname::get().ok().and_then(|name| name.into_string().ok());
    let client = MetricsClient {
        statsd: StatsdClient::from_sink(&config.prefix, sink),
        global_tags: global_tags(config, hostname),
    };

    match CLIENT.set(client) {
        Ok(()) => tracing::info!(host, prefix = %config.prefix, "Reporting metrics to statsd"),
        Err(_) => tracing::warn!(host, "Metrics are already reported, ignoring statsd host"),
    }
    Ok(true)
}

/// Runs `f` with the configured client, or returns the default if there is none.
///
/// Prefer the [`metric!`](crate::metric) macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("engine.job.created") += 1);
/// metric!(timer("job.decode") = elapsed, "status" => "ok");
/// metric!(gauge("caches.size.files") = files, "cache" => "artifacts");
/// metric!(histogram("caches.file.size") = bytes, "hit" => "true");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags($id, $value) $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags($id, $value) $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags($id, $value) $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags($id, $value) $(, $k => $v)*)
    };
    (@send $method:ident($id:expr, $value:expr) $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send(client.$method($id, $value)$(.with_tag($k, $v))*);
        })
    }};
}
