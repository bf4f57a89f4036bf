//! The animload configuration file.
//!
//! Every section is optional, an absent value falls back to its default:
//!
//! ```yaml
//! cache_dir: /var/cache/animload
//! asset_dir: ./assets
//! logging:
//!   level: debug
//! caches:
//!   downloaded:
//!     max_unused_for: 12h
//! defaults:
//!   cache_strategy: memory_only
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::types::RequestOptions;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when attached to a terminal, `simplified` otherwise.
    Auto,
    /// Multi-line and colored.
    Pretty,
    /// One line per event, without colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The most verbose level that is logged, unless `RUST_LOG` says otherwise.
    #[serde(deserialize_with = "deserialize_level")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE` so that panics in decoders and callbacks are logged with backtraces.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Where and how metrics are reported, see [`crate::metrics`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Read from `STATSD_SERVER` if not configured.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// If set, the hostname is sent as a tag with this name.
    pub hostname_tag: Option<String>,
    /// Tags sent with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "animload".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::default(),
        }
    }
}

/// Expiry of downloaded artifacts in the disk cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloadedCacheConfig {
    /// Artifacts that were not used for this long are removed by `cleanup`.
    ///
    /// `None` keeps artifacts forever.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for DownloadedCacheConfig {
    fn default() -> Self {
        Self {
            max_unused_for: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Capacity (in bytes) of decoded animations kept in memory while no caller references them.
    ///
    /// The size limit is a best-effort approximation, based on the size of the encoded
    /// animation data.
    ///
    /// Defaults to `64 MiB (= 67_108_864)`.
    pub resources_capacity: u64,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            resources_capacity: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    pub downloaded: DownloadedCacheConfig,
    pub in_memory: InMemoryCacheConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the disk cache.
    ///
    /// Downloaded artifacts are not kept on disk when this is unset.
    pub cache_dir: Option<PathBuf>,

    /// Number of threads decoding animations.
    ///
    /// This is capped at the number of available cores.
    pub worker_threads: Option<usize>,

    /// Directory containing the animations packaged with the application.
    pub asset_dir: Option<PathBuf>,

    pub logging: Logging,

    pub metrics: Metrics,

    /// Errors and panics are reported to sentry if this is set.
    pub sentry_dsn: Option<Dsn>,

    pub caches: CacheConfigs,

    /// Request options used when a caller does not provide any.
    pub defaults: RequestOptions,
}

impl Config {
    /// Loads the configuration file at `path`, or the defaults if there is none.
    ///
    /// An empty file is an error rather than an empty configuration.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            anyhow::bail!("config file is empty");
        }
        serde_yaml::from_str(contents).context("invalid config file")
    }

    /// The location of `dir` inside the cache directory.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }

    /// The number of decoding threads, never more than the machine has cores.
    pub fn worker_threads(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.worker_threads.unwrap_or(cores).clamp(1, cores)
    }
}

/// Accepts the level names understood by `RUST_LOG`, in any case.
fn deserialize_level<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    level
        .parse()
        .map_err(|_| de::Error::custom(format_args!("unknown log level `{level}`")))
}
