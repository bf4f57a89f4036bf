//! Models, request options and the decoded animation payload.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

mod animation;

pub use animation::{
    Animation, AnimationKind, GifInfo, LottieInfo, PagInfo, SvgaGeneration, SvgaInfo, VapInfo,
};

/// What an animation is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Model {
    /// A remote location, or a `file://` URL pointing at a local file.
    Url(Url),
    /// A local file.
    File(PathBuf),
    /// Animation data that is already in memory.
    Bytes(Bytes),
    /// A named asset packaged with the application.
    Asset(String),
}

impl Model {
    /// Interprets `input` as a URL if it parses as one with a scheme we can
    /// download from, and as a file path otherwise.
    pub fn parse(input: &str) -> Self {
        match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => Self::Url(url),
            _ => Self::File(PathBuf::from(input)),
        }
    }

    /// Returns `true` if loading this model requires a [`Downloader`](crate::download::Downloader).
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Url(url) if url.scheme() != "file")
    }

    /// The file extension of the model, if it has one.
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            Self::Url(url) => url.path_segments()?.next_back()?.to_owned(),
            Self::File(path) => path.file_name()?.to_str()?.to_owned(),
            Self::Asset(name) => name.clone(),
            Self::Bytes(_) => return None,
        };
        let (_, ext) = name.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    }

    /// A short name of the model variant, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Url(url) if url.scheme() == "file" => "file_url",
            Self::Url(_) => "url",
            Self::File(_) => "file",
            Self::Bytes(_) => "bytes",
            Self::Asset(_) => "asset",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{url}"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Asset(name) => write!(f, "asset:{name}"),
        }
    }
}

impl From<Url> for Model {
    fn from(url: Url) -> Self {
        Self::Url(url)
    }
}

impl From<PathBuf> for Model {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<Bytes> for Model {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// Which caching layers a request may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Neither the memory cache nor the disk cache.
    None,
    /// Only the in-memory cache of decoded animations.
    MemoryOnly,
    /// Only the on-disk cache of downloaded artifacts.
    DiskOnly,
    /// Both caches.
    #[default]
    Both,
}

impl CacheStrategy {
    pub fn allows_memory(self) -> bool {
        matches!(self, Self::MemoryOnly | Self::Both)
    }

    pub fn allows_disk(self) -> bool {
        matches!(self, Self::DiskOnly | Self::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::MemoryOnly => "memory_only",
            Self::DiskOnly => "disk_only",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request configuration.
///
/// This is a plain value: it can be cloned freely and moved between request builders of
/// different payload types.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Which caching layers the request may use.
    pub cache_strategy: CacheStrategy,
    /// Whether the disk cache is consulted and populated, in addition to `cache_strategy`
    /// allowing it.
    pub disk_cache: bool,
    /// Resources produced for this request are never kept in the memory cache.
    pub skip_memory_cache: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            cache_strategy: CacheStrategy::Both,
            disk_cache: true,
            skip_memory_cache: false,
        }
    }
}

impl RequestOptions {
    /// Whether the disk cache should be used for this request.
    pub fn uses_disk_cache(&self) -> bool {
        self.disk_cache && self.cache_strategy.allows_disk()
    }

    /// Whether resources produced for this request may be retained in memory.
    pub fn is_memory_cacheable(&self) -> bool {
        !self.skip_memory_cache && self.cache_strategy.allows_memory()
    }
}
