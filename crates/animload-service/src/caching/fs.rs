use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::{Config, DownloadedCacheConfig};

use super::{CacheKey, CacheName};

/// The interval in which cache files should be touched.
///
/// Artifacts use a "time to idle" instead of "time to live" mode.
/// We thus need to regularly "touch" the files to signal that they are still in use.
/// This is being debounced to once every hour to not have to touch them on every single use.
const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// The suffix of the sidecar files holding the [`CacheKey`] metadata of an artifact.
const METADATA_EXTENSION: &str = "metadata";

/// Versions of a file system cache.
///
/// An entry of the `current` version is always preferred. Entries of a `fallbacks` version are
/// still usable, but served as coming from an alternate key. Entries of `previous` versions are
/// removed whenever the `current` version of the same key is written.
#[derive(Debug, Clone, Copy)]
pub struct CacheVersions {
    pub current: u32,
    pub fallbacks: &'static [u32],
    pub previous: &'static [u32],
}

/// Artifact cache versions.
///
/// - `2`: A `.metadata` sidecar file is written next to each artifact.
/// - `1`: Initial version.
pub const ARTIFACT_VERSIONS: CacheVersions = CacheVersions {
    current: 2,
    fallbacks: &[1],
    previous: &[1],
};

/// A file found in the disk cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// The location of the cached file.
    pub path: PathBuf,
    /// The cache version it was found under.
    pub version: u32,
    /// Whether it was found under a fallback version instead of the current one.
    pub is_fallback: bool,
}

/// The contents of the sidecar file written next to each artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub key: String,
    pub time_created: SystemTime,
}

/// A file system cache of downloaded artifacts.
///
/// Entries are plain files, written to a temporary file in a sibling directory first and then
/// atomically moved into place.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Cache identifier used for metric names.
    pub(super) name: CacheName,

    /// Directory to use for storing cache items. Will be created if it does not exist.
    ///
    /// Leaving this as None will disable this cache.
    pub(super) cache_dir: Option<PathBuf>,

    /// Directory to use for temporary files.
    ///
    /// Just like for `cache_dir` when this cache is disabled this will be `None`.
    tmp_dir: Option<PathBuf>,

    /// Options intended to be user-configurable.
    cache_config: DownloadedCacheConfig,

    versions: CacheVersions,
}

impl Cache {
    pub fn from_config(name: CacheName, config: &Config) -> io::Result<Self> {
        let tmp_dir = config.cache_dir("tmp");
        let cache_dir = config.cache_dir(name.as_ref());

        if let Some(ref dir) = cache_dir {
            fs::create_dir_all(dir)?;
        }

        Ok(Cache {
            name,
            cache_dir,
            tmp_dir,
            cache_config: config.caches.downloaded,
            versions: ARTIFACT_VERSIONS,
        })
    }

    /// Overrides the cache versions.
    pub fn with_versions(mut self, versions: CacheVersions) -> Self {
        self.versions = versions;
        self
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_dir.is_some()
    }

    /// Looks up the artifact for `key`.
    ///
    /// This first tries the current cache version and then the fallback versions. Failing to
    /// read the cache is logged and reported as a miss.
    pub fn lookup(&self, key: &CacheKey) -> Option<Artifact> {
        let cache_dir = self.cache_dir()?;
        let name = self.name.as_ref();

        let versions =
            std::iter::once(self.versions.current).chain(self.versions.fallbacks.iter().copied());

        for version in versions {
            let path = cache_dir.join(key.cache_path(version));
            tracing::trace!("Trying {} cache at path {}", name, path.display());

            match self.open_cachefile(&path) {
                Ok(Some(size)) => {
                    let is_fallback = version != self.versions.current;
                    metric!(counter("caches.file.hit") += 1, "cache" => name);
                    metric!(
                        histogram("caches.file.size") = size,
                        "hit" => "true",
                        "cache" => name,
                    );
                    if is_fallback {
                        metric!(
                            counter("caches.file.fallback") += 1,
                            "version" => &version.to_string(),
                            "cache" => name,
                        );
                    }
                    return Some(Artifact {
                        path,
                        version,
                        is_fallback,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Failed to open cache file",
                    );
                    continue;
                }
            }
        }

        metric!(counter("caches.file.miss") += 1, "cache" => name);
        None
    }

    /// Validate cache expiration of path.
    ///
    /// If the file should not be used, `Err(io::ErrorKind::NotFound)` is returned.
    /// Otherwise this returns the duration after which the file should be touched.
    pub(super) fn check_expiry(&self, path: &Path) -> io::Result<Duration> {
        // We use `mtime` to keep track of "cache last used", because literally every other
        // filesystem attribute is unreliable.
        let metadata = path.metadata()?;
        let mtime_elapsed = metadata.modified()?.elapsed().unwrap_or_default();

        let max_unused_for = self.cache_config.max_unused_for.unwrap_or(Duration::MAX);
        if mtime_elapsed > max_unused_for {
            return Err(io::ErrorKind::NotFound.into());
        }

        Ok(TOUCH_EVERY.saturating_sub(mtime_elapsed))
    }

    /// Validates the cache file at `path` against the expiration config.
    ///
    /// Takes care of bumping `mtime`. Returns the size of the file if it is usable.
    fn open_cachefile(&self, path: &Path) -> io::Result<Option<u64>> {
        // `io::ErrorKind::NotFound` can be returned from multiple locations in this function. All
        // of those can indicate a cache miss as cache cleanup can run inbetween.
        catch_not_found(|| {
            let touch_in = self.check_expiry(path)?;
            if touch_in == Duration::ZERO {
                filetime::set_file_mtime(path, FileTime::now())?;
            }
            Ok(path.metadata()?.len())
        })
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        match self.tmp_dir {
            Some(ref path) => {
                // The `cleanup` process could potentially remove the parent directories we are
                // operating in, so retry the fs operations.
                const MAX_RETRIES: usize = 2;
                let mut retries = 0;
                loop {
                    retries += 1;

                    if let Err(e) = fs::create_dir_all(path) {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to create cache directory: {:?}", e),
                        );
                        if retries > MAX_RETRIES {
                            return Err(e);
                        }
                        continue;
                    }

                    match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                        Ok(temp_file) => return Ok(temp_file),
                        Err(e) => {
                            sentry::with_scope(
                                |scope| scope.set_extra("path", path.display().to_string().into()),
                                || tracing::error!("Failed to create cache file: {:?}", e),
                            );
                            if retries > MAX_RETRIES {
                                return Err(e);
                            }
                            continue;
                        }
                    }
                }
            }
            None => NamedTempFile::new(),
        }
    }

    /// Moves a fully written `temp_file` into the cache under `key`.
    ///
    /// This also writes the metadata sidecar and removes files of previous cache versions.
    /// Returns the final location of the artifact.
    pub fn store(&self, key: &CacheKey, temp_file: NamedTempFile) -> io::Result<PathBuf> {
        let cache_dir = self
            .cache_dir()
            .ok_or_else(|| io::Error::other("the disk cache is disabled"))?;
        let name = self.name.as_ref();
        let cache_path = cache_dir.join(key.cache_path(self.versions.current));

        let size = temp_file.as_file().metadata()?.len();
        metric!(counter("caches.file.write") += 1, "cache" => name);
        metric!(
            histogram("caches.file.size") = size,
            "hit" => "false",
            "cache" => name,
        );

        tracing::trace!("Creating {name} at path {:?}", cache_path.display());
        persist_tempfile(temp_file, &cache_path)?;

        let metadata = Metadata {
            key: key.metadata().to_owned(),
            time_created: SystemTime::now(),
        };
        if let Err(e) = write_metadata(&cache_path, &metadata) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %cache_path.display(),
                "Failed to write metadata file",
            );
        }

        for version in self.versions.previous {
            let item_path = cache_dir.join(key.cache_path(*version));
            for path in [metadata_path(&item_path), item_path] {
                if let Err(e) = fs::remove_file(&path) {
                    // not all previous versions exist
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to remove old cache file"
                        );
                    }
                }
            }
        }

        Ok(cache_path)
    }
}

/// The path of the metadata sidecar belonging to the artifact at `path`.
pub fn metadata_path(path: impl AsRef<Path>) -> PathBuf {
    let mut path = path.as_ref().as_os_str().to_owned();
    path.push(".");
    path.push(METADATA_EXTENSION);
    PathBuf::from(path)
}

/// The path of the artifact a metadata sidecar at `path` belongs to.
pub(super) fn artifact_path(path: &Path) -> Option<PathBuf> {
    if path.extension()? != METADATA_EXTENSION {
        return None;
    }
    Some(path.with_extension(""))
}

pub fn read_metadata(path: impl AsRef<Path>) -> io::Result<Metadata> {
    let file = fs::File::open(metadata_path(path))?;
    Ok(serde_json::from_reader(io::BufReader::new(file))?)
}

fn write_metadata(path: &Path, metadata: &Metadata) -> io::Result<()> {
    let file = fs::File::create(metadata_path(path))?;
    serde_json::to_writer(io::BufWriter::new(file), metadata)?;
    Ok(())
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // The `cleanup` process could potentially remove the parent directories we are
    // operating in, so retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
