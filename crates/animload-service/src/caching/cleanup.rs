use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::config::Config;

use super::fs::{artifact_path, catch_not_found};
use super::{Cache, CacheName};

/// Removes expired artifacts from the disk cache configured in `config`.
///
/// With `dry_run`, nothing is deleted but the returned statistics are the same.
pub fn cleanup(config: Config, dry_run: bool) -> Result<CleanupStats> {
    Cache::from_config(CacheName::Artifacts, &config)?.cleanup(dry_run)
}

/// Recreates the directory of temporary files.
///
/// Temporary files are only left behind by a crash, so this runs once on startup.
pub fn clear_tmp(config: &Config) -> io::Result<()> {
    let Some(tmp) = config.cache_dir("tmp") else {
        return Ok(());
    };
    catch_not_found(|| fs::remove_dir_all(&tmp))?;
    fs::create_dir_all(&tmp)
}

/// What a cleanup run removed and retained.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl Cache {
    /// Removes expired artifacts and the directories they leave empty.
    ///
    /// With `dry_run`, nothing is deleted but the returned statistics are the same.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        let cache_dir = self
            .cache_dir
            .as_deref()
            .context("no `cache_dir` configured, there is nothing to clean up")?;
        tracing::info!(cache = %self.name, dry_run, "Cleaning up cache");

        let mut walk = CleanupWalk {
            cache: self,
            dry_run,
            stats: CleanupStats::default(),
        };
        walk.directory(cache_dir)?;
        let stats = walk.stats;

        tracing::info!(
            cache = %self.name,
            removed_files = stats.removed_files,
            removed_bytes = stats.removed_bytes,
            retained_files = stats.retained_files,
            retained_bytes = stats.retained_bytes,
            "Cleaned up cache"
        );

        let cache = self.name.as_ref();
        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => cache);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => cache);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64, "cache" => cache);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64, "cache" => cache);

        Ok(stats)
    }
}

struct CleanupWalk<'a> {
    cache: &'a Cache,
    dry_run: bool,
    stats: CleanupStats,
}

impl CleanupWalk<'_> {
    /// Cleans up `dir`, returning `true` if nothing is left in it.
    ///
    /// Entries are visited in random order, so a run that keeps failing on one entry still makes
    /// progress on the others over time.
    fn directory(&mut self, dir: &Path) -> Result<bool> {
        let Some(entries) = catch_not_found(|| fs::read_dir(dir))? else {
            return Ok(true);
        };
        tracing::debug!(path = %dir.display(), "Cleaning directory");

        let mut paths = entries
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<io::Result<Vec<_>>>()?;
        paths.shuffle(&mut thread_rng());

        let mut empty = true;
        for path in paths {
            empty &= if path.is_dir() {
                self.subdirectory(&path)?
            } else {
                self.file(&path).unwrap_or_else(|error| {
                    tracing::error!(
                        path = %path.display(),
                        error = ?error,
                        "Failed to clean cache file"
                    );
                    false
                })
            };
        }
        Ok(empty)
    }

    fn subdirectory(&mut self, dir: &Path) -> Result<bool> {
        let mut removed = self.directory(dir)?;
        if removed && !self.dry_run {
            if let Err(error) = fs::remove_dir(dir) {
                tracing::error!(
                    path = %dir.display(),
                    error = &error as &dyn std::error::Error,
                    "Failed to remove cache directory"
                );
                removed = false;
            }
        }

        if removed {
            self.stats.removed_dirs += 1;
        } else {
            self.stats.retained_dirs += 1;
        }
        Ok(removed)
    }

    /// Removes the file at `path` if it expired, returning `true` if it is gone.
    ///
    /// A metadata sidecar expires together with its artifact.
    fn file(&mut self, path: &Path) -> Result<bool> {
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        let artifact = artifact_path(path);
        let expiry_path = artifact.as_deref().unwrap_or(path);
        let expired = catch_not_found(|| self.cache.check_expiry(expiry_path))?.is_none();

        if !expired {
            self.stats.retained_files += 1;
            self.stats.retained_bytes += size;
            return Ok(false);
        }

        tracing::debug!(path = %path.display(), "Removing expired file");
        if !self.dry_run {
            catch_not_found(|| fs::remove_file(path))?;
        }
        self.stats.removed_files += 1;
        self.stats.removed_bytes += size;
        Ok(true)
    }
}
