//! Fetching remote animations into local files.
//!
//! animload does not ship a network transport. Applications provide one by implementing
//! [`Downloader`]. The [`FilesystemDownloader`] serves URLs from a local mirror directory and is
//! mostly used for testing and the command line.

use std::io;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tempfile::NamedTempFile;
use tokio::fs::File;
use url::Url;

use crate::error::FetchError;

/// Fetches the contents of a URL.
pub trait Downloader: Send + Sync + 'static {
    /// Writes the contents of `url` into `destination`.
    ///
    /// On success, `destination` is fully written and may be persisted into the disk cache.
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a mut NamedTempFile,
    ) -> BoxFuture<'a, Result<(), FetchError>>;
}

/// Downloader implementation resolving URLs inside a local directory.
///
/// Host and path of a URL are mapped onto `<root>/<host>/<path>`.
#[derive(Debug, Clone)]
pub struct FilesystemDownloader {
    root: PathBuf,
}

impl FilesystemDownloader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The location of `url` inside the mirror.
    pub fn resolve(&self, url: &Url) -> Result<PathBuf, FetchError> {
        let mut path = self.root.clone();
        if let Some(host) = url.host_str() {
            path.push(host);
        }
        for segment in url.path_segments().into_iter().flatten() {
            if segment.is_empty() || segment == "." {
                continue;
            }
            // a `..` segment could escape the mirror
            if segment == ".." || segment.contains('\\') {
                return Err(FetchError::PermissionDenied(format!(
                    "invalid path segment in `{url}`"
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn download(&self, url: &Url, destination: &mut NamedTempFile) -> Result<(), FetchError> {
        let path = self.resolve(url)?;
        tracing::debug!("Fetching animation from {:?}", path);

        let mut file = File::open(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FetchError::NotFound,
            _ => e.into(),
        })?;
        let mut writer = File::from_std(destination.reopen()?);
        tokio::io::copy(&mut file, &mut writer).await?;
        writer.sync_all().await?;
        Ok(())
    }
}

impl Downloader for FilesystemDownloader {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a mut NamedTempFile,
    ) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(self.download(url, destination))
    }
}
