//! Error types of the resource engine.
//!
//! Load failures ([`LoadError`]) are local to the failing job and only ever reach the callbacks
//! waiting on it. Reference counting violations ([`ResourceError`]) are returned synchronously to
//! whoever misused the [`Resource`](crate::engine::Resource).

use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error produced by a [`Decoder`](crate::decode::Decoder).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The source was read successfully, but is not a valid animation.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The source is a valid file of a format the decoder does not understand.
    #[error("unsupported format: {0}")]
    Unsupported(String),
    /// The source could not be read.
    #[error("failed to read source: {0}")]
    Io(String),
}

impl From<io::Error> for DecodeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// An error produced by a [`Downloader`](crate::download::Downloader).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The artifact does not exist at the remote location.
    #[error("not found")]
    NotFound,
    /// The remote location refused access.
    ///
    /// The attached string contains the remote's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The download did not finish in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// Any other transport problem, like connection loss or a 5xx response.
    #[error("download failed: {0}")]
    DownloadError(String),
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            io::ErrorKind::TimedOut => Self::Timeout(Duration::ZERO),
            _ => Self::DownloadError(err.to_string()),
        }
    }
}

/// The reason a load did not produce a resource.
///
/// This is handed to every callback waiting on the failed job, hence it is [`Clone`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Decoding the source failed.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    /// Downloading the source failed.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    /// No decoder can handle the requested source.
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
    /// The resource was destroyed before it could be handed out.
    #[error("resource was recycled before delivery")]
    Recycled,
    /// The engine was shut down before the load finished.
    #[error("engine has been shut down")]
    ShutDown,
    /// An unexpected failure inside animload itself, such as a panicking decoder.
    #[error("internal error")]
    InternalError,
}

/// A violation of the [`Resource`](crate::engine::Resource) reference counting contract.
///
/// These always indicate a bug in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The resource was already recycled.
    #[error("resource has been recycled")]
    Recycled,
    /// `release` was called more often than `acquire`.
    #[error("resource released more often than acquired")]
    NegativeReference,
    /// `recycle` was called on an already recycled resource.
    #[error("resource has already been recycled")]
    AlreadyRecycled,
    /// `recycle` was called while the resource is still referenced.
    #[error("cannot recycle a resource that is still acquired ({0} references)")]
    StillAcquired(usize),
}

/// An invalid transition requested on a job.
///
/// These are logged and otherwise ignored, so a single misbehaving caller cannot take down
/// unrelated work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobStateError {
    /// `start` was called a second time.
    #[error("job was already started")]
    AlreadyStarted,
    /// The job already reached a terminal state.
    #[error("job is already {0}")]
    Terminal(&'static str),
}

/// An invalid use of the [`AnimationContext`](crate::context::AnimationContext) lifecycle.
#[derive(Debug, Error)]
pub enum ContextError {
    /// `init` was called on a context that is already running.
    #[error("animload is already initialized")]
    AlreadyInitialized,
    /// The context was used before `init`.
    #[error("animload is not initialized")]
    NotInitialized,
    /// The context was used after `teardown`.
    #[error("animload has been torn down")]
    TornDown,
    /// Creating the services failed.
    #[error("failed to initialize animload: {0:#}")]
    Setup(anyhow::Error),
}
