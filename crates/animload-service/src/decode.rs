//! Turning raw animation sources into payloads.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;

use crate::error::DecodeError;
use crate::types::{Animation, AnimationKind, Model};

/// The raw input handed to a [`Decoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceData {
    /// A file on the local file system, possibly a downloaded or cached artifact.
    File(PathBuf),
    /// Data already in memory.
    Bytes(Bytes),
    /// A named asset packaged with the application.
    Asset(String),
}

impl fmt::Display for SourceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Asset(name) => write!(f, "asset:{name}"),
        }
    }
}

/// Decodes sources into payloads of type `T`.
///
/// [`decode`](Self::decode) runs on a blocking worker thread and may take a long time.
/// [`handles`](Self::handles) on the other hand is called before any I/O happens and must be
/// cheap.
pub trait Decoder<T>: Send + Sync + 'static {
    /// Whether this decoder is able to decode the given model at all.
    fn handles(&self, model: &Model) -> bool;

    /// Decodes the given source.
    fn decode(&self, source: SourceData) -> Result<T, DecodeError>;
}

/// The [`Decoder`] of all supported [`Animation`] formats.
///
/// The format is detected from the contents. File extensions are only used to refuse sources
/// that are clearly not animations.
#[derive(Debug, Clone, Default)]
pub struct AnimationDecoder {
    asset_dir: Option<PathBuf>,
}

impl AnimationDecoder {
    pub fn new(asset_dir: Option<PathBuf>) -> Self {
        Self { asset_dir }
    }

    /// Resolves an asset name inside the asset directory.
    ///
    /// Names are relative paths and may not escape the asset directory.
    fn asset_path(&self, name: &str) -> Result<PathBuf, DecodeError> {
        let asset_dir = self
            .asset_dir
            .as_deref()
            .ok_or_else(|| DecodeError::Io("no asset directory configured".into()))?;

        let relative = Path::new(name);
        let is_safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !is_safe {
            return Err(DecodeError::Io(format!("invalid asset name `{name}`")));
        }

        Ok(asset_dir.join(relative))
    }
}

impl Decoder<Animation> for AnimationDecoder {
    fn handles(&self, model: &Model) -> bool {
        if matches!(model, Model::Asset(_)) && self.asset_dir.is_none() {
            return false;
        }
        match model.extension() {
            Some(ext) => AnimationKind::from_extension(&ext).is_some(),
            // without an extension, only the contents can tell
            None => true,
        }
    }

    fn decode(&self, source: SourceData) -> Result<Animation, DecodeError> {
        let data = match source {
            SourceData::Bytes(bytes) => bytes,
            SourceData::File(path) => Bytes::from(std::fs::read(path)?),
            SourceData::Asset(name) => Bytes::from(std::fs::read(self.asset_path(&name)?)?),
        };
        if data.is_empty() {
            return Err(DecodeError::Malformed("empty source".into()));
        }
        Animation::probe(data)
    }
}
