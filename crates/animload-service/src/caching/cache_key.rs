use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::{CacheStrategy, Model};

/// The fingerprint of one load request.
///
/// Two keys are equal exactly when they were built from equal models and equal cache
/// strategies. Only the hash takes part in comparisons.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for loading `model` with the given [`CacheStrategy`].
    pub fn new(model: &Model, strategy: CacheStrategy) -> Self {
        let mut builder = CacheKeyBuilder::default();
        // writing into a `String` does not fail
        let _ = builder.write_model(model);
        let _ = writeln!(builder, "strategy: {strategy}");
        builder.build()
    }

    /// The human-readable description the key was hashed from.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Where the artifact for this key lives inside a disk cache, for the given cache version.
    ///
    /// The hash is split into `v{version}/aa/bbccdd/eeff…` to keep directories small.
    pub fn cache_path(&self, version: u32) -> String {
        let hash = &self.hash;
        format!(
            "v{version}/{}/{}/{}",
            hex::encode(&hash[..1]),
            hex::encode(&hash[1..4]),
            hex::encode(&hash[4..])
        )
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// Collects the description a [`CacheKey`] is hashed from.
///
/// Anything written into the builder becomes part of the key and of the `.metadata` file next
/// to cached artifacts. It must therefore be stable across releases, or cached artifacts are
/// no longer found.
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes the identity of `model` into the [`CacheKey`].
    ///
    /// In-memory data is identified by the hash of its contents, so that equal data maps to
    /// the same key no matter where it came from.
    pub fn write_model(&mut self, model: &Model) -> fmt::Result {
        match model {
            Model::Url(url) => write!(self, "model: url\nlocation: {url}\n"),
            Model::File(path) => write!(self, "model: file\nlocation: {}\n", path.display()),
            Model::Asset(name) => write!(self, "model: asset\nname: {name}\n"),
            Model::Bytes(bytes) => {
                let digest = Sha256::digest(bytes);
                write!(
                    self,
                    "model: bytes\nlength: {}\ncontent: {}\n",
                    bytes.len(),
                    hex::encode(digest)
                )
            }
        }
    }

    pub fn build(self) -> CacheKey {
        CacheKey {
            hash: Sha256::digest(&self.metadata).into(),
            metadata: self.metadata.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
