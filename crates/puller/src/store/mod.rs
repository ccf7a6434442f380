//! `store` contains the local stores a pull commits its results to.
//!
//! The puller only depends on the traits defined here. File backed
//! implementations of the image and reference stores live in [`fs`], and
//! in-memory caches in [`memory`]. Blob to diff-ID mappings have both.
pub mod fs;
pub mod memory;

use async_trait::async_trait;
use distribution::{Digest, Reference};

/// Stores image configurations by their content digest.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Stores a configuration, returning its content digest, which is the
    /// image ID. Storing the same configuration twice is a no-op.
    async fn put(&self, config: &[u8]) -> anyhow::Result<Digest>;

    /// Fetches a configuration, `None` when it is not stored.
    async fn get(&self, id: &Digest) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Maps tags and digests to image IDs.
///
/// Each call is atomic: when it fails the store is left as it was.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// The image ID a reference points at, `None` when it does not exist.
    async fn get(&self, reference: &Reference) -> anyhow::Result<Option<Digest>>;

    /// Associates a digest reference with an image ID.
    async fn add_digest(&self, reference: &Reference, id: &Digest, force: bool)
        -> anyhow::Result<()>;

    /// Associates a tagged reference with an image ID.
    async fn add_tag(&self, reference: &Reference, id: &Digest, force: bool) -> anyhow::Result<()>;

    /// Removes a reference, returning whether it existed.
    async fn delete(&self, reference: &Reference) -> anyhow::Result<bool>;
}

/// A local cache of manifests, keyed by manifest digest.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// The media type and payload of a cached manifest.
    async fn get(&self, digest: &Digest) -> anyhow::Result<Option<(String, Vec<u8>)>>;

    /// Caches a manifest payload.
    async fn put(&self, digest: &Digest, media_type: &str, payload: &[u8]) -> anyhow::Result<()>;
}

/// Remembers which diff-ID a blob decompresses to.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// The diff-ID of a blob, if known.
    async fn get_diff_id(&self, blob: &Digest) -> anyhow::Result<Option<Digest>>;

    /// Records that `blob`, pulled from `source_repository`, decompresses
    /// to `diff_id`.
    async fn add(&self, diff_id: &Digest, blob: &Digest, source_repository: &str)
        -> anyhow::Result<()>;
}
