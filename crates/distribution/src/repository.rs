//! The capabilities a remote repository offers to the image puller.
//!
//! These traits are the seam between the pull engine and the transport: the
//! [`Client`](crate::Client) implements them over HTTP, tests implement them
//! in memory.
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::digest::Digest;
use crate::errors::RegistryError;
use crate::manifest::{Descriptor, Manifest};
use crate::reference::Reference;

/// A readable blob body.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// A blob body opened at some offset.
pub struct BlobStream {
    /// The size of the whole blob, when the registry reports it.
    pub total_size: Option<u64>,
    /// The bytes of the blob, starting at the requested offset.
    pub reader: BlobReader,
}

/// Something that can open repositories by name.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Opens the repository the reference names, negotiating access to it.
    async fn repository(&self, name: &Reference) -> Result<Arc<dyn Repository>, RegistryError>;
}

/// A named repository on a registry.
#[async_trait]
pub trait Repository: Send + Sync {
    /// The name of the repository, without tag or digest.
    fn named(&self) -> &Reference;

    /// The manifest service for this repository.
    async fn manifests(&self) -> Result<Arc<dyn ManifestService>, RegistryError>;

    /// The blob service for this repository.
    fn blobs(&self) -> Arc<dyn BlobService>;

    /// The tag service for this repository.
    fn tags(&self) -> Arc<dyn TagService>;
}

/// Fetches manifests.
#[async_trait]
pub trait ManifestService: Send + Sync {
    /// Fetches the manifest with the given digest.
    async fn get(&self, digest: &Digest) -> Result<Manifest, RegistryError>;

    /// Fetches the manifest a tag currently points at.
    async fn get_by_tag(&self, tag: &str) -> Result<Manifest, RegistryError>;
}

/// Fetches blobs.
#[async_trait]
pub trait BlobService: Send + Sync {
    /// Fetches a whole blob into memory.
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError>;

    /// Opens a blob for streaming, starting `offset` bytes in.
    ///
    /// Implementations that cannot honor a non-zero offset return
    /// [`RegistryError::RangeNotSupported`].
    async fn open(&self, digest: &Digest, offset: u64) -> Result<BlobStream, RegistryError>;
}

/// Resolves and lists tags.
#[async_trait]
pub trait TagService: Send + Sync {
    /// Resolves a tag to the descriptor of the manifest it points at.
    async fn get(&self, tag: &str) -> Result<Descriptor, RegistryError>;

    /// Lists every tag in the repository.
    async fn all(&self) -> Result<Vec<String>, RegistryError>;
}
