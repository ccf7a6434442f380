//! An engine for pulling container images from a registry speaking the v2
//! distribution protocol into local stores.
//!
//! The crate provides the [`Puller`] type, which resolves a reference to a
//! manifest, downloads the image configuration and layers it names, and
//! records the result under the reference. Where images, references, layers
//! and manifests end up is decided by the stores handed to it through an
//! [`ImagePullConfig`]; the [`store`] and [`download`] modules provide
//! implementations backed by the local filesystem.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use distribution::client::{Client, ClientConfig};
//! use distribution::secrets::RegistryAuth;
//! use puller::download::LocalDownloadManager;
//! use puller::error::DefaultFallbackPolicy;
//! use puller::progress::Discard;
//! use puller::store::fs::{FileImageStore, FileReferenceStore};
//! use puller::{Config, ImagePullConfig, Puller};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default_config()?;
//!     let root = config.data_dir.clone();
//!     let downloads = LocalDownloadManager::new(
//!         &root,
//!         config.max_concurrent_downloads,
//!         config.download_retry.clone(),
//!     );
//!     let pull_config = ImagePullConfig {
//!         image_store: Arc::new(FileImageStore::new(&root)),
//!         reference_store: Arc::new(FileReferenceStore::open(&root).await?),
//!         download_manager: Arc::new(downloads),
//!         metadata_store: None,
//!         content_store: None,
//!         progress: Arc::new(Discard),
//!         fallback_policy: Arc::new(DefaultFallbackPolicy::default()),
//!         config,
//!     };
//!
//!     let client = Client::new(ClientConfig::default(), RegistryAuth::Anonymous)?;
//!     let puller = Puller::new(Arc::new(client), pull_config);
//!     let reference = "docker.io/library/busybox:latest".parse()?;
//!     puller.pull(&CancellationToken::new(), &reference).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod backoff;
pub mod config;
pub mod download;
pub mod error;
pub mod image;
pub mod layer;
pub mod manifest_store;
pub mod platform;
pub mod progress;
mod puller;
pub mod store;

#[doc(inline)]
pub use config::{Config, ImagePullConfig};
#[doc(inline)]
pub use error::PullError;
pub use self::puller::Puller;
