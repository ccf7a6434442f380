//! Downloading layers and assembling them into a root filesystem.
//!
//! The puller hands a [`DownloadManager`] one [`DownloadDescriptor`] per
//! layer, base layer first, and gets back the root filesystem those layers
//! make up together with a [`Release`] handle that keeps the layers alive.
pub mod local;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use distribution::Digest;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

use crate::error::PullError;
use crate::image::RootFs;
use crate::progress::ProgressOutput;

#[doc(inline)]
pub use local::LocalDownloadManager;

/// One layer to download.
#[async_trait]
pub trait DownloadDescriptor: Send + Sync {
    /// Identifies the content, so that concurrent pulls of the same layer
    /// can be told apart from different layers.
    fn key(&self) -> String;

    /// The short ID shown in progress output.
    fn id(&self) -> String;

    /// The diff-ID of the layer, when it is known without downloading it.
    async fn diff_id(&self) -> Option<Digest>;

    /// Downloads and verifies the layer.
    ///
    /// A failed call may be retried on the same descriptor, which resumes
    /// where the previous attempt stopped when it can.
    async fn download(
        &mut self,
        cancel: &CancellationToken,
        progress: &dyn ProgressOutput,
    ) -> Result<LayerBlob, PullError>;

    /// Called once the layer is registered under `diff_id`.
    async fn registered(&self, diff_id: &Digest);
}

/// Assembles layers into a root filesystem.
#[async_trait]
pub trait DownloadManager: Send + Sync {
    /// Downloads `layers` on top of `initial`, returning the resulting root
    /// filesystem.
    ///
    /// The layers stay referenced until the returned [`Release`] runs.
    async fn download(
        &self,
        cancel: CancellationToken,
        initial: RootFs,
        layers: Vec<Box<dyn DownloadDescriptor>>,
        progress: Arc<dyn ProgressOutput>,
    ) -> Result<(RootFs, Release), PullError>;
}

/// Runs a cleanup exactly once, either when [`Release::release`] is called or
/// when the handle is dropped.
pub struct Release {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Release {
    /// Wraps a cleanup.
    pub fn new<F: FnOnce() + Send + 'static>(cleanup: F) -> Self {
        Release {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// A handle with nothing to clean up.
    pub fn noop() -> Self {
        Release { cleanup: None }
    }

    /// Runs the cleanup now.
    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release")
            .field("pending", &self.cleanup.is_some())
            .finish()
    }
}

/// A downloaded and verified layer blob, rewound to its start.
///
/// The file backing it is deleted when the blob is dropped.
#[derive(Debug)]
pub struct LayerBlob {
    file: tokio::fs::File,
    path: TempPath,
    size: u64,
}

impl LayerBlob {
    /// Wraps an open temporary file holding `size` bytes.
    pub fn new(file: tokio::fs::File, path: TempPath, size: u64) -> Self {
        LayerBlob { file, path, size }
    }

    /// The size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Where the blob lives until it is dropped.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Converts the blob into a blocking file, for readers that are not
    /// async. The file is deleted when the returned path is dropped.
    pub async fn into_std(self) -> (std::fs::File, TempPath) {
        (self.file.into_std().await, self.path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn release_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let release = Release::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        release.release();
        assert_eq!(1, count.load(Ordering::SeqCst));

        let c = count.clone();
        drop(Release::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(2, count.load(Ordering::SeqCst));
        drop(Release::noop());
    }

    #[tokio::test]
    async fn layer_blobs_delete_their_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let (file, path) = tmp.into_parts();
        let blob = LayerBlob::new(tokio::fs::File::from_std(file), path, 0);
        let on_disk = blob.path().to_path_buf();
        assert!(on_disk.exists());
        drop(blob);
        assert!(!on_disk.exists());
    }
}
