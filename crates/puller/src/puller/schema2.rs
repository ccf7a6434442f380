//! Pulling schema2 and OCI images.
//!
//! The image configuration and the layers are fetched concurrently. Once the
//! configuration arrives the layers it declares are checked against what
//! was downloaded before the image is committed.
use std::sync::Arc;

use distribution::manifest::{Descriptor, ImageManifest};
use distribution::repository::BlobService;
use distribution::{Digest, Reference};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{manifest_digest, PullSession};
use crate::backoff;
use crate::config::RetryPolicy;
use crate::download::DownloadDescriptor;
use crate::error::{retry_on_error, PullError};
use crate::image::{rootfs_from_config, RootFs};

impl PullSession<'_> {
    /// Pulls a schema2 or OCI image, returning its image ID and manifest
    /// digest.
    pub(super) async fn pull_schema2(
        &self,
        reference: &Reference,
        manifest: &ImageManifest,
        payload: &[u8],
    ) -> Result<(Digest, Digest), PullError> {
        let manifest_digest = manifest_digest(reference, payload)?;
        let id = self
            .pull_schema2_layers(&manifest.config, &manifest.layers)
            .await?;
        Ok((id, manifest_digest))
    }

    async fn pull_schema2_layers(
        &self,
        target: &Descriptor,
        layers: &[Descriptor],
    ) -> Result<Digest, PullError> {
        let config_digest = content_digest(target)?;
        if let Ok(Some(_)) = self.config.image_store.get(&config_digest).await {
            debug!(image = %config_digest, "Image already exists");
            return Ok(config_digest);
        }

        let descriptors = layers
            .iter()
            .map(|layer| Ok(self.layer_descriptor(content_digest(layer)?)))
            .collect::<Result<Vec<Box<dyn DownloadDescriptor>>, PullError>>()?;

        // Cancelling this token stops both halves of the pull but not the
        // rest of the session.
        let cancel = self.cancel.child_token();
        // Dropping the pull future mid-flight stops both tasks.
        let _guard = cancel.clone().drop_guard();

        let (config_tx, config_rx) = oneshot::channel();
        {
            let cancel = cancel.clone();
            let blobs = self.repo.blobs();
            let policy = self.config.config.config_retry.clone();
            let digest = config_digest.clone();
            tokio::spawn(async move {
                let result = pull_schema2_config(&cancel, &policy, blobs, &digest)
                    .await
                    .map_err(|e| match e {
                        PullError::Cancelled => e,
                        e => PullError::ImageConfigPull(Box::new(e)),
                    });
                if result.is_err() {
                    cancel.cancel();
                }
                let _ = config_tx.send(result);
            });
        }

        let (layers_tx, layers_rx) = oneshot::channel();
        {
            let cancel = cancel.clone();
            let manager = self.config.download_manager.clone();
            let progress = self.config.progress.clone();
            tokio::spawn(async move {
                let result = manager
                    .download(cancel, RootFs::default(), descriptors, progress)
                    .await;
                let _ = layers_tx.send(result);
            });
        }

        let config = config_rx
            .await
            .unwrap_or(Err(PullError::Cancelled))
            .and_then(|json| {
                let rootfs = rootfs_from_config(&json)?;
                Ok((json, rootfs))
            });
        let (config_json, config_rootfs) = match config {
            Ok(config) => config,
            Err(e) => {
                cancel.cancel();
                // Wait for the downloads to stop before reporting.
                let _ = layers_rx.await;
                return Err(e);
            }
        };

        let (rootfs, release) = layers_rx.await.unwrap_or(Err(PullError::Cancelled))?;

        if rootfs.diff_ids != config_rootfs.diff_ids {
            return Err(PullError::RootFsMismatch);
        }

        let id = self.config.image_store.put(&config_json).await?;
        release.release();
        Ok(id)
    }
}

fn content_digest(desc: &Descriptor) -> Result<Digest, PullError> {
    desc.content_digest()
        .map_err(|source| PullError::InvalidDigest {
            digest: desc.digest.clone(),
            source,
        })
}

/// Fetches the image configuration and checks it against its digest.
async fn pull_schema2_config(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    blobs: Arc<dyn BlobService>,
    digest: &Digest,
) -> Result<Vec<u8>, PullError> {
    let blobs = &blobs;
    backoff::retry(
        cancel,
        policy,
        || async move {
            let config = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PullError::Cancelled),
                config = blobs.get(digest) => config,
            };
            let config = config.map_err(|e| retry_on_error(PullError::Registry(e)))?;
            let mut verifier = digest.verifier();
            verifier.update(&config);
            if !verifier.verified() {
                let err = PullError::ConfigVerification(digest.clone());
                error!(error = %err, "Image config verification failed");
                return Err(err.do_not_retry());
            }
            Ok(config)
        },
        |err, wait| debug!(error = %err, ?wait, %digest, "Retrying image config pull"),
    )
    .await
    .map_err(|e| match e {
        PullError::DoNotRetry(inner) => *inner,
        e => e,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use distribution::repository::BlobStream;
    use distribution::RegistryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Blobs {
        config: Vec<u8>,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlobService for Blobs {
        async fn get(&self, _digest: &Digest) -> Result<Vec<u8>, RegistryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(RegistryError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                )));
            }
            Ok(self.config.clone())
        }

        async fn open(&self, digest: &Digest, _offset: u64) -> Result<BlobStream, RegistryError> {
            Err(RegistryError::NotFound(digest.to_string()))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn config_fetches_are_retried() {
        let config = br#"{"rootfs":{"type":"layers"}}"#.to_vec();
        let digest = Digest::from_bytes(&config);
        let blobs = Arc::new(Blobs {
            config: config.clone(),
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let fetched = pull_schema2_config(&CancellationToken::new(), &policy(), blobs.clone(), &digest)
            .await
            .expect("third attempt succeeds");
        assert_eq!(config, fetched);
        assert_eq!(3, blobs.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mismatched_configs_are_not_retried() {
        let blobs = Arc::new(Blobs {
            config: b"{}".to_vec(),
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let digest = Digest::from_bytes(b"the real config");
        let err = pull_schema2_config(&CancellationToken::new(), &policy(), blobs.clone(), &digest)
            .await
            .unwrap_err();
        assert!(matches!(err, PullError::ConfigVerification(ref d) if d == &digest));
        assert_eq!(1, blobs.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_config_fetches_stop() {
        let blobs = Arc::new(Blobs {
            config: b"{}".to_vec(),
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pull_schema2_config(&cancel, &policy(), blobs, &Digest::from_bytes(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, PullError::Cancelled));
    }
}
