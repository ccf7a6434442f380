//! Resumable download of a single layer blob.
use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use distribution::repository::{BlobService, BlobStream};
use distribution::{Digest, RegistryError, Verifier};
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::download::{DownloadDescriptor, LayerBlob};
use crate::error::{retry_on_error, PullError};
use crate::progress::{self, ProgressOutput};
use crate::store::MetadataStore;

const TEMP_FILE_PREFIX: &str = "GetImageBlob";
const CHUNK_SIZE: usize = 32 * 1024;
// Transfer progress is reported at most once per this many bytes.
const PROGRESS_INTERVAL: u64 = 512 * 1024;

/// Downloads one layer blob into a temporary file, verifying it against its
/// digest as it streams in.
///
/// The partially downloaded file survives a failed attempt, so that the
/// next call to `download` resumes from where the last one stopped.
pub struct LayerDescriptor {
    digest: Digest,
    source_repository: String,
    blobs: Arc<dyn BlobService>,
    metadata: Option<Arc<dyn MetadataStore>>,
    tmp: Option<(tokio::fs::File, TempPath)>,
    verifier: Verifier,
}

impl LayerDescriptor {
    /// Creates a descriptor for the blob `digest` of `source_repository`.
    pub fn new(
        digest: Digest,
        source_repository: String,
        blobs: Arc<dyn BlobService>,
        metadata: Option<Arc<dyn MetadataStore>>,
    ) -> Self {
        let verifier = digest.verifier();
        LayerDescriptor {
            digest,
            source_repository,
            blobs,
            metadata,
            tmp: None,
            verifier,
        }
    }

    // Throws away everything downloaded so far.
    async fn truncate(&mut self) -> Result<(), PullError> {
        self.verifier = self.digest.verifier();
        if let Some((file, _)) = self.tmp.as_mut() {
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.tmp = None;
        self.verifier = self.digest.verifier();
    }

    async fn open(&self, offset: u64) -> Result<BlobStream, RegistryError> {
        self.blobs.open(&self.digest, offset).await
    }

    async fn open_stream(&mut self, offset: u64) -> Result<(BlobStream, u64), PullError> {
        let mut offset = offset;
        let stream = match self.open(offset).await {
            Ok(stream) => stream,
            Err(RegistryError::RangeNotSupported(_)) if offset > 0 => {
                debug!(digest = %self.digest, "Registry ignored the range request, restarting download");
                self.truncate().await.map_err(PullError::do_not_retry)?;
                offset = 0;
                self.open(0)
                    .await
                    .map_err(|e| retry_on_error(PullError::Registry(e)))?
            }
            Err(e) => {
                error!(error = %e, "Error initiating layer download");
                return Err(retry_on_error(PullError::Registry(e)));
            }
        };

        match stream.total_size {
            Some(total) if total != 0 && offset > total => {
                debug!("Partial download is larger than full blob. Starting over");
                self.truncate().await.map_err(PullError::do_not_retry)?;
                let stream = self
                    .open(0)
                    .await
                    .map_err(|e| retry_on_error(PullError::Registry(e)))?;
                Ok((stream, 0))
            }
            _ => Ok((stream, offset)),
        }
    }
}

#[async_trait]
impl DownloadDescriptor for LayerDescriptor {
    fn key(&self) -> String {
        format!("v2:{}", self.digest)
    }

    fn id(&self) -> String {
        self.digest.short_id().to_owned()
    }

    async fn diff_id(&self) -> Option<Digest> {
        let metadata = self.metadata.as_ref()?;
        match metadata.get_diff_id(&self.digest).await {
            Ok(diff_id) => diff_id,
            Err(e) => {
                debug!(error = %e, digest = %self.digest, "Unable to look up diff-ID");
                None
            }
        }
    }

    async fn download(
        &mut self,
        cancel: &CancellationToken,
        out: &dyn ProgressOutput,
    ) -> Result<LayerBlob, PullError> {
        debug!(digest = %self.digest, "Pulling blob");
        let id = self.id();

        let offset = match self.tmp.as_mut() {
            None => {
                let tmp = tempfile::Builder::new()
                    .prefix(TEMP_FILE_PREFIX)
                    .tempfile()
                    .map_err(|e| PullError::Io(e).do_not_retry())?;
                let (file, path) = tmp.into_parts();
                self.tmp = Some((tokio::fs::File::from_std(file), path));
                self.verifier = self.digest.verifier();
                0
            }
            Some((file, _)) => match file.seek(SeekFrom::End(0)).await {
                Ok(offset) => {
                    if offset != 0 {
                        debug!(digest = %self.digest, offset, "Attempting to resume download");
                    }
                    offset
                }
                Err(e) => {
                    debug!(error = %e, "Error seeking to end of download file");
                    self.discard();
                    return Err(PullError::Io(e));
                }
            },
        };

        let (stream, offset) = self.open_stream(offset).await?;
        let total = stream.total_size;
        let mut reader = stream.reader;
        let mut current = offset;
        let mut reported = offset;
        let mut buf = vec![0u8; CHUNK_SIZE];
        progress::bytes(out, &id, "Downloading", current, total);

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.discard();
                    return Err(PullError::Cancelled);
                }
                read = reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Err(retry_on_error(PullError::Io(e))),
            };
            let (file, _) = match self.tmp.as_mut() {
                Some(tmp) => tmp,
                None => return Err(PullError::Cancelled),
            };
            file.write_all(&buf[..n])
                .await
                .map_err(|e| retry_on_error(PullError::Io(e)))?;
            self.verifier.update(&buf[..n]);
            current += n as u64;
            if current - reported >= PROGRESS_INTERVAL {
                progress::bytes(out, &id, "Downloading", current, total);
                reported = current;
            }
        }

        progress::update(out, &id, "Verifying Checksum");

        if !self.verifier.verified() {
            let err = PullError::LayerVerification(self.digest.clone());
            error!(error = %err, offset, "Layer verification failed");
            // A resumed download may have been corrupted by what was kept
            // from an earlier attempt; start over.
            if offset != 0 {
                self.truncate().await.map_err(PullError::do_not_retry)?;
                return Err(err);
            }
            self.discard();
            return Err(err.do_not_retry());
        }

        progress::update(out, &id, "Download complete");

        let (mut file, path) = match self.tmp.take() {
            Some(tmp) => tmp,
            None => return Err(PullError::Cancelled),
        };
        self.verifier = self.digest.verifier();
        file.flush().await?;
        if let Err(e) = file.seek(SeekFrom::Start(0)).await {
            return Err(PullError::Io(e).do_not_retry());
        }
        debug!(layer = %id, path = %path.display(), "Downloaded layer to temporary file");
        Ok(LayerBlob::new(file, path, current))
    }

    async fn registered(&self, diff_id: &Digest) {
        if let Some(metadata) = &self.metadata {
            if let Err(e) = metadata
                .add(diff_id, &self.digest, &self.source_repository)
                .await
            {
                error!(error = %e, digest = %self.digest, %diff_id, "Failed to record layer metadata");
            }
        }
    }
}
