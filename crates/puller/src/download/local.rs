//! A download manager that keeps layers as plain files on local disk.
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use distribution::digest::{Algorithm, Digester};
use distribution::Digest;
use flate2::read::GzDecoder;
use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::{DownloadDescriptor, DownloadManager, LayerBlob, Release};
use crate::backoff::BackoffStrategy;
use crate::config::RetryPolicy;
use crate::error::PullError;
use crate::image::RootFs;
use crate::progress::{self, ProgressOutput};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Downloads layers concurrently and stores their uncompressed content
/// under `<root>/layers/<algorithm>/<hex>`, named by diff-ID.
///
/// Layers already on disk whose diff-ID is known up front are not downloaded
/// again.
pub struct LocalDownloadManager {
    root_dir: PathBuf,
    limit: Arc<Semaphore>,
    retry: RetryPolicy,
    in_use: Arc<Mutex<HashMap<Digest, usize>>>,
}

impl LocalDownloadManager {
    /// Create a new `LocalDownloadManager` downloading at most
    /// `max_concurrent` layers at once.
    pub fn new<T: AsRef<Path>>(root_dir: T, max_concurrent: usize, retry: RetryPolicy) -> Self {
        Self {
            root_dir: root_dir.as_ref().into(),
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry,
            in_use: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Where the content of a layer is stored.
    pub fn layer_path(&self, diff_id: &Digest) -> PathBuf {
        self.root_dir
            .join("layers")
            .join(diff_id.algorithm().name())
            .join(diff_id.hex())
    }

    /// How many unreleased downloads hold a layer.
    pub fn in_use(&self, diff_id: &Digest) -> usize {
        self.in_use
            .lock()
            .map(|m| m.get(diff_id).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        descriptor: &mut Box<dyn DownloadDescriptor>,
        out: &dyn ProgressOutput,
    ) -> Result<Digest, PullError> {
        let id = descriptor.id();

        if let Some(diff_id) = descriptor.diff_id().await {
            if tokio::fs::metadata(self.layer_path(&diff_id)).await.is_ok() {
                progress::update(out, &id, "Already exists");
                return Ok(diff_id);
            }
        }

        progress::update(out, &id, "Pulling fs layer");
        let _permit = match self.limit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                progress::update(out, &id, "Waiting");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PullError::Cancelled),
                    permit = self.limit.clone().acquire_owned() => permit
                        .map_err(|e| PullError::Store(anyhow::anyhow!(e)))?,
                }
            }
        };

        let blob = self.download_with_retries(cancel, descriptor, out).await?;

        progress::update(out, &id, "Extracting");
        let diff_id = self.extract(blob).await?;
        if cancel.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        progress::update(out, &id, "Pull complete");
        descriptor.registered(&diff_id).await;
        Ok(diff_id)
    }

    async fn download_with_retries(
        &self,
        cancel: &CancellationToken,
        descriptor: &mut Box<dyn DownloadDescriptor>,
        out: &dyn ProgressOutput,
    ) -> Result<LayerBlob, PullError> {
        let id = descriptor.id();
        let mut backoff = self.retry.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match descriptor.download(cancel, out).await {
                Ok(blob) => return Ok(blob),
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                return Err(PullError::Cancelled);
            }
            if !err.is_retryable() || attempt >= self.retry.attempts {
                error!(error = %err, attempt, layer = %id, "Download failed");
                return Err(err);
            }
            info!(error = %err, attempt, max = self.retry.attempts, layer = %id, "Download failed, retrying");
            let wait = backoff.next_duration();
            let seconds = whole_seconds(wait);
            progress::update(
                out,
                &id,
                &format!(
                    "Retrying in {} second{}",
                    seconds,
                    if seconds == 1 { "" } else { "s" }
                ),
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(PullError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    // Decompresses the blob if needed, hashing the result into the diff-ID,
    // and moves it into place.
    async fn extract(&self, blob: LayerBlob) -> Result<Digest, PullError> {
        let (file, blob_path) = blob.into_std().await;
        let layers_dir = self
            .root_dir
            .join("layers")
            .join(Algorithm::Sha256.name());
        let diff_id = tokio::task::spawn_blocking(move || -> io::Result<Digest> {
            std::fs::create_dir_all(&layers_dir)?;
            let mut reader = io::BufReader::new(file);
            let mut magic = [0u8; 2];
            let n = read_prefix(&mut reader, &mut magic)?;
            let prefix = io::Cursor::new(magic[..n].to_vec());
            let mut content = prefix.chain(reader);

            let mut tmp = tempfile::NamedTempFile::new_in(&layers_dir)?;
            let mut digester = Digester::new(Algorithm::Sha256);
            {
                let mut sink = Tee {
                    file: tmp.as_file_mut(),
                    digester: &mut digester,
                };
                if magic[..n] == GZIP_MAGIC {
                    io::copy(&mut GzDecoder::new(content), &mut sink)?;
                } else {
                    io::copy(&mut content, &mut sink)?;
                }
            }
            let diff_id = digester.finish();
            let target = layers_dir.join(diff_id.hex());
            if target.exists() {
                debug!(%diff_id, "Layer already stored");
            } else {
                tmp.persist(&target).map_err(|e| e.error)?;
            }
            drop(blob_path);
            Ok(diff_id)
        })
        .await
        .map_err(|e| PullError::Store(e.into()))??;
        Ok(diff_id)
    }
}

fn whole_seconds(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}

// Reads up to buf.len() bytes, stopping early only at the end of input.
fn read_prefix<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

struct Tee<'a> {
    file: &'a mut std::fs::File,
    digester: &'a mut Digester,
}

impl Write for Tee<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[async_trait]
impl DownloadManager for LocalDownloadManager {
    #[instrument(level = "info", skip(self, cancel, initial, layers, out), fields(layers = layers.len()))]
    async fn download(
        &self,
        cancel: CancellationToken,
        initial: RootFs,
        mut layers: Vec<Box<dyn DownloadDescriptor>>,
        out: Arc<dyn ProgressOutput>,
    ) -> Result<(RootFs, Release), PullError> {
        let diff_ids = try_join_all(
            layers
                .iter_mut()
                .map(|descriptor| self.fetch(&cancel, descriptor, out.as_ref())),
        )
        .await?;

        let mut rootfs = initial;
        {
            let mut in_use = self
                .in_use
                .lock()
                .map_err(|_| PullError::Store(anyhow::anyhow!("layer reference counts poisoned")))?;
            for diff_id in &diff_ids {
                *in_use.entry(diff_id.clone()).or_default() += 1;
                rootfs.append(diff_id.clone());
            }
        }

        let in_use = self.in_use.clone();
        let release = Release::new(move || {
            if let Ok(mut in_use) = in_use.lock() {
                for diff_id in diff_ids {
                    if let Some(count) = in_use.get_mut(&diff_id) {
                        *count -= 1;
                        if *count == 0 {
                            in_use.remove(&diff_id);
                        }
                    }
                }
            }
        });
        Ok((rootfs, release))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::{ChannelOutput, Progress};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Serves fixed content, failing the first `failures` attempts.
    struct FakeLayer {
        content: Vec<u8>,
        failures: usize,
        attempts: Arc<AtomicUsize>,
        known_diff_id: Option<Digest>,
        registered: Arc<Mutex<Vec<Digest>>>,
        fatal: bool,
    }

    impl FakeLayer {
        fn new(content: &[u8]) -> Self {
            FakeLayer {
                content: content.to_vec(),
                failures: 0,
                attempts: Arc::new(AtomicUsize::new(0)),
                known_diff_id: None,
                registered: Arc::new(Mutex::new(Vec::new())),
                fatal: false,
            }
        }
    }

    #[async_trait]
    impl DownloadDescriptor for FakeLayer {
        fn key(&self) -> String {
            format!("v2:{}", Digest::from_bytes(&self.content))
        }

        fn id(&self) -> String {
            Digest::from_bytes(&self.content).short_id().to_owned()
        }

        async fn diff_id(&self) -> Option<Digest> {
            self.known_diff_id.clone()
        }

        async fn download(
            &mut self,
            _cancel: &CancellationToken,
            _progress: &dyn ProgressOutput,
        ) -> Result<LayerBlob, PullError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                let err = PullError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
                return Err(if self.fatal { err.do_not_retry() } else { err });
            }
            let mut tmp = tempfile::NamedTempFile::new().unwrap();
            tmp.write_all(&self.content).unwrap();
            let (mut file, path) = tmp.into_parts();
            std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(0)).unwrap();
            Ok(LayerBlob::new(
                tokio::fs::File::from_std(file),
                path,
                self.content.len() as u64,
            ))
        }

        async fn registered(&self, diff_id: &Digest) {
            self.registered.lock().unwrap().push(diff_id.clone());
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Progress>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p.to_string());
        }
        seen
    }

    #[tokio::test]
    async fn diff_ids_hash_uncompressed_content_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalDownloadManager::new(dir.path(), 2, quick_retry());
        let base = FakeLayer::new(&gzip(b"base layer"));
        let top = FakeLayer::new(b"plain top layer");
        let registered = base.registered.clone();
        let (out, mut rx) = ChannelOutput::new();

        let (rootfs, release) = manager
            .download(
                CancellationToken::new(),
                RootFs::default(),
                vec![Box::new(base), Box::new(top)],
                Arc::new(out),
            )
            .await
            .expect("download succeeds");

        let base_id = Digest::from_bytes(b"base layer");
        let top_id = Digest::from_bytes(b"plain top layer");
        assert_eq!(vec![base_id.clone(), top_id.clone()], rootfs.diff_ids);
        assert_eq!(vec![base_id.clone()], *registered.lock().unwrap());
        assert_eq!(
            b"base layer".to_vec(),
            std::fs::read(manager.layer_path(&base_id)).unwrap()
        );
        assert_eq!(1, manager.in_use(&top_id));
        release.release();
        assert_eq!(0, manager.in_use(&top_id));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.ends_with("Extracting")));
        assert!(events.iter().any(|e| e.ends_with("Pull complete")));
    }

    #[tokio::test]
    async fn cached_layers_are_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalDownloadManager::new(dir.path(), 1, quick_retry());
        let first = FakeLayer::new(b"layer");
        manager
            .download(
                CancellationToken::new(),
                RootFs::default(),
                vec![Box::new(first)],
                Arc::new(progress::Discard),
            )
            .await
            .unwrap();

        let mut again = FakeLayer::new(b"layer");
        again.known_diff_id = Some(Digest::from_bytes(b"layer"));
        let attempts = again.attempts.clone();
        let (out, mut rx) = ChannelOutput::new();
        let (rootfs, _release) = manager
            .download(
                CancellationToken::new(),
                RootFs::default(),
                vec![Box::new(again)],
                Arc::new(out),
            )
            .await
            .unwrap();
        assert_eq!(vec![Digest::from_bytes(b"layer")], rootfs.diff_ids);
        assert_eq!(0, attempts.load(Ordering::SeqCst));
        assert!(drain(&mut rx).iter().any(|e| e.ends_with("Already exists")));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalDownloadManager::new(dir.path(), 1, quick_retry());
        let mut layer = FakeLayer::new(b"flaky");
        layer.failures = 2;
        let attempts = layer.attempts.clone();
        let (out, mut rx) = ChannelOutput::new();
        manager
            .download(
                CancellationToken::new(),
                RootFs::default(),
                vec![Box::new(layer)],
                Arc::new(out),
            )
            .await
            .expect("third attempt succeeds");
        assert_eq!(3, attempts.load(Ordering::SeqCst));
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.ends_with("Retrying in 1 second")));
    }

    #[tokio::test]
    async fn do_not_retry_failures_stop_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalDownloadManager::new(dir.path(), 1, quick_retry());
        let mut layer = FakeLayer::new(b"broken");
        layer.failures = 5;
        layer.fatal = true;
        let attempts = layer.attempts.clone();
        let result = manager
            .download(
                CancellationToken::new(),
                RootFs::default(),
                vec![Box::new(layer)],
                Arc::new(progress::Discard),
            )
            .await;
        assert!(matches!(result, Err(PullError::DoNotRetry(_))));
        assert_eq!(1, attempts.load(Ordering::SeqCst));
    }

    #[test]
    fn retry_waits_round_up_to_whole_seconds() {
        assert_eq!(1, whole_seconds(Duration::from_millis(1)));
        assert_eq!(1, whole_seconds(Duration::from_secs(1)));
        assert_eq!(3, whole_seconds(Duration::from_millis(2500)));
    }
}
