//! An in-memory registry and helpers for building images to serve from it.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use distribution::manifest::{
    Descriptor, Platform, IMAGE_DOCKER_CONFIG_MEDIA_TYPE, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE,
};
use distribution::repository::{
    BlobService, BlobStream, ManifestService, Registry, Repository, TagService,
};
use distribution::{Digest, Manifest, Reference, RegistryError};
use flate2::write::GzEncoder;
use flate2::Compression;
use puller::config::RetryPolicy;
use puller::download::LocalDownloadManager;
use puller::error::DefaultFallbackPolicy;
use puller::progress::{ChannelOutput, Progress};
use puller::store::fs::{FileImageStore, FileReferenceStore};
use puller::store::memory::MemoryMetadataStore;
use puller::store::{ImageStore, MetadataStore, ReferenceStore};
use puller::{Config, ImagePullConfig, Puller};
use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Default)]
struct State {
    manifests: HashMap<Digest, (String, Vec<u8>)>,
    tags: BTreeMap<String, Digest>,
    blobs: HashMap<Digest, Vec<u8>>,
    opens: Vec<(Digest, u64)>,
    // Blob digest -> bytes served before the connection drops, once.
    interrupt: HashMap<Digest, usize>,
    // Blobs whose streams never yield, with a flag raised when one is dropped.
    stalled: HashMap<Digest, Arc<AtomicBool>>,
}

/// A registry holding a single repository in memory.
#[derive(Clone)]
pub struct FakeRegistry {
    named: Reference,
    state: Arc<Mutex<State>>,
}

impl FakeRegistry {
    pub fn new(name: &str) -> Self {
        FakeRegistry {
            named: name.parse().expect("repository name"),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake registry state")
    }

    pub fn add_blob(&self, content: &[u8]) -> Digest {
        let digest = Digest::from_bytes(content);
        self.state().blobs.insert(digest.clone(), content.to_vec());
        digest
    }

    /// Serves `content` under a digest it does not hash to.
    pub fn add_corrupt_blob(&self, digest: &Digest, content: &[u8]) {
        self.state().blobs.insert(digest.clone(), content.to_vec());
    }

    pub fn add_manifest(&self, media_type: &str, payload: &[u8]) -> Digest {
        let digest = Digest::from_bytes(payload);
        self.state()
            .manifests
            .insert(digest.clone(), (media_type.to_owned(), payload.to_vec()));
        digest
    }

    /// Serves `payload` under a digest it does not hash to.
    pub fn add_corrupt_manifest(&self, digest: &Digest, media_type: &str, payload: &[u8]) {
        self.state()
            .manifests
            .insert(digest.clone(), (media_type.to_owned(), payload.to_vec()));
    }

    pub fn tag(&self, tag: &str, digest: &Digest) {
        self.state().tags.insert(tag.to_owned(), digest.clone());
    }

    /// Drops the connection after `after` bytes the next time the blob is
    /// opened.
    pub fn interrupt_once(&self, blob: &Digest, after: usize) {
        self.state().interrupt.insert(blob.clone(), after);
    }

    /// Serves the blob as a stream that never yields any data. The returned
    /// flag is raised once the reader of that stream goes away.
    pub fn stall(&self, blob: &Digest) -> Arc<AtomicBool> {
        let dropped = Arc::new(AtomicBool::new(false));
        self.state().stalled.insert(blob.clone(), dropped.clone());
        dropped
    }

    /// Every blob opened so far, with the offset it was opened at.
    pub fn opens(&self) -> Vec<(Digest, u64)> {
        self.state().opens.clone()
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn repository(&self, name: &Reference) -> Result<Arc<dyn Repository>, RegistryError> {
        if name.full_name() != self.named.full_name() {
            return Err(RegistryError::NotFound(name.full_name()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Repository for FakeRegistry {
    fn named(&self) -> &Reference {
        &self.named
    }

    async fn manifests(&self) -> Result<Arc<dyn ManifestService>, RegistryError> {
        Ok(Arc::new(self.clone()))
    }

    fn blobs(&self) -> Arc<dyn BlobService> {
        Arc::new(self.clone())
    }

    fn tags(&self) -> Arc<dyn TagService> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ManifestService for FakeRegistry {
    async fn get(&self, digest: &Digest) -> Result<Manifest, RegistryError> {
        let (media_type, payload) = self
            .state()
            .manifests
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(digest.to_string()))?;
        Ok(Manifest::from_bytes(Some(&media_type), &payload)?)
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Manifest, RegistryError> {
        let digest = self
            .state()
            .tags
            .get(tag)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(tag.to_owned()))?;
        ManifestService::get(self, &digest).await
    }
}

#[async_trait]
impl BlobService for FakeRegistry {
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
        self.state()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(digest.to_string()))
    }

    async fn open(&self, digest: &Digest, offset: u64) -> Result<BlobStream, RegistryError> {
        let mut state = self.state();
        state.opens.push((digest.clone(), offset));
        let content = state
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(digest.to_string()))?;
        let total_size = Some(content.len() as u64);
        let rest = content[offset as usize..].to_vec();
        let reader: distribution::repository::BlobReader = if let Some(dropped) = state.stalled.get(digest) {
            Box::pin(Stalled {
                dropped: dropped.clone(),
            })
        } else {
            match state.interrupt.remove(digest) {
                Some(after) => Box::pin(Interrupted {
                    data: rest[..after.min(rest.len())].to_vec(),
                    pos: 0,
                }),
                None => Box::pin(io::Cursor::new(rest)),
            }
        };
        Ok(BlobStream { total_size, reader })
    }
}

#[async_trait]
impl TagService for FakeRegistry {
    async fn get(&self, tag: &str) -> Result<Descriptor, RegistryError> {
        let state = self.state();
        let digest = state
            .tags
            .get(tag)
            .ok_or_else(|| RegistryError::NotFound(tag.to_owned()))?;
        let (media_type, payload) = &state.manifests[digest];
        Ok(Descriptor {
            media_type: media_type.clone(),
            digest: digest.to_string(),
            size: payload.len() as i64,
            ..Default::default()
        })
    }

    async fn all(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.state().tags.keys().cloned().collect())
    }
}

// Yields its data, then fails like a dropped connection.
struct Interrupted {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for Interrupted {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        let n = buf.remaining().min(self.data.len() - self.pos);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

// Never yields, like a connection that has gone quiet.
struct Stalled {
    dropped: Arc<AtomicBool>,
}

impl AsyncRead for Stalled {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl Drop for Stalled {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// A gzipped layer along with the digests it is known by.
pub struct Layer {
    pub content: Vec<u8>,
    pub blob: Vec<u8>,
    pub digest: Digest,
    pub diff_id: Digest,
}

pub fn layer(content: &[u8]) -> Layer {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).expect("compress layer");
    let blob = encoder.finish().expect("compress layer");
    Layer {
        content: content.to_vec(),
        digest: Digest::from_bytes(&blob),
        diff_id: Digest::from_bytes(content),
        blob,
    }
}

pub fn image_config(architecture: &str, diff_ids: &[&Digest]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "architecture": architecture,
        "os": "linux",
        "config": {"Cmd": ["/bin/sh"]},
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        },
    }))
    .expect("config json")
}

pub fn schema2_manifest(config_media_type: &str, config: &[u8], layers: &[&Layer]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": IMAGE_MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": config_media_type,
            "digest": Digest::from_bytes(config).to_string(),
            "size": config.len(),
        },
        "layers": layers.iter().map(|l| serde_json::json!({
            "mediaType": IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
            "digest": l.digest.to_string(),
            "size": l.blob.len(),
        })).collect::<Vec<_>>(),
    }))
    .expect("manifest json")
}

pub fn manifest_list(entries: &[(&Digest, usize, &str, &str)]) -> Vec<u8> {
    let typed: Vec<_> = entries
        .iter()
        .map(|(digest, size, os, arch)| (IMAGE_MANIFEST_MEDIA_TYPE, *digest, *size, *os, *arch))
        .collect();
    typed_manifest_list(&typed)
}

/// A manifest list whose entries each declare their own media type.
pub fn typed_manifest_list(entries: &[(&str, &Digest, usize, &str, &str)]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": IMAGE_MANIFEST_LIST_MEDIA_TYPE,
        "manifests": entries.iter().map(|(media_type, digest, size, os, arch)| serde_json::json!({
            "mediaType": media_type,
            "digest": digest.to_string(),
            "size": size,
            "platform": {"os": os, "architecture": arch},
        })).collect::<Vec<_>>(),
    }))
    .expect("manifest list json")
}

/// Publishes a schema2 image with the given layers under `tag`, returning
/// the config and manifest digests.
pub fn publish_image(registry: &FakeRegistry, tag: &str, layers: &[&Layer]) -> (Vec<u8>, Digest) {
    for layer in layers {
        registry.add_blob(&layer.blob);
    }
    let diff_ids: Vec<&Digest> = layers.iter().map(|l| &l.diff_id).collect();
    let config = image_config("amd64", &diff_ids);
    registry.add_blob(&config);
    let manifest = schema2_manifest(IMAGE_DOCKER_CONFIG_MEDIA_TYPE, &config, layers);
    let digest = registry.add_manifest(IMAGE_MANIFEST_MEDIA_TYPE, &manifest);
    registry.tag(tag, &digest);
    (config, digest)
}

/// Records every mutation made to a reference store.
pub struct RecordingReferenceStore {
    inner: FileReferenceStore,
    calls: Mutex<Vec<String>>,
    // When set, add_tag fails with this message.
    tag_failure: Mutex<Option<String>>,
}

impl RecordingReferenceStore {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("calls").clear()
    }

    /// Makes every later `add_tag` fail with `message`.
    pub fn fail_tags_with(&self, message: &str) {
        *self.tag_failure.lock().expect("tag failure") = Some(message.to_owned());
    }

    /// Tags an image behind the recorder's back.
    pub async fn add_tag_unrecorded(&self, reference: &Reference, id: &Digest) {
        self.inner
            .add_tag(reference, id, true)
            .await
            .expect("add tag")
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call)
    }
}

#[async_trait]
impl ReferenceStore for RecordingReferenceStore {
    async fn get(&self, reference: &Reference) -> anyhow::Result<Option<Digest>> {
        self.inner.get(reference).await
    }

    async fn add_digest(&self, reference: &Reference, id: &Digest, force: bool) -> anyhow::Result<()> {
        self.record(format!("add_digest {}", reference));
        self.inner.add_digest(reference, id, force).await
    }

    async fn add_tag(&self, reference: &Reference, id: &Digest, force: bool) -> anyhow::Result<()> {
        self.record(format!("add_tag {}", reference));
        let failure = self.tag_failure.lock().expect("tag failure").clone();
        if let Some(message) = failure {
            anyhow::bail!(message);
        }
        self.inner.add_tag(reference, id, force).await
    }

    async fn delete(&self, reference: &Reference) -> anyhow::Result<bool> {
        self.record(format!("delete {}", reference));
        self.inner.delete(reference).await
    }
}

/// Local stores in a temporary directory, and a way to build pullers on
/// top of them.
pub struct Harness {
    pub dir: TempDir,
    pub images: Arc<FileImageStore>,
    pub references: Arc<RecordingReferenceStore>,
    pub downloads: Arc<LocalDownloadManager>,
    pub metadata: Arc<MemoryMetadataStore>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let retry = RetryPolicy {
            attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(10),
        };
        Harness {
            images: Arc::new(FileImageStore::new(dir.path())),
            references: Arc::new(RecordingReferenceStore {
                inner: FileReferenceStore::open(dir.path())
                    .await
                    .expect("reference store"),
                calls: Mutex::new(Vec::new()),
                tag_failure: Mutex::new(None),
            }),
            downloads: Arc::new(LocalDownloadManager::new(dir.path(), 3, retry)),
            metadata: Arc::new(MemoryMetadataStore::new()),
            dir,
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default_config().expect("default config");
        config.data_dir = self.dir.path().to_path_buf();
        config.config_retry.base = Duration::from_millis(1);
        config
    }

    pub fn puller(
        &self,
        registry: &FakeRegistry,
        config: Config,
    ) -> (Puller, UnboundedReceiver<Progress>) {
        self.puller_with_metadata(registry, config, self.metadata.clone())
    }

    /// A puller recording diff-IDs in `metadata` instead of the shared
    /// in-memory store.
    pub fn puller_with_metadata(
        &self,
        registry: &FakeRegistry,
        config: Config,
        metadata: Arc<dyn MetadataStore>,
    ) -> (Puller, UnboundedReceiver<Progress>) {
        let (progress, events) = ChannelOutput::new();
        let pull_config = ImagePullConfig {
            image_store: self.images.clone(),
            reference_store: self.references.clone(),
            download_manager: self.downloads.clone(),
            metadata_store: Some(metadata),
            content_store: None,
            progress: Arc::new(progress),
            fallback_policy: Arc::new(DefaultFallbackPolicy::default()),
            config,
        };
        (Puller::new(Arc::new(registry.clone()), pull_config), events)
    }

    pub async fn image(&self, id: &Digest) -> Option<Vec<u8>> {
        self.images.get(id).await.expect("image store")
    }

    pub async fn resolve(&self, reference: &str) -> Option<Digest> {
        let reference: Reference = reference.parse().expect("reference");
        self.references.get(&reference).await.expect("reference store")
    }
}

pub fn platform(os: &str, architecture: &str) -> Platform {
    Platform {
        os: os.to_owned(),
        architecture: architecture.to_owned(),
        ..Default::default()
    }
}

/// Everything emitted so far.
pub fn drain(events: &mut UnboundedReceiver<Progress>) -> Vec<Progress> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
