//! File system backed image, reference and layer metadata stores.
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use distribution::{Digest, Reference};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ImageStore, MetadataStore, ReferenceStore};

const REPOSITORIES_FILE: &str = "repositories.json";
const DEFAULT_TAG: &str = "latest";
const METADATA_DIR: &str = "distribution";

/// Writes `data` to `path` so that readers see either the old or the new
/// content, never a mix.
async fn write_atomic(path: PathBuf, data: Vec<u8>) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .with_context(|| format!("unable to persist {}", path.display()))?;
        Ok(())
    })
    .await?
}

/// Stores image configurations under `<root>/imagedb/content/<algorithm>/<hex>`.
#[derive(Clone, Debug)]
pub struct FileImageStore {
    root_dir: PathBuf,
}

impl FileImageStore {
    /// Create a new `FileImageStore`
    pub fn new<T: AsRef<Path>>(root_dir: T) -> Self {
        Self {
            root_dir: root_dir.as_ref().into(),
        }
    }

    fn content_path(&self, id: &Digest) -> PathBuf {
        self.root_dir
            .join("imagedb")
            .join("content")
            .join(id.algorithm().name())
            .join(id.hex())
    }
}

#[async_trait]
impl ImageStore for FileImageStore {
    async fn put(&self, config: &[u8]) -> anyhow::Result<Digest> {
        let id = Digest::from_bytes(config);
        let path = self.content_path(&id);
        if tokio::fs::metadata(&path).await.is_ok() {
            debug!(%id, "Image configuration already stored");
            return Ok(id);
        }
        write_atomic(path, config.to_vec()).await?;
        debug!(%id, "Stored image configuration");
        Ok(id)
    }

    async fn get(&self, id: &Digest) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.content_path(id)).await {
            Ok(content) => {
                let mut verifier = id.verifier();
                verifier.update(&content);
                if !verifier.verified() {
                    bail!("stored image configuration {} is corrupt", id);
                }
                Ok(Some(content))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// repository name -> reference -> image ID
#[derive(Clone, Default, Serialize, Deserialize)]
struct Repositories {
    #[serde(rename = "Repositories", default)]
    repositories: BTreeMap<String, BTreeMap<String, Digest>>,
}

/// Keeps the tag and digest references of images in a single JSON file,
/// `<root>/repositories.json`.
pub struct FileReferenceStore {
    path: PathBuf,
    state: Mutex<Repositories>,
}

impl FileReferenceStore {
    /// Opens the store in `root_dir`, loading any references saved before.
    pub async fn open<T: AsRef<Path>>(root_dir: T) -> anyhow::Result<Self> {
        let path = root_dir.as_ref().join(REPOSITORIES_FILE);
        let state = match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)
                .with_context(|| format!("unable to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Repositories::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn add_reference(
        &self,
        key: Reference,
        id: &Digest,
        force: bool,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let repository = key.full_name();
        let ref_str = key.whole();

        if let Some(old) = state
            .repositories
            .get(&repository)
            .and_then(|refs| refs.get(&ref_str))
        {
            if old == id {
                return Ok(());
            }
            if let Some(digest) = key.digest() {
                bail!("Cannot overwrite digest {}", digest);
            }
            if !force {
                bail!(
                    "Conflict: Tag {} is already set to image {}, if you want to replace it, please use the force option",
                    key.familiar_string(),
                    old
                );
            }
        }

        // Only swap in the new state once it is safely on disk.
        let mut next = state.clone();
        next.repositories
            .entry(repository)
            .or_default()
            .insert(ref_str, id.clone());
        self.save(&next).await?;
        *state = next;
        debug!(reference = %key, %id, "Added reference");
        Ok(())
    }

    async fn save(&self, state: &Repositories) -> anyhow::Result<()> {
        let data = serde_json::to_vec(state)?;
        write_atomic(self.path.clone(), data).await
    }
}

// The key a reference is stored under: a digest reference drops its tag,
// and a bare name means the default tag.
fn normalize_key(reference: &Reference) -> anyhow::Result<Reference> {
    let name = reference.trim();
    match (reference.digest(), reference.tag()) {
        (Some(digest), _) => Ok(name.with_digest(digest.clone())),
        (None, Some(tag)) => Ok(name.with_tag(tag)?),
        (None, None) => Ok(name.with_tag(DEFAULT_TAG)?),
    }
}

#[async_trait]
impl ReferenceStore for FileReferenceStore {
    async fn get(&self, reference: &Reference) -> anyhow::Result<Option<Digest>> {
        let key = normalize_key(reference)?;
        let state = self.state.lock().await;
        Ok(state
            .repositories
            .get(&key.full_name())
            .and_then(|refs| refs.get(&key.whole()))
            .cloned())
    }

    async fn add_digest(
        &self,
        reference: &Reference,
        id: &Digest,
        force: bool,
    ) -> anyhow::Result<()> {
        let digest = reference
            .digest()
            .ok_or_else(|| anyhow!("reference {} has no digest", reference))?;
        self.add_reference(reference.trim().with_digest(digest.clone()), id, force)
            .await
    }

    async fn add_tag(&self, reference: &Reference, id: &Digest, force: bool) -> anyhow::Result<()> {
        if reference.digest().is_some() {
            bail!("refusing to create a tag with a digest reference");
        }
        let key = normalize_key(reference)?;
        self.add_reference(key, id, force).await
    }

    async fn delete(&self, reference: &Reference) -> anyhow::Result<bool> {
        let key = normalize_key(reference)?;
        let repository = key.full_name();
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let removed = match next.repositories.get_mut(&repository) {
            Some(refs) => {
                let removed = refs.remove(&key.whole()).is_some();
                if refs.is_empty() {
                    next.repositories.remove(&repository);
                }
                removed
            }
            None => false,
        };
        if removed {
            self.save(&next).await?;
            *state = next;
        }
        Ok(removed)
    }
}

// One entry per repository a blob with a given diff-ID was pulled from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct BlobSource {
    #[serde(rename = "Digest")]
    digest: Digest,
    #[serde(rename = "SourceRepository")]
    source_repository: String,
}

/// Records which diff-ID each downloaded blob decompresses to, so layers
/// fetched by an earlier process are recognised.
///
/// The mapping lives under `<root>/distribution`:
/// `diffid-by-digest/<algorithm>/<hex>` holds the diff-ID of a blob, and
/// `v2metadata-by-diffid/<algorithm>/<hex>` lists the blobs and source
/// repositories seen for a diff-ID.
pub struct FileMetadataStore {
    root_dir: PathBuf,
    // Serialises read-modify-write of the source lists.
    lock: Mutex<()>,
}

impl FileMetadataStore {
    /// Create a new `FileMetadataStore`
    pub fn new<T: AsRef<Path>>(root_dir: T) -> Self {
        Self {
            root_dir: root_dir.as_ref().join(METADATA_DIR),
            lock: Mutex::new(()),
        }
    }

    fn path(&self, namespace: &str, digest: &Digest) -> PathBuf {
        self.root_dir
            .join(namespace)
            .join(digest.algorithm().name())
            .join(digest.hex())
    }

    async fn blob_sources(&self, diff_id: &Digest) -> anyhow::Result<Vec<BlobSource>> {
        let path = self.path("v2metadata-by-diffid", diff_id);
        match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)
                .with_context(|| format!("unable to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// The repositories a blob has been pulled from.
    pub async fn sources(&self, blob: &Digest) -> anyhow::Result<Vec<String>> {
        let diff_id = match self.get_diff_id(blob).await? {
            Some(diff_id) => diff_id,
            None => return Ok(Vec::new()),
        };
        Ok(self
            .blob_sources(&diff_id)
            .await?
            .into_iter()
            .filter(|source| &source.digest == blob)
            .map(|source| source.source_repository)
            .collect())
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn get_diff_id(&self, blob: &Digest) -> anyhow::Result<Option<Digest>> {
        let path = self.path("diffid-by-digest", blob);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let diff_id = content
                    .trim()
                    .parse::<Digest>()
                    .with_context(|| format!("invalid diff-ID in {}", path.display()))?;
                Ok(Some(diff_id))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn add(
        &self,
        diff_id: &Digest,
        blob: &Digest,
        source_repository: &str,
    ) -> anyhow::Result<()> {
        let _lock = self.lock.lock().await;
        write_atomic(
            self.path("diffid-by-digest", blob),
            diff_id.to_string().into_bytes(),
        )
        .await?;

        let mut sources = self.blob_sources(diff_id).await?;
        let source = BlobSource {
            digest: blob.clone(),
            source_repository: source_repository.to_owned(),
        };
        if !sources.contains(&source) {
            sources.push(source);
            write_atomic(
                self.path("v2metadata-by-diffid", diff_id),
                serde_json::to_vec(&sources)?,
            )
            .await?;
        }
        debug!(%blob, %diff_id, source_repository, "Recorded layer metadata");
        Ok(())
    }
}
