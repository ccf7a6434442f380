//! In-memory caches for manifests and diff-IDs.
use std::collections::HashMap;

use async_trait::async_trait;
use distribution::Digest;
use tokio::sync::RwLock;

use super::{ContentStore, MetadataStore};

/// Caches manifests for the lifetime of the process.
#[derive(Default)]
pub struct MemoryContentStore {
    manifests: RwLock<HashMap<Digest, (String, Vec<u8>)>>,
}

impl MemoryContentStore {
    /// Create a new, empty `MemoryContentStore`
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get(&self, digest: &Digest) -> anyhow::Result<Option<(String, Vec<u8>)>> {
        Ok(self.manifests.read().await.get(digest).cloned())
    }

    async fn put(&self, digest: &Digest, media_type: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.manifests
            .write()
            .await
            .insert(digest.clone(), (media_type.to_owned(), payload.to_vec()));
        Ok(())
    }
}

/// Remembers blob to diff-ID mappings, and which repositories each blob was
/// seen in.
#[derive(Default)]
pub struct MemoryMetadataStore {
    diff_ids: RwLock<HashMap<Digest, Digest>>,
    sources: RwLock<HashMap<Digest, Vec<String>>>,
}

impl MemoryMetadataStore {
    /// Create a new, empty `MemoryMetadataStore`
    pub fn new() -> Self {
        Self::default()
    }

    /// The repositories a blob has been pulled from.
    pub async fn sources(&self, blob: &Digest) -> Vec<String> {
        self.sources
            .read()
            .await
            .get(blob)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_diff_id(&self, blob: &Digest) -> anyhow::Result<Option<Digest>> {
        Ok(self.diff_ids.read().await.get(blob).cloned())
    }

    async fn add(
        &self,
        diff_id: &Digest,
        blob: &Digest,
        source_repository: &str,
    ) -> anyhow::Result<()> {
        self.diff_ids
            .write()
            .await
            .insert(blob.clone(), diff_id.clone());
        let mut sources = self.sources.write().await;
        let repos = sources.entry(blob.clone()).or_default();
        if !repos.iter().any(|r| r == source_repository) {
            repos.push(source_repository.to_owned());
        }
        Ok(())
    }
}
