//! Fetching manifests, from the local cache when possible.
use std::sync::Arc;

use distribution::repository::ManifestService;
use distribution::{Digest, Manifest};
use tracing::{debug, warn};

use crate::error::PullError;
use crate::progress::ProgressOutput;
use crate::store::ContentStore;

const WARN_EMOJI: &str = "\u{26A0}\u{FE0F}";

/// Fetches manifests by digest, consulting a local cache first.
///
/// Remote manifests that verify against the requested digest are written
/// back to the cache. The cache is an optimisation only: its failures are
/// logged and otherwise ignored.
pub struct ManifestStore {
    local: Option<Arc<dyn ContentStore>>,
    remote: Arc<dyn ManifestService>,
}

fn verifies(digest: &Digest, payload: &[u8]) -> bool {
    let mut verifier = digest.verifier();
    verifier.update(payload);
    verifier.verified()
}

impl ManifestStore {
    /// Creates a store reading through `local` to `remote`.
    pub fn new(local: Option<Arc<dyn ContentStore>>, remote: Arc<dyn ManifestService>) -> Self {
        ManifestStore { local, remote }
    }

    async fn get_local(&self, digest: &Digest) -> Option<Manifest> {
        let local = self.local.as_ref()?;
        let (media_type, payload) = match local.get(digest).await {
            Ok(Some(cached)) => cached,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, %digest, "Failed to read manifest from local store");
                return None;
            }
        };
        if !verifies(digest, &payload) {
            warn!(%digest, "Cached manifest does not match its digest, ignoring it");
            return None;
        }
        match Manifest::from_bytes(Some(&media_type), &payload) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                debug!(error = %e, %digest, "Failed to decode cached manifest");
                None
            }
        }
    }

    /// Fetches the manifest with the given digest.
    pub async fn get(&self, digest: &Digest) -> Result<Manifest, PullError> {
        if let Some(manifest) = self.get_local(digest).await {
            debug!(%digest, "Found manifest in local store");
            return Ok(manifest);
        }

        let manifest = self.remote.get(digest).await?;
        if let Some(local) = &self.local {
            if verifies(digest, manifest.payload()) {
                if let Err(e) = local
                    .put(digest, manifest.media_type(), manifest.payload())
                    .await
                {
                    warn!(error = %e, %digest, "Failed to cache manifest");
                }
            }
        }
        Ok(manifest)
    }

    /// Fetches the manifest with the given digest, falling back to fetching
    /// it by tag when the registry cannot serve it by digest.
    ///
    /// Registries needing the fallback do not follow the distribution
    /// protocol, so a warning naming the registry is emitted when it is used.
    pub async fn get_or_by_tag(
        &self,
        digest: &Digest,
        tag: Option<&str>,
        registry: &str,
        out: &dyn ProgressOutput,
    ) -> Result<Manifest, PullError> {
        let err = match self.get(digest).await {
            Ok(manifest) => return Ok(manifest),
            Err(e) => e,
        };
        let tag = match tag {
            Some(tag) if matches!(&err, PullError::Registry(e) if e.is_not_found()) => tag,
            _ => return Err(err),
        };
        debug!(error = %err, %tag, "Falling back to pull manifest by tag");
        crate::messagef!(
            out,
            "WARNING",
            "{} Failed to pull manifest by the resolved digest. This registry does not
	appear to conform to the distribution registry specification; falling back to
	pull by tag.  This fallback is DEPRECATED, and will be removed in a future
	release.  Please contact admins of {}. {}
",
            WARN_EMOJI,
            registry,
            WARN_EMOJI
        );
        Ok(self.remote.get_by_tag(tag).await?)
    }
}
