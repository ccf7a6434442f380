//! Pulling images from a registry into the local stores.
//!
//! A [`Puller`] resolves a reference to a manifest, hands the manifest to the
//! puller for its schema, and finally records the resulting image ID under
//! the reference in the reference store.
mod list;
mod schema1;
mod schema2;

use std::sync::Arc;

use distribution::manifest::{media_type_class, Platform};
use distribution::repository::{Registry, Repository};
use distribution::{Digest, Manifest, Reference};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, instrument, warn, Span};

use crate::config::ImagePullConfig;
use crate::download::DownloadDescriptor;
use crate::error::{FallbackPolicy, PullError};
use crate::layer::LayerDescriptor;
use crate::manifest_store::ManifestStore;
use crate::progress;

const DOCKER_HUB_DOMAIN: &str = "docker.io";

/// Pulls images from one registry.
///
/// # Example
///
/// ```rust,no_run
/// # async fn run(config: puller::ImagePullConfig) -> anyhow::Result<()> {
/// use std::sync::Arc;
/// use distribution::client::{Client, ClientConfig};
/// use distribution::secrets::RegistryAuth;
/// use puller::Puller;
/// use tokio_util::sync::CancellationToken;
///
/// let client = Client::new(ClientConfig::default(), RegistryAuth::Anonymous)?;
/// let puller = Puller::new(Arc::new(client), config);
/// let reference = "docker.io/library/hello-world:latest".parse()?;
/// let updated = puller.pull(&CancellationToken::new(), &reference).await?;
/// # Ok(())
/// # }
/// ```
pub struct Puller {
    registry: Arc<dyn Registry>,
    config: ImagePullConfig,
}

impl Puller {
    /// Creates a puller fetching from `registry` into the stores of `config`.
    pub fn new(registry: Arc<dyn Registry>, config: ImagePullConfig) -> Self {
        Puller { registry, config }
    }

    /// Pulls the image a reference names. A reference with neither a tag nor
    /// a digest pulls every tag of the repository.
    ///
    /// Returns whether anything new was downloaded or tagged. Failures the
    /// fallback policy considers worth retrying elsewhere are returned as
    /// [`PullError::Fallback`].
    #[instrument(level = "info", skip(self, cancel), fields(remote = %reference))]
    pub async fn pull(
        &self,
        cancel: &CancellationToken,
        reference: &Reference,
    ) -> Result<bool, PullError> {
        let policy = self.config.fallback_policy.as_ref();
        let repo = match self.registry.repository(reference).await {
            Ok(repo) => repo,
            Err(e) => {
                warn!(error = %e, "Error getting registry repository");
                return Err(fall_back_if(policy, PullError::Registry(e)));
            }
        };
        let remote = match repo.manifests().await {
            Ok(remote) => remote,
            Err(e) => return Err(fall_back_if(policy, PullError::Registry(e))),
        };

        let session = PullSession {
            config: &self.config,
            manifests: ManifestStore::new(self.config.content_store.clone(), remote),
            repo,
            cancel: cancel.clone(),
        };
        match session.pull_repository(reference).await {
            Ok(updated) => Ok(updated),
            Err(e @ PullError::Fallback { .. }) => Err(e),
            Err(e) => Err(fall_back_if(policy, e)),
        }
    }
}

fn fall_back_if(policy: &dyn FallbackPolicy, err: PullError) -> PullError {
    if policy.should_fall_back(&err) {
        PullError::Fallback {
            source: Box::new(err),
            transport_ok: true,
        }
    } else {
        err
    }
}

/// The state of one call to [`Puller::pull`].
struct PullSession<'a> {
    config: &'a ImagePullConfig,
    repo: Arc<dyn Repository>,
    manifests: ManifestStore,
    cancel: CancellationToken,
}

impl PullSession<'_> {
    async fn pull_repository(&self, reference: &Reference) -> Result<bool, PullError> {
        let platform = self.config.config.platform.as_ref();
        if !reference.is_name_only() {
            let updated = self.pull_tag(reference, platform).await?;
            self.write_status(&reference.familiar_string(), updated);
            return Ok(updated);
        }

        let tags = self.repo.tags().all().await?;
        let mut any_updated = false;
        for tag in tags {
            let tag_ref = reference.with_tag(&tag)?;
            let updated = match self.pull_tag(&tag_ref, platform).await {
                Ok(updated) => updated,
                // One tag failing must not make the whole pull fall back.
                Err(PullError::Fallback { source, .. }) => return Err(*source),
                Err(e) => return Err(e),
            };
            self.write_status(&tag_ref.familiar_string(), updated);
            any_updated = any_updated || updated;
        }
        Ok(any_updated)
    }

    fn write_status(&self, requested: &str, updated: bool) {
        let out = self.config.progress.as_ref();
        if updated {
            progress::message(out, "", format!("Status: Downloaded newer image for {}", requested));
        } else {
            progress::message(out, "", format!("Status: Image is up to date for {}", requested));
        }
    }

    #[instrument(
        level = "debug",
        skip(self, platform),
        fields(remote = %reference, digest = field::Empty)
    )]
    async fn pull_tag(
        &self,
        reference: &Reference,
        platform: Option<&Platform>,
    ) -> Result<bool, PullError> {
        let out = self.config.progress.as_ref();

        // tag_or_digest is only used for progress output.
        let (digest, tag_or_digest, tag) = match (reference.digest(), reference.tag()) {
            (Some(digest), _) => (digest.clone(), reference.to_string(), None),
            (None, Some(tag)) => {
                let desc = self.repo.tags().get(tag).await?;
                let digest = desc
                    .content_digest()
                    .map_err(|source| PullError::InvalidDigest {
                        digest: desc.digest.clone(),
                        source,
                    })?;
                (digest, tag.to_owned(), Some(tag))
            }
            (None, None) => {
                return Err(PullError::InvalidManifest(format!(
                    "internal error: reference has neither a tag nor a digest: {}",
                    reference.familiar_string()
                )))
            }
        };
        Span::current().record("digest", &field::display(&digest));

        let manifest = self
            .manifests
            .get_or_by_tag(&digest, tag, reference.resolve_registry(), out)
            .await?;

        if let Manifest::Schema2 { manifest: m, .. } = &manifest {
            self.validate_media_type(&m.config.media_type)?;
        }

        debug!(reference = %reference.familiar_string(), "Pulling ref from registry");
        progress::message(
            out,
            &tag_or_digest,
            format!("Pulling from {}", self.repo.named().familiar_name()),
        );

        let (id, manifest_digest) = match &manifest {
            Manifest::Schema1(signed) => {
                if self.config.config.require_schema2 {
                    return Err(PullError::NotSchema2);
                }
                if reference.registry() == DOCKER_HUB_DOMAIN {
                    let msg = format!(
                        "Image {} uses outdated schema1 manifest format. Please upgrade to a schema2 image for better future compatibility. More information at https://docs.docker.com/registry/spec/deprecated-schema-v1/",
                        reference
                    );
                    warn!("{}", msg);
                    progress::message(out, "", msg);
                }
                self.pull_schema1(reference, signed, platform).await?
            }
            Manifest::Schema2 { manifest, payload } | Manifest::Oci { manifest, payload } => {
                self.pull_schema2(reference, manifest, payload).await?
            }
            Manifest::List { list, payload } => {
                self.pull_manifest_list(reference, list, payload, platform)
                    .await?
            }
        };

        progress::message(out, "", format!("Digest: {}", manifest_digest));

        self.update_references(reference, &manifest_digest, &id).await
    }

    // Records the pulled image under the reference. Returns whether the
    // reference now points at a different image.
    async fn update_references(
        &self,
        reference: &Reference,
        manifest_digest: &Digest,
        id: &Digest,
    ) -> Result<bool, PullError> {
        let store = self.config.reference_store.as_ref();
        if store.get(reference).await?.as_ref() == Some(id) {
            self.add_digest_reference(reference, manifest_digest, id)
                .await?;
            return Ok(false);
        }

        if reference.digest().is_some() {
            store.add_digest(reference, id, true).await?;
            return Ok(true);
        }

        let added = self
            .add_digest_reference(reference, manifest_digest, id)
            .await?;
        if let Err(e) = store.add_tag(reference, id, true).await {
            // Leave the store as it was before this pull.
            if let Some(digest_ref) = added {
                if let Err(undo) = store.delete(&digest_ref).await {
                    error!(error = %undo, reference = %digest_ref, "Failed to roll back digest reference");
                }
            }
            return Err(e.into());
        }
        Ok(true)
    }

    // Associates the manifest digest with the image, unless the digest is
    // already associated with some image. Returns the reference it added.
    async fn add_digest_reference(
        &self,
        reference: &Reference,
        manifest_digest: &Digest,
        id: &Digest,
    ) -> Result<Option<Reference>, PullError> {
        let store = self.config.reference_store.as_ref();
        let digest_ref = reference.trim().with_digest(manifest_digest.clone());
        if let Some(old) = store.get(&digest_ref).await? {
            if &old != id {
                error!(
                    digest = %manifest_digest,
                    from = %old,
                    to = %id,
                    "Image ID for digest changed, cannot update"
                );
            }
            return Ok(None);
        }
        store.add_digest(&digest_ref, id, true).await?;
        Ok(Some(digest_ref))
    }

    fn validate_media_type(&self, media_type: &str) -> Result<(), PullError> {
        if self
            .config
            .config
            .allowed_config_types()
            .contains(&media_type)
        {
            return Ok(());
        }
        Err(PullError::InvalidManifestClass {
            media_type: media_type.to_owned(),
            class: media_type_class(media_type).unwrap_or("unknown").to_owned(),
        })
    }

    fn layer_descriptor(&self, digest: Digest) -> Box<dyn DownloadDescriptor> {
        Box::new(LayerDescriptor::new(
            digest,
            self.repo.named().full_name(),
            self.repo.blobs(),
            self.config.metadata_store.clone(),
        ))
    }
}

/// The digest of a manifest payload. When pulling by digest the payload must
/// match the digest asked for.
fn manifest_digest(reference: &Reference, payload: &[u8]) -> Result<Digest, PullError> {
    match reference.digest() {
        Some(digest) => {
            let mut verifier = digest.verifier();
            verifier.update(payload);
            if !verifier.verified() {
                let err = PullError::ManifestVerification(digest.clone());
                error!(error = %err, "Manifest verification failed");
                return Err(err);
            }
            Ok(digest.clone())
        }
        None => Ok(Digest::from_bytes(payload)),
    }
}
