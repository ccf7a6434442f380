//! Pulling manifest lists and OCI image indexes.
use distribution::manifest::{ManifestError, ManifestList, Platform};
use distribution::{Digest, Manifest, Reference, RegistryError};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use super::{manifest_digest, PullSession};
use crate::error::PullError;
use crate::platform::{filter_manifests, with_default};
use crate::progress;

impl PullSession<'_> {
    /// Pulls the best entry of a manifest list for the requested platform,
    /// returning its image ID and the digest of the list itself.
    ///
    /// Entries are tried best match first. An entry that is itself a list
    /// without a match for the platform is skipped, as are entries of a kind
    /// we cannot pull.
    pub(super) fn pull_manifest_list<'a>(
        &'a self,
        reference: &'a Reference,
        list: &'a ManifestList,
        payload: &'a [u8],
        requested: Option<&'a Platform>,
    ) -> BoxFuture<'a, Result<(Digest, Digest), PullError>> {
        async move {
            let list_digest = manifest_digest(reference, payload)?;
            let platform = requested.cloned().unwrap_or_default();

            let matches = filter_manifests(&list.manifests, &platform);
            debug!(
                count = list.manifests.len(),
                matches = matches.len(),
                platform = %with_default(&platform),
                "Filtered manifest list"
            );

            for entry in matches {
                let digest = entry
                    .content_digest()
                    .map_err(|source| PullError::InvalidDigest {
                        digest: entry.digest.clone(),
                        source,
                    })?;
                let manifest = match self.manifests.get(&digest).await {
                    Ok(manifest) => manifest,
                    Err(PullError::Registry(RegistryError::Manifest(
                        ManifestError::UnsupportedMediaType(media_type),
                    ))) => {
                        debug!(%digest, %media_type, "Skipping manifest list entry of unknown type");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let entry_ref = reference.trim().with_digest(digest);
                let entry_platform = entry.platform.as_ref();

                let id = match &manifest {
                    Manifest::Schema1(signed) => {
                        let msg = format!(
                            "[DEPRECATION NOTICE] v2 schema1 manifests in manifest lists are not supported and will break in a future release. Suggest author of {} to upgrade to v2 schema2. More information at https://docs.docker.com/registry/spec/deprecated-schema-v1/",
                            reference
                        );
                        warn!("{}", msg);
                        progress::message(self.config.progress.as_ref(), "", msg);
                        self.pull_schema1(&entry_ref, signed, entry_platform).await?.0
                    }
                    Manifest::Schema2 { manifest, payload }
                    | Manifest::Oci { manifest, payload } => {
                        self.pull_schema2(&entry_ref, manifest, payload).await?.0
                    }
                    Manifest::List { list, payload } => {
                        match self
                            .pull_manifest_list(&entry_ref, list, payload, requested)
                            .await
                        {
                            Ok((id, _)) => id,
                            Err(PullError::NoMatches { .. }) => continue,
                            Err(e) => return Err(e),
                        }
                    }
                };
                return Ok((id, list_digest));
            }

            Err(PullError::NoMatches {
                platform: with_default(&platform).to_string(),
            })
        }
        .boxed()
    }
}
