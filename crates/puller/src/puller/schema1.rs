//! Pulling legacy schema1 images.
use std::collections::HashSet;

use distribution::manifest::{Platform, Schema1Manifest, SignedManifest};
use distribution::{Digest, Reference};
use serde::Deserialize;
use tracing::error;

use super::PullSession;
use crate::download::DownloadDescriptor;
use crate::error::PullError;
use crate::image::{self, RootFs, V1Image};
use crate::platform;

#[derive(Deserialize)]
struct Throwaway {
    #[serde(default)]
    throwaway: bool,
}

impl PullSession<'_> {
    /// Pulls a schema1 image, returning its image ID and manifest digest.
    pub(super) async fn pull_schema1(
        &self,
        reference: &Reference,
        signed: &SignedManifest,
        requested: Option<&Platform>,
    ) -> Result<(Digest, Digest), PullError> {
        // Schema1 images carry no platform, so only same-OS pulls are allowed.
        if let Some(requested) = requested {
            let host = platform::default_platform().os;
            if !requested.os.is_empty() && platform::normalize(requested).os != host {
                return Err(PullError::OsMismatch {
                    host,
                    requested: requested.os.clone(),
                });
            }
        }

        let mut manifest = verify_schema1_manifest(signed, reference)?;
        fix_manifest_layers(&mut manifest)?;

        let mut descriptors: Vec<Box<dyn DownloadDescriptor>> = Vec::new();
        let mut history = Vec::with_capacity(manifest.history.len());

        // Base layer first.
        for (layer, record) in manifest.fs_layers.iter().zip(&manifest.history).rev() {
            let digest: Digest =
                layer
                    .blob_sum
                    .parse()
                    .map_err(|source| PullError::InvalidDigest {
                        digest: layer.blob_sum.clone(),
                        source,
                    })?;
            let v1 = record.v1_compatibility.as_bytes();
            let Throwaway { throwaway }: Throwaway = serde_json::from_slice(v1)?;
            history.push(image::history_from_v1_config(v1, throwaway)?);
            if throwaway {
                continue;
            }
            descriptors.push(self.layer_descriptor(digest));
        }

        let (rootfs, release) = self
            .config
            .download_manager
            .download(
                self.cancel.clone(),
                RootFs::default(),
                descriptors,
                self.config.progress.clone(),
            )
            .await?;

        let config = image::make_config_from_v1_config(
            manifest.history[0].v1_compatibility.as_bytes(),
            &rootfs,
            &history,
        )?;
        let id = self.config.image_store.put(&config).await?;
        release.release();

        Ok((id, Digest::from_bytes(&signed.canonical)))
    }
}

/// Checks a schema1 manifest before anything in it is trusted.
///
/// When pulling by digest the canonical payload is verified first.
fn verify_schema1_manifest(
    signed: &SignedManifest,
    reference: &Reference,
) -> Result<Schema1Manifest, PullError> {
    if let Some(digest) = reference.digest() {
        let mut verifier = digest.verifier();
        verifier.update(&signed.canonical);
        if !verifier.verified() {
            let err = PullError::ManifestVerification(digest.clone());
            error!(error = %err, "Image verification failed");
            return Err(err);
        }
    }

    let m = &signed.manifest;
    let name = reference.familiar_string();
    if m.schema_version != 1 {
        return Err(PullError::InvalidManifest(format!(
            "unsupported schema version {} for {:?}",
            m.schema_version, name
        )));
    }
    if m.fs_layers.len() != m.history.len() {
        return Err(PullError::InvalidManifest(format!(
            "length of history not equal to number of layers for {:?}",
            name
        )));
    }
    if m.fs_layers.is_empty() {
        return Err(PullError::InvalidManifest(format!(
            "no FSLayers in manifest for {:?}",
            name
        )));
    }
    Ok(m.clone())
}

/// Removes layers repeated back to back and checks that every layer names
/// the one below it as its parent.
///
/// Layers are ordered top-most first.
fn fix_manifest_layers(m: &mut Schema1Manifest) -> Result<(), PullError> {
    let images = m
        .history
        .iter()
        .map(|h| {
            let img: V1Image = serde_json::from_str(&h.v1_compatibility)?;
            image::validate_v1_id(&img.id)?;
            Ok(img)
        })
        .collect::<Result<Vec<_>, PullError>>()?;

    let base = match images.last() {
        Some(base) => base,
        None => return Ok(()),
    };
    if !base.parent.is_empty() {
        return Err(PullError::InvalidManifest(
            "invalid parent ID in the base layer of the image".to_owned(),
        ));
    }

    // Repeats that are not adjacent cannot be fixed up.
    let mut seen = HashSet::new();
    let mut last: Option<&str> = None;
    for img in &images {
        if last != Some(img.id.as_str()) && seen.contains(img.id.as_str()) {
            return Err(PullError::InvalidManifest(format!(
                "ID {} appears multiple times in manifest",
                img.id
            )));
        }
        last = Some(img.id.as_str());
        seen.insert(img.id.as_str());
    }

    // Walk upwards so removals don't shift the indexes still to visit.
    for i in (0..images.len() - 1).rev() {
        if images[i].id == images[i + 1].id {
            m.fs_layers.remove(i);
            m.history.remove(i);
        } else if images[i].parent != images[i + 1].id {
            return Err(PullError::InvalidManifest(format!(
                "invalid parent ID. Expected {}, got {}",
                images[i + 1].id,
                images[i].parent
            )));
        }
    }
    Ok(())
}
