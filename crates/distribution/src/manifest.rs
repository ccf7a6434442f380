//! Image manifests in the four shapes a registry may serve.
use std::collections::HashMap;

use crate::digest::{Digest, DigestError};

/// The mediatype for a legacy schema1 manifest.
pub const SCHEMA1_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// The mediatype for a signed legacy schema1 manifest.
pub const SCHEMA1_SIGNED_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// The mediatype for a Docker v2 schema2 manifest.
pub const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// The mediatype for an OCI manifest.
pub const OCI_IMAGE_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// The mediatype for a Docker manifest list.
pub const IMAGE_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// The mediatype for an OCI image index.
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// The mediatype for an image config (manifest).
pub const IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
/// The mediatype that Docker uses for image configs.
pub const IMAGE_DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
/// The mediatype that Docker uses for plugin configs.
pub const PLUGIN_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.plugin.v1+json";
/// The mediatype for a layer.
pub const IMAGE_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
/// The mediatype for a layer that is gzipped.
pub const IMAGE_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// The mediatype that Docker uses for a layer that is gzipped.
pub const IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// The mediatype that Docker uses for a layer that must be fetched from its URLs.
pub const IMAGE_DOCKER_FOREIGN_LAYER_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
/// The mediatype for a layer that is nondistributable.
pub const IMAGE_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";
/// The mediatype for a layer that is nondistributable and gzipped.
pub const IMAGE_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Manifest media types sent in the `Accept` header when fetching manifests.
pub const MIME_TYPES_DISTRIBUTION_MANIFEST: &[&str] = &[
    IMAGE_MANIFEST_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    SCHEMA1_SIGNED_MEDIA_TYPE,
    SCHEMA1_MEDIA_TYPE,
];

/// Config media types treated as images.
///
/// Besides the real image config types this includes the values some
/// registries serve by mistake and the empty (defaulted) type.
pub const IMAGE_TYPES: &[&str] = &[
    IMAGE_DOCKER_CONFIG_MEDIA_TYPE,
    IMAGE_CONFIG_MEDIA_TYPE,
    "application/octet-stream",
    "application/json",
    "text/html",
    "",
];

/// Config media types treated as plugins.
pub const PLUGIN_TYPES: &[&str] = &[PLUGIN_CONFIG_MEDIA_TYPE];

/// Returns the class ("image" or "plugin") a config media type belongs to.
pub fn media_type_class(media_type: &str) -> Option<&'static str> {
    if IMAGE_TYPES.contains(&media_type) {
        Some("image")
    } else if PLUGIN_TYPES.contains(&media_type) {
        Some("plugin")
    } else {
        None
    }
}

/// Errors produced when decoding a manifest payload.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The content type does not name a known manifest kind.
    #[error("unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),
    /// The payload declares a schema version we do not know.
    #[error("unsupported manifest schema version: {0}")]
    UnsupportedSchemaVersion(i32),
    /// The payload's own mediaType disagrees with the content type it was served with.
    #[error("mediaType in manifest should be '{expected}' not '{found}'")]
    MediaTypeMismatch {
        /// The media type implied by the response.
        expected: String,
        /// The media type declared in the payload.
        found: String,
    },
    /// The schema1 signature envelope could not be decoded.
    #[error("invalid schema1 signature: {0}")]
    InvalidSignature(String),
    /// The payload is not valid JSON for the manifest kind.
    #[error("malformed manifest: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The platform a manifest list entry targets.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Platform {
    /// The CPU architecture, using Go's naming (`amd64`, `arm64`, ...).
    pub architecture: String,
    /// The operating system, using Go's naming (`linux`, `windows`, ...).
    pub os: String,
    /// The operating system version, for example on Windows.
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    /// Required operating system features.
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    /// The CPU variant, e.g. `v7` for ARMv7.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    /// Required CPU features.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl Platform {
    /// Whether every field is empty.
    pub fn is_empty(&self) -> bool {
        self == &Platform::default()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let os = if self.os.is_empty() { "unknown" } else { &self.os };
        let arch = if self.architecture.is_empty() {
            "unknown"
        } else {
            &self.architecture
        };
        write!(f, "{}/{}", os, arch)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

/// A descriptor is a generic object used to describe other objects.
///
/// It is defined in the OCI Image Specification:
/// https://github.com/opencontainers/image-spec/blob/master/descriptor.md#properties
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of this descriptor.
    ///
    /// Layers, config, and manifests may all have descriptors. Each
    /// is differentiated by its mediaType.
    #[serde(default)]
    pub media_type: String,
    /// The digest of the targeted content.
    ///
    /// Kept as it was served; use [`Descriptor::content_digest`] to validate it.
    pub digest: String,
    /// The size, in bytes, of the raw content.
    #[serde(default)]
    pub size: i64,
    /// This OPTIONAL property specifies a list of URIs from which this
    /// object MAY be downloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// This OPTIONAL property contains arbitrary metadata for this descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    /// The platform of the targeted manifest; only set for manifest list entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Parses and validates the digest of the targeted content.
    pub fn content_digest(&self) -> Result<Digest, DigestError> {
        self.digest.parse()
    }
}

/// The manifest shared by Docker schema2 and OCI images: an image config
/// blob plus an ordered list of layers, base layer first.
///
/// It is defined here:
/// https://github.com/opencontainers/image-spec/blob/master/manifest.md
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// This is a schema version.
    ///
    /// The only version allowed by the specification is `2`.
    pub schema_version: u8,

    /// This is an optional media type describing this manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The image configuration.
    pub config: Descriptor,

    /// The image layers, base layer first.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// The annotations for this manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// A manifest list (OCI image index) pointing at platform-specific manifests.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    /// This is a schema version; always `2`.
    pub schema_version: u8,
    /// This is an optional media type describing this manifest list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// The platform-specific manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// A layer reference in a schema1 manifest.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct FsLayer {
    /// The digest of the layer blob.
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

/// A history record in a schema1 manifest.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Schema1History {
    /// The raw V1 image JSON for the matching layer.
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// The legacy schema1 manifest.
///
/// Layers and history are ordered top-most first.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1Manifest {
    /// The schema version; always `1`.
    pub schema_version: i32,
    /// The repository name.
    #[serde(default)]
    pub name: String,
    /// The tag the manifest was pushed under.
    #[serde(default)]
    pub tag: String,
    /// The architecture of the image.
    #[serde(default)]
    pub architecture: String,
    /// The layers, top-most first.
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,
    /// One history record per layer, top-most first.
    #[serde(default)]
    pub history: Vec<Schema1History>,
}

/// A schema1 manifest along with its canonical (signature-free) payload.
#[derive(Debug, Clone)]
pub struct SignedManifest {
    /// The decoded manifest.
    pub manifest: Schema1Manifest,
    /// The bytes the manifest digest is computed over.
    pub canonical: Vec<u8>,
}

#[derive(serde::Deserialize)]
struct Signatures {
    #[serde(default)]
    signatures: Vec<Signature>,
}

#[derive(serde::Deserialize)]
struct Signature {
    protected: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
}

fn decode_base64_url(s: &str) -> Result<Vec<u8>, ManifestError> {
    base64::decode_config(s.trim_end_matches('='), base64::URL_SAFE_NO_PAD)
        .map_err(|e| ManifestError::InvalidSignature(e.to_string()))
}

impl SignedManifest {
    /// Decodes a (possibly signed) schema1 manifest.
    ///
    /// When the payload carries JWS signatures, the canonical payload is
    /// rebuilt from the `formatLength`/`formatTail` of the first protected
    /// header; otherwise the payload is its own canonical form.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Schema1Manifest = serde_json::from_slice(raw)?;
        let envelope: Signatures = serde_json::from_slice(raw)?;
        let canonical = match envelope.signatures.first() {
            None => raw.to_vec(),
            Some(signature) => {
                let header: ProtectedHeader =
                    serde_json::from_slice(&decode_base64_url(&signature.protected)?)?;
                if header.format_length > raw.len() {
                    return Err(ManifestError::InvalidSignature(format!(
                        "format length {} exceeds payload length {}",
                        header.format_length,
                        raw.len()
                    )));
                }
                let mut canonical = raw[..header.format_length].to_vec();
                canonical.extend(decode_base64_url(&header.format_tail)?);
                canonical
            }
        };
        Ok(SignedManifest {
            manifest,
            canonical,
        })
    }
}

/// Versioned provides a struct with the manifest's schemaVersion and mediaType.
/// Incoming content with unknown schema versions can be decoded against this
/// struct to check the version.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned {
    /// schema_version is the image manifest schema that this image follows
    pub schema_version: i32,

    /// media_type is the media type of this schema.
    pub media_type: Option<String>,
}

/// A decoded manifest of any supported kind, together with the exact bytes
/// it was decoded from.
#[derive(Debug, Clone)]
pub enum Manifest {
    /// A legacy schema1 manifest.
    Schema1(SignedManifest),
    /// A Docker v2 schema2 manifest.
    Schema2 {
        /// The decoded manifest.
        manifest: ImageManifest,
        /// The payload it was decoded from.
        payload: Vec<u8>,
    },
    /// An OCI image manifest.
    Oci {
        /// The decoded manifest.
        manifest: ImageManifest,
        /// The payload it was decoded from.
        payload: Vec<u8>,
    },
    /// A Docker manifest list or OCI image index.
    List {
        /// The decoded manifest list.
        list: ManifestList,
        /// The payload it was decoded from.
        payload: Vec<u8>,
    },
}

impl Manifest {
    /// Decodes a manifest served with the given content type.
    ///
    /// Generic content types (`application/json`, `text/plain`, none) are
    /// resolved by sniffing the payload's `schemaVersion` and `mediaType`.
    pub fn from_bytes(content_type: Option<&str>, bytes: &[u8]) -> Result<Self, ManifestError> {
        let content_type = content_type
            .map(|ct| ct.split(';').next().unwrap_or("").trim())
            .unwrap_or("");
        let versioned: Versioned = serde_json::from_slice(bytes)?;
        let media_type = match content_type {
            "" | "application/json" | "text/plain" => sniff_media_type(&versioned, bytes)?,
            ct => ct.to_owned(),
        };

        if let Some(declared) = versioned.media_type.as_deref() {
            if !declared.is_empty()
                && declared != media_type
                && media_type != SCHEMA1_MEDIA_TYPE
                && media_type != SCHEMA1_SIGNED_MEDIA_TYPE
            {
                return Err(ManifestError::MediaTypeMismatch {
                    expected: media_type,
                    found: declared.to_owned(),
                });
            }
        }

        match media_type.as_str() {
            SCHEMA1_MEDIA_TYPE | SCHEMA1_SIGNED_MEDIA_TYPE => {
                if versioned.schema_version != 1 {
                    return Err(ManifestError::UnsupportedSchemaVersion(
                        versioned.schema_version,
                    ));
                }
                Ok(Manifest::Schema1(SignedManifest::from_bytes(bytes)?))
            }
            IMAGE_MANIFEST_MEDIA_TYPE | OCI_IMAGE_MEDIA_TYPE => {
                if versioned.schema_version != 2 {
                    return Err(ManifestError::UnsupportedSchemaVersion(
                        versioned.schema_version,
                    ));
                }
                let manifest: ImageManifest = serde_json::from_slice(bytes)?;
                let payload = bytes.to_vec();
                if media_type == IMAGE_MANIFEST_MEDIA_TYPE {
                    Ok(Manifest::Schema2 { manifest, payload })
                } else {
                    Ok(Manifest::Oci { manifest, payload })
                }
            }
            IMAGE_MANIFEST_LIST_MEDIA_TYPE | OCI_IMAGE_INDEX_MEDIA_TYPE => {
                if versioned.schema_version != 2 {
                    return Err(ManifestError::UnsupportedSchemaVersion(
                        versioned.schema_version,
                    ));
                }
                Ok(Manifest::List {
                    list: serde_json::from_slice(bytes)?,
                    payload: bytes.to_vec(),
                })
            }
            other => Err(ManifestError::UnsupportedMediaType(other.to_owned())),
        }
    }

    /// The bytes the manifest digest is computed over.
    pub fn payload(&self) -> &[u8] {
        match self {
            Manifest::Schema1(signed) => &signed.canonical,
            Manifest::Schema2 { payload, .. }
            | Manifest::Oci { payload, .. }
            | Manifest::List { payload, .. } => payload,
        }
    }

    /// The media type of the manifest kind.
    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Schema1(_) => SCHEMA1_SIGNED_MEDIA_TYPE,
            Manifest::Schema2 { .. } => IMAGE_MANIFEST_MEDIA_TYPE,
            Manifest::Oci { .. } => OCI_IMAGE_MEDIA_TYPE,
            Manifest::List { list, .. } => list
                .media_type
                .as_deref()
                .unwrap_or(OCI_IMAGE_INDEX_MEDIA_TYPE),
        }
    }
}

fn sniff_media_type(versioned: &Versioned, bytes: &[u8]) -> Result<String, ManifestError> {
    match versioned.schema_version {
        1 => Ok(SCHEMA1_SIGNED_MEDIA_TYPE.to_owned()),
        2 => {
            if let Some(mt) = versioned.media_type.as_deref().filter(|mt| !mt.is_empty()) {
                return Ok(mt.to_owned());
            }
            // An OCI document without a mediaType is an index if it lists
            // manifests and an image manifest if it has a config.
            let fields: HashMap<String, serde_json::Value> = serde_json::from_slice(bytes)?;
            if fields.contains_key("manifests") {
                Ok(OCI_IMAGE_INDEX_MEDIA_TYPE.to_owned())
            } else if fields.contains_key("config") {
                Ok(OCI_IMAGE_MEDIA_TYPE.to_owned())
            } else {
                Err(ManifestError::UnsupportedMediaType(String::new()))
            }
        }
        v => Err(ManifestError::UnsupportedSchemaVersion(v)),
    }
}
