//! Image configuration types, and the translation of legacy V1 image JSON
//! into a modern image configuration.
use chrono::{DateTime, Utc};
use distribution::Digest;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PullError;

/// The only root filesystem type there is.
pub const TYPE_LAYERS: &str = "layers";

// V1 image JSON written by engines older than this needs normalising before
// it can be carried over into a configuration.
const NO_FALLBACK_MIN_VERSION: &str = "1.8.3";

lazy_static! {
    static ref VALID_HEX: Regex = Regex::new(r"^[a-f0-9]{64}$").unwrap();
}

/// The root filesystem of an image: its layers' diff-IDs, base layer first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The diff-IDs, base layer first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        RootFs {
            kind: TYPE_LAYERS.to_owned(),
            diff_ids: Vec::new(),
        }
    }
}

impl RootFs {
    /// Adds a layer on top.
    pub fn append(&mut self, diff_id: Digest) {
        self.diff_ids.push(diff_id)
    }
}

/// One entry of an image's history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// When the step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Who ran it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    /// The command that ran.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    /// A free form comment.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// Whether the step left the filesystem unchanged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// The legacy V1 image JSON found in schema1 `v1Compatibility` records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct V1Image {
    /// The layer's ID.
    #[serde(default)]
    pub id: String,
    /// The ID of the layer below.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// The container the layer was committed from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    /// The configuration of that container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<Value>,
    /// The engine version that built the layer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_version: String,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    /// The runtime configuration of the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[allow(missing_docs)]
    #[serde(rename = "Size", default, skip_serializing_if = "is_zero")]
    pub size: i64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl V1Image {
    /// The command the layer's container ran, joined by spaces.
    fn created_by(&self) -> String {
        let cmd = self
            .container_config
            .as_ref()
            .and_then(|c| c.get("Cmd"));
        match cmd {
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }
}

/// Checks that a V1 layer ID is 64 lowercase hex characters.
pub fn validate_v1_id(id: &str) -> Result<(), PullError> {
    if VALID_HEX.is_match(id) {
        Ok(())
    } else {
        Err(PullError::InvalidManifest(format!(
            "image ID '{}' is invalid",
            id
        )))
    }
}

/// Builds the history entry for one layer from its V1 image JSON.
pub fn history_from_v1_config(raw: &[u8], empty_layer: bool) -> Result<History, PullError> {
    let v1: V1Image = serde_json::from_slice(raw)?;
    Ok(History {
        created: v1.created,
        author: v1.author.clone(),
        created_by: v1.created_by(),
        comment: v1.comment.clone(),
        empty_layer,
    })
}

/// Turns the V1 image JSON of an image's top layer into a configuration
/// carrying the given root filesystem and history.
///
/// Fields describing the layer itself rather than the image are dropped.
/// Every other field is carried over as is.
pub fn make_config_from_v1_config(
    raw: &[u8],
    rootfs: &RootFs,
    history: &[History],
) -> Result<Vec<u8>, PullError> {
    #[derive(Deserialize)]
    struct DockerVersion {
        #[serde(default)]
        docker_version: String,
    }
    let version: DockerVersion = serde_json::from_slice(raw)?;

    let normalised;
    let raw = if version_less_than(&version.docker_version, NO_FALLBACK_MIN_VERSION) {
        let v1: V1Image = serde_json::from_slice(raw)?;
        normalised = serde_json::to_vec(&v1)?;
        normalised.as_slice()
    } else {
        raw
    };

    let mut config: Map<String, Value> = serde_json::from_slice(raw)?;
    for key in &["id", "parent", "Size", "parent_id", "layer_id", "throwaway"] {
        config.remove(*key);
    }
    config.insert("rootfs".to_owned(), serde_json::to_value(rootfs)?);
    config.insert("history".to_owned(), serde_json::to_value(history)?);
    Ok(serde_json::to_vec(&config)?)
}

/// Reads the root filesystem declared by an image configuration.
pub fn rootfs_from_config(config: &[u8]) -> Result<RootFs, PullError> {
    #[derive(Deserialize)]
    struct Partial {
        rootfs: Option<RootFs>,
    }
    let partial: Partial = serde_json::from_slice(config)?;
    match partial.rootfs {
        Some(rootfs) if rootfs.kind == TYPE_LAYERS => Ok(rootfs),
        _ => Err(PullError::RootFsInvalid),
    }
}

// Compares dotted version strings field by field. Missing or non-numeric
// fields count as zero.
fn version_less_than(v: &str, other: &str) -> bool {
    let a: Vec<&str> = v.split('.').collect();
    let b: Vec<&str> = other.split('.').collect();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let y = b.get(i).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        if x != y {
            return x < y;
        }
    }
    false
}
