//! Configuration for an image pull
//!
//! The best way to configure a pull is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::from_opts`] with
//! the parsed [`Opts`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use distribution::manifest::Platform;

#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::backoff::ExponentialBackoffStrategy;
use crate::download::DownloadManager;
use crate::error::FallbackPolicy;
use crate::progress::ProgressOutput;
use crate::store::{ContentStore, ImageStore, MetadataStore, ReferenceStore};

const DEFAULT_CONFIG_ATTEMPTS: u32 = 5;
const DEFAULT_CONFIG_BACKOFF: Duration = Duration::from_millis(250);
const DEFAULT_DOWNLOAD_ATTEMPTS: u32 = 5;
const DEFAULT_DOWNLOAD_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// How often, and how patiently, a failed operation is retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The total number of attempts, including the first one.
    pub attempts: u32,
    /// The wait before the first retry; later waits double.
    pub base: Duration,
    /// The longest wait between two attempts.
    pub cap: Duration,
}

impl RetryPolicy {
    /// A fresh backoff strategy following this policy.
    pub fn backoff(&self) -> ExponentialBackoffStrategy {
        ExponentialBackoffStrategy::new(self.base, self.cap)
    }
}

/// The options that control how images are pulled.
///
/// This can be configured manually in your code or if you are exposing a CLI, use
/// [`Config::from_opts`] (this requires the "cli" feature to be enabled).
///
/// Use [`Config::default_config`] to generate a config with all
/// of the default values set.
#[derive(Clone, Debug)]
pub struct Config {
    /// The platform to select from manifest lists. `None` selects the host platform.
    pub platform: Option<Platform>,
    /// Refuse legacy schema1 manifests.
    pub require_schema2: bool,
    /// The config media types a schema2 manifest may point at. Empty means
    /// the built-in set of image config types.
    pub schema2_types: Vec<String>,
    /// Whether the registry being pulled from is a mirror.
    pub mirror: bool,
    /// Retries for fetching image configurations.
    pub config_retry: RetryPolicy,
    /// Retries for downloading layers.
    pub download_retry: RetryPolicy,
    /// How many layers are downloaded at the same time.
    pub max_concurrent_downloads: usize,
    /// The directory where images, layers and references are stored.
    pub data_dir: PathBuf,
    /// Registries reached over plain HTTP.
    pub insecure_registries: Vec<String>,
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    pub fn default_config() -> anyhow::Result<Self> {
        Ok(Config {
            platform: None,
            require_schema2: false,
            schema2_types: Vec::new(),
            mirror: false,
            config_retry: RetryPolicy {
                attempts: DEFAULT_CONFIG_ATTEMPTS,
                base: DEFAULT_CONFIG_BACKOFF,
                cap: DEFAULT_BACKOFF_CAP,
            },
            download_retry: RetryPolicy {
                attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
                base: DEFAULT_DOWNLOAD_BACKOFF,
                cap: DEFAULT_BACKOFF_CAP,
            },
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            data_dir: default_data_dir()?,
            insecure_registries: Vec::new(),
        })
    }

    /// Builds a config from parsed command line flags, filling in defaults
    /// for everything not given.
    #[cfg(feature = "cli")]
    pub fn from_opts(opts: Opts) -> anyhow::Result<Self> {
        let mut config = Config::default_config()?;
        config.platform = opts
            .platform
            .as_deref()
            .map(crate::platform::parse)
            .transpose()?;
        config.require_schema2 = opts.require_schema2;
        config.schema2_types = opts.schema2_types;
        config.mirror = opts.mirror;
        config.max_concurrent_downloads = opts.max_concurrent_downloads.max(1);
        config.insecure_registries = opts.insecure_registries;
        if let Some(dir) = opts.data_dir {
            config.data_dir = dir;
        }
        Ok(config)
    }

    /// The config media types a schema2 manifest may point at.
    pub fn allowed_config_types(&self) -> Vec<&str> {
        if self.schema2_types.is_empty() {
            distribution::manifest::IMAGE_TYPES.to_vec()
        } else {
            self.schema2_types.iter().map(|s| s.as_str()).collect()
        }
    }
}

/// The services a pull talks to besides the registry.
#[derive(Clone)]
pub struct ImagePullConfig {
    /// The pull options.
    pub config: Config,
    /// Where image configurations are committed.
    pub image_store: Arc<dyn ImageStore>,
    /// Where tags and digests are mapped to image IDs.
    pub reference_store: Arc<dyn ReferenceStore>,
    /// Downloads and registers layers.
    pub download_manager: Arc<dyn DownloadManager>,
    /// The optional diff-ID cache.
    pub metadata_store: Option<Arc<dyn MetadataStore>>,
    /// The optional local manifest cache.
    pub content_store: Option<Arc<dyn ContentStore>>,
    /// Receives progress messages.
    pub progress: Arc<dyn ProgressOutput>,
    /// Decides when a failure should be retried elsewhere.
    pub fallback_policy: Arc<dyn FallbackPolicy>,
}

/// CLI options that can be configured for a pull
///
/// These are meant to be flattened into an application's own options.
#[derive(StructOpt, Clone, Debug)]
#[cfg(feature = "cli")]
pub struct Opts {
    #[structopt(
        long = "platform",
        env = "IMGPULL_PLATFORM",
        help = "The platform to pull, as os/arch[/variant]. Defaults to the host platform"
    )]
    platform: Option<String>,

    #[structopt(
        long = "require-schema2",
        env = "IMGPULL_REQUIRE_SCHEMA2",
        help = "Refuse to pull images that only have legacy schema1 manifests"
    )]
    require_schema2: bool,

    #[structopt(
        long = "schema2-type",
        env = "IMGPULL_SCHEMA2_TYPES",
        use_delimiter = true,
        help = "Config media types to accept in schema2 manifests. Defaults to the image config types"
    )]
    schema2_types: Vec<String>,

    #[structopt(
        long = "mirror",
        env = "IMGPULL_MIRROR",
        help = "Treat the registry as a mirror when deciding whether to fall back"
    )]
    mirror: bool,

    #[structopt(
        long = "max-concurrent-downloads",
        default_value = "3",
        env = "IMGPULL_MAX_CONCURRENT_DOWNLOADS",
        help = "How many layers to download at the same time"
    )]
    max_concurrent_downloads: usize,

    #[structopt(
        long = "insecure-registry",
        env = "IMGPULL_INSECURE_REGISTRIES",
        use_delimiter = true,
        help = "Registries to reach over plain HTTP"
    )]
    insecure_registries: Vec<String>,

    #[structopt(
        long = "data-dir",
        env = "IMGPULL_DATA_DIR",
        help = "The data path for image, layer and reference storage. Defaults to $HOME/.imgpull"
    )]
    data_dir: Option<PathBuf>,
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Unable to get home directory"))?
        .join(".imgpull"))
}
