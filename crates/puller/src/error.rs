//! Errors produced while pulling an image, and how they are classified for
//! retries and for falling back to another endpoint.
use distribution::digest::DigestError;
use distribution::errors::{OciErrorCode, RegistryError};
use distribution::reference::ParseError;
use distribution::Digest;

/// Everything that can go wrong during a pull.
#[derive(Debug, thiserror::Error)]
pub enum PullError {
    /// The layers that were downloaded do not match the image configuration.
    #[error("layers from manifest don't match image configuration")]
    RootFsMismatch,
    /// The image configuration has no usable `rootfs`.
    #[error("invalid rootfs in image configuration")]
    RootFsInvalid,
    /// Fetching the image configuration failed.
    #[error("error pulling image configuration: {0}")]
    ImageConfigPull(Box<PullError>),
    /// No entry of a manifest list targets the requested platform.
    #[error("no matching manifest for {platform} in the manifest list entries")]
    NoMatches {
        /// The requested platform.
        platform: String,
    },
    /// A schema2 manifest points at a configuration of a kind we do not pull.
    #[error("Encountered remote {media_type:?}({class}) when fetching")]
    InvalidManifestClass {
        /// The configuration media type.
        media_type: String,
        /// The class that media type belongs to.
        class: String,
    },
    /// A manifest fetched by digest does not match that digest.
    #[error("manifest verification failed for digest {0}")]
    ManifestVerification(Digest),
    /// An image configuration does not match its digest.
    #[error("image config verification failed for digest {0}")]
    ConfigVerification(Digest),
    /// A downloaded layer does not match its digest.
    #[error("filesystem layer verification failed for digest {0}")]
    LayerVerification(Digest),
    /// A manifest is structurally invalid.
    #[error("{0}")]
    InvalidManifest(String),
    /// A digest listed in a manifest is malformed.
    #[error("could not validate layer digest {digest:?}: {source}")]
    InvalidDigest {
        /// The digest as listed.
        digest: String,
        /// Why it is invalid.
        source: DigestError,
    },
    /// A schema1 manifest was found but only schema2 content is accepted.
    #[error("invalid manifest: not schema2")]
    NotSchema2,
    /// The requested operating system cannot be pulled on this host.
    #[error("cannot download image with operating system {host:?} when requesting {requested:?}")]
    OsMismatch {
        /// The host operating system.
        host: String,
        /// The requested operating system.
        requested: String,
    },
    /// The pull failed in a way that suggests trying another endpoint.
    #[error("{source}")]
    Fallback {
        /// The underlying failure.
        source: Box<PullError>,
        /// Whether the transport itself worked.
        transport_ok: bool,
    },
    /// The wrapped failure must not be retried.
    #[error("{0}")]
    DoNotRetry(Box<PullError>),
    /// The registry returned an error.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Local I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A JSON document could not be decoded.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A reference could not be built.
    #[error(transparent)]
    Reference(#[from] ParseError),
    /// The pull was cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// A local store failed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PullError {
    /// Whether a retry loop may try the failed operation again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PullError::DoNotRetry(_) | PullError::Cancelled)
    }

    /// The failure with retry and fallback wrappers removed.
    pub fn inner(&self) -> &PullError {
        match self {
            PullError::DoNotRetry(inner) => inner.inner(),
            PullError::Fallback { source, .. } => source.inner(),
            other => other,
        }
    }

    /// Wraps the error so retry loops give up on it.
    pub fn do_not_retry(self) -> PullError {
        match self {
            e @ PullError::DoNotRetry(_) => e,
            e => PullError::DoNotRetry(Box::new(e)),
        }
    }
}

/// Marks errors that no amount of retrying will fix as do-not-retry.
///
/// Authorization failures, unsupported operations, rate limiting, unknown
/// names and blobs, unexpected HTTP statuses and a full disk all fall into
/// that group. Everything else is left retryable.
pub fn retry_on_error(err: PullError) -> PullError {
    let fatal = match &err {
        PullError::Registry(e) => match e {
            RegistryError::Api(api) => matches!(
                api.code,
                OciErrorCode::Unauthorized
                    | OciErrorCode::Unsupported
                    | OciErrorCode::Denied
                    | OciErrorCode::Toomanyrequests
                    | OciErrorCode::NameUnknown
                    | OciErrorCode::BlobUnknown
            ),
            RegistryError::Unauthorized(_) | RegistryError::UnexpectedStatus { .. } => true,
            RegistryError::NotFound(_) => true,
            RegistryError::Io(io) => is_no_space(io),
            _ => false,
        },
        PullError::Io(io) => is_no_space(io),
        _ => false,
    };
    if fatal {
        err.do_not_retry()
    } else {
        err
    }
}

fn is_no_space(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::StorageFull
}

/// Decides whether a failed pull should be retried against another
/// endpoint or protocol version.
pub trait FallbackPolicy: Send + Sync {
    /// Whether `err` warrants falling back.
    fn should_fall_back(&self, err: &PullError) -> bool;
}

/// Falls back on transport failures and unexpected HTTP statuses.
///
/// Errors reported by the registry itself only cause a fallback when the
/// endpoint is a mirror, since the upstream registry may still have the
/// content. Integrity and protocol failures never do.
#[derive(Clone, Debug, Default)]
pub struct DefaultFallbackPolicy {
    /// Whether the endpoint being pulled from is a mirror.
    pub mirror: bool,
}

impl FallbackPolicy for DefaultFallbackPolicy {
    fn should_fall_back(&self, err: &PullError) -> bool {
        match err {
            PullError::Registry(e) => match e {
                RegistryError::Api(_) | RegistryError::NotFound(_) => self.mirror,
                RegistryError::UnexpectedStatus { .. }
                | RegistryError::Http(_)
                | RegistryError::Io(_)
                | RegistryError::Unauthorized(_)
                | RegistryError::RangeNotSupported(_) => true,
                RegistryError::Manifest(_)
                | RegistryError::Digest(_)
                | RegistryError::Reference(_) => false,
            },
            PullError::DoNotRetry(inner) => self.should_fall_back(inner),
            PullError::Io(_) => true,
            _ => false,
        }
    }
}
