//! Errors related to interacting with a remote registry

use crate::digest::DigestError;
use crate::manifest::ManifestError;
use crate::reference::ParseError;

/// The distribution specification defines a specific error format.
///
/// This struct represents that error format, which is formally described here:
/// https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug, Clone)]
pub struct OciError {
    /// The error code
    pub code: OciErrorCode,
    /// An optional message associated with the error
    #[serde(default)]
    pub message: String,
    /// Unstructured optional data associated with the error
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl std::error::Error for OciError {}

impl std::fmt::Display for OciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "registry API error ({:?}): {}", self.code, self.message)
    }
}

#[derive(serde::Deserialize)]
pub(crate) struct OciEnvelope {
    pub(crate) errors: Vec<OciError>,
}

/// Registry error codes
///
/// Outlined here: https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    /// Blob unknown to registry
    BlobUnknown,
    /// Blob upload is invalid
    BlobUploadInvalid,
    /// Blob upload is unknown to registry
    BlobUploadUnknown,
    /// Provided digest did not match uploaded content.
    DigestInvalid,
    /// Blob is unknown to registry
    ManifestBlobUnknown,
    /// Manifest is invalid
    ManifestInvalid,
    /// Manifest unknown
    ///
    /// This error is returned when the manifest, identified by name and tag is unknown to the repository.
    ManifestUnknown,
    /// Manifest failed signature validation
    ManifestUnverified,
    /// Invalid repository name
    NameInvalid,
    /// Repository name is not known
    NameUnknown,
    /// Provided length did not match content length
    SizeInvalid,
    /// Manifest tag did not match URI
    TagInvalid,
    /// Authentication required.
    Unauthorized,
    /// Requested access to the resource is denied
    Denied,
    /// This operation is unsupported
    Unsupported,
    /// Too many requests from client
    Toomanyrequests,
}

/// Everything that can go wrong talking to a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry answered 404 without a structured error.
    #[error("not found: {0}")]
    NotFound(String),
    /// The registry returned a structured error.
    #[error(transparent)]
    Api(#[from] OciError),
    /// A ranged request was not honored.
    #[error("registry does not support range requests for {0}")]
    RangeNotSupported(String),
    /// Authentication against the registry failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The registry answered with a status we do not understand.
    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus {
        /// The HTTP status code.
        status: u16,
        /// The requested URL.
        url: String,
    },
    /// The HTTP transport failed.
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    /// Local I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A manifest payload could not be decoded.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// A digest returned by the registry was malformed.
    #[error("invalid digest: {0}")]
    Digest(#[from] DigestError),
    /// A reference could not be built.
    #[error("invalid reference: {0}")]
    Reference(#[from] ParseError),
}

impl RegistryError {
    /// Whether the error means the named object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegistryError::NotFound(_) => true,
            RegistryError::Api(e) => matches!(
                e.code,
                OciErrorCode::ManifestUnknown | OciErrorCode::BlobUnknown | OciErrorCode::NameUnknown
            ),
            _ => false,
        }
    }

    /// The registry error code, if the registry returned one.
    pub fn code(&self) -> Option<OciErrorCode> {
        match self {
            RegistryError::Api(e) => Some(e.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE_ERROR: &str = r#"
      {"errors":[{"code":"UNAUTHORIZED","message":"authentication required","detail":[{"Type":"repository","Name":"app","Action":"pull"}]}]}
      "#;
    #[test]
    fn test_deserialize() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Unauthorized, e.code);
        assert_eq!("authentication required", e.message);
        assert_ne!(serde_json::value::Value::Null, e.detail);
    }

    const EXAMPLE_ERROR_TOOMANYREQUESTS: &str = r#"
      {"errors":[{"code":"TOOMANYREQUESTS","message":"pull request limit exceeded","detail":"You have reached your pull rate limit."}]}
      "#;
    #[test]
    fn test_deserialize_toomanyrequests() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_TOOMANYREQUESTS).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::Toomanyrequests, e.code);
        assert_eq!("pull request limit exceeded", e.message);
    }

    const EXAMPLE_ERROR_MISSING_DETAIL: &str = r#"
      {"errors":[{"code":"MANIFEST_UNKNOWN"}]}
      "#;
    #[test]
    fn test_deserialize_without_message_or_detail() {
        let envelope: OciEnvelope =
            serde_json::from_str(EXAMPLE_ERROR_MISSING_DETAIL).expect("parse example error");
        let e = &envelope.errors[0];
        assert_eq!(OciErrorCode::ManifestUnknown, e.code);
        assert_eq!(String::default(), e.message);
        assert_eq!(serde_json::value::Value::Null, e.detail);
    }

    #[test]
    fn not_found_classification() {
        let envelope: OciEnvelope = serde_json::from_str(EXAMPLE_ERROR_MISSING_DETAIL).unwrap();
        let api = RegistryError::from(envelope.errors[0].clone());
        assert!(api.is_not_found());
        assert_eq!(Some(OciErrorCode::ManifestUnknown), api.code());

        assert!(RegistryError::NotFound("blob".into()).is_not_found());
        assert!(!RegistryError::Unauthorized("nope".into()).is_not_found());
        assert!(!RegistryError::UnexpectedStatus {
            status: 500,
            url: "https://example.com/v2/".into()
        }
        .is_not_found());
    }
}
