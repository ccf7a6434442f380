//! Registry client
//!
//! An HTTP implementation of the [repository](crate::repository) traits for
//! registries speaking the v2 distribution protocol. Only the read side of
//! the protocol is implemented.

use crate::digest::Digest;
use crate::errors::*;
use crate::manifest::{Descriptor, Manifest, MIME_TYPES_DISTRIBUTION_MANIFEST};
use crate::reference::Reference;
use crate::repository::{
    BlobService, BlobStream, ManifestService, Registry, Repository, TagService,
};
use crate::secrets::*;
use crate::token_cache::{RegistryToken, RegistryTokenType, TokenCache};

use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
use hyperx::header::Header;
use reqwest::header::{HeaderMap, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::io::StreamReader;
use tracing::{debug, trace};
use www_authenticate::{Challenge, ChallengeFields, RawChallenge, WwwAuthenticate};

/// The registry client connects to a registry and fetches manifests, blobs
/// and tags.
///
/// Most registries require at least an OAuth2 handshake even for anonymous
/// pulls. The client performs it lazily, the first time a repository is used,
/// and caches the granted token per repository until it expires.
///
/// Clones share their token cache and connection pool.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    auth: RegistryAuth,
    tokens: Arc<RwLock<TokenCache>>,
    client: reqwest::Client,
}

impl Client {
    /// Create a new client with the supplied config and credentials
    pub fn new(config: ClientConfig, auth: RegistryAuth) -> Result<Self, RegistryError> {
        let client_builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certificates);

        Ok(Self {
            config,
            auth,
            tokens: Arc::new(RwLock::new(TokenCache::new())),
            client: client_builder.build()?,
        })
    }

    /// Perform an OAuth v2 auth request if necessary.
    ///
    /// This performs authorization and then stores the token internally to be used
    /// on other requests.
    pub async fn auth(&self, image: &Reference) -> Result<(), RegistryError> {
        debug!("Authorizing for image: {:?}", image);
        // The version request will tell us where to go.
        let url = format!(
            "{}://{}/v2/",
            self.config.protocol.scheme_for(image.resolve_registry()),
            image.resolve_registry()
        );
        debug!(?url);
        let res = self.client.get(&url).send().await?;
        let dist_hdr = match res.headers().get(reqwest::header::WWW_AUTHENTICATE) {
            Some(h) => h,
            None => {
                if !res.status().is_success() {
                    return Err(error_from_response(res).await);
                }
                self.tokens
                    .write()
                    .await
                    .insert(image, RegistryTokenType::Unchallenged);
                return Ok(());
            }
        };

        let auth = WwwAuthenticate::parse_header(&dist_hdr.as_bytes().into())
            .map_err(|e| RegistryError::Unauthorized(format!("bad challenge: {}", e)))?;
        // A header without a bearer challenge asks for basic credentials,
        // which are attached to every request as-is.
        let challenge = match auth.get::<BearerChallenge>().and_then(|c| c.into_iter().next()) {
            Some(c) => c,
            None => {
                self.tokens
                    .write()
                    .await
                    .insert(image, RegistryTokenType::Unchallenged);
                return Ok(());
            }
        };

        let scope = format!("repository:{}:pull", image.repository());
        let realm = challenge
            .realm
            .ok_or_else(|| RegistryError::Unauthorized("challenge has no realm".into()))?;
        let mut query = vec![("scope", scope.clone())];
        if let Some(s) = challenge.service.clone() {
            query.push(("service", s))
        }

        debug!(%realm, service = ?challenge.service, %scope, "Making authentication call");

        let auth_res = self
            .client
            .get(&realm)
            .query(&query)
            .apply_authentication(&self.auth)
            .send()
            .await?;

        match auth_res.status() {
            StatusCode::OK => {
                let text = auth_res.text().await?;
                trace!("Received response from auth request: {}", text);
                let token: RegistryToken = serde_json::from_str(&text).map_err(|e| {
                    RegistryError::Unauthorized(format!("failed to decode registry token: {}", e))
                })?;
                debug!("Successfully authorized for image '{:?}'", image);
                self.tokens
                    .write()
                    .await
                    .insert(image, RegistryTokenType::Bearer(token));
                Ok(())
            }
            _ => {
                let reason = auth_res.text().await?;
                debug!("Failed to authenticate for image '{:?}': {}", image, reason);
                Err(RegistryError::Unauthorized(reason))
            }
        }
    }

    async fn ensure_auth(&self, image: &Reference) -> Result<(), RegistryError> {
        if !self.tokens.read().await.contains_key(image) {
            self.auth(image).await?;
        }
        Ok(())
    }

    /// Pull a manifest by tag or digest.
    ///
    /// The manifest is decoded according to the `Content-Type` the registry
    /// served it with; its digest is not verified here.
    pub async fn pull_manifest(
        &self,
        image: &Reference,
        tag_or_digest: &str,
    ) -> Result<Manifest, RegistryError> {
        self.ensure_auth(image).await?;
        let url = self.to_v2_manifest_url(image, tag_or_digest);
        debug!("Pulling image manifest from {}", url);

        let res = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
            .apply_accept(MIME_TYPES_DISTRIBUTION_MANIFEST)
            .apply_auth(image)
            .await
            .into_request_builder()
            .send()
            .await?;

        if res.status() != StatusCode::OK {
            return Err(error_from_response(res).await);
        }
        let content_type = header_str(res.headers(), CONTENT_TYPE.as_str());
        let body = res.bytes().await?;
        Ok(Manifest::from_bytes(content_type.as_deref(), &body)?)
    }

    /// Resolve a tag to the descriptor of the manifest it points at.
    ///
    /// Will first attempt to read the `Docker-Content-Digest` header using a
    /// HEAD request. If this header is not present, will make a GET request
    /// and digest the manifest payload.
    pub async fn fetch_manifest_descriptor(
        &self,
        image: &Reference,
        tag: &str,
    ) -> Result<Descriptor, RegistryError> {
        self.ensure_auth(image).await?;
        let url = self.to_v2_manifest_url(image, tag);
        debug!("HEAD image manifest from {}", url);
        let res = RequestBuilderWrapper::from_client(self, |client| client.head(&url))
            .apply_accept(MIME_TYPES_DISTRIBUTION_MANIFEST)
            .apply_auth(image)
            .await
            .into_request_builder()
            .send()
            .await?;

        trace!(headers=?res.headers(), "Got Headers");
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(RegistryError::NotFound(format!("{} on {}", tag, url)))
            }
            _ => return Err(error_from_response(res).await),
        }

        let headers = res.headers();
        match header_str(headers, "Docker-Content-Digest") {
            Some(digest) => Ok(Descriptor {
                media_type: header_str(headers, CONTENT_TYPE.as_str()).unwrap_or_default(),
                digest: digest.parse::<Digest>()?.to_string(),
                size: header_str(headers, "Content-Length")
                    .and_then(|l| l.parse().ok())
                    .unwrap_or_default(),
                ..Default::default()
            }),
            None => {
                // Fall back to hashing the payload (seen with ECR).
                let manifest = self.pull_manifest(image, tag).await?;
                let digest = Digest::from_bytes(manifest.payload());
                debug!(%digest, "Computed digest of manifest payload.");
                Ok(Descriptor {
                    media_type: manifest.media_type().to_owned(),
                    digest: digest.to_string(),
                    size: manifest.payload().len() as i64,
                    ..Default::default()
                })
            }
        }
    }

    /// Pull a whole blob into memory.
    pub async fn pull_blob(
        &self,
        image: &Reference,
        digest: &Digest,
    ) -> Result<Vec<u8>, RegistryError> {
        let res = self.blob_request(image, digest, 0).await?;
        if res.status() != StatusCode::OK {
            return Err(error_from_response(res).await);
        }
        Ok(res.bytes().await?.to_vec())
    }

    /// Open a blob for streaming, starting `offset` bytes in.
    ///
    /// A registry that answers a ranged request with the whole blob, or
    /// rejects the range outright, yields [`RegistryError::RangeNotSupported`].
    pub async fn open_blob(
        &self,
        image: &Reference,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobStream, RegistryError> {
        let res = self.blob_request(image, digest, offset).await?;
        let total_size = match res.status() {
            StatusCode::OK if offset == 0 => res.content_length(),
            StatusCode::PARTIAL_CONTENT if offset > 0 => header_str(res.headers(), CONTENT_RANGE.as_str())
                .and_then(|range| content_range_total(&range))
                .or_else(|| res.content_length().map(|len| len + offset)),
            StatusCode::OK | StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(RegistryError::RangeNotSupported(digest.to_string()))
            }
            _ => return Err(error_from_response(res).await),
        };

        let stream = res
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(BlobStream {
            total_size,
            reader: Box::pin(StreamReader::new(stream)),
        })
    }

    async fn blob_request(
        &self,
        image: &Reference,
        digest: &Digest,
        offset: u64,
    ) -> Result<reqwest::Response, RegistryError> {
        self.ensure_auth(image).await?;
        let url = self.to_v2_blob_url(
            image.resolve_registry(),
            image.repository(),
            &digest.to_string(),
        );
        debug!(%url, offset, "Pulling blob");
        let mut request = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
            .apply_auth(image)
            .await
            .into_request_builder();
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        Ok(request.send().await?)
    }

    /// List every tag in the repository, following pagination links.
    pub async fn list_tags(&self, image: &Reference) -> Result<Vec<String>, RegistryError> {
        #[derive(serde::Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        self.ensure_auth(image).await?;
        let scheme = self.config.protocol.scheme_for(image.resolve_registry());
        let mut url = format!(
            "{}://{}/v2/{}/tags/list",
            scheme,
            image.resolve_registry(),
            image.repository()
        );
        let mut tags = Vec::new();
        loop {
            debug!(%url, "Listing tags");
            let res = RequestBuilderWrapper::from_client(self, |client| client.get(&url))
                .apply_auth(image)
                .await
                .into_request_builder()
                .send()
                .await?;
            if res.status() != StatusCode::OK {
                return Err(error_from_response(res).await);
            }
            let next = header_str(res.headers(), "Link").and_then(|link| next_link(&link));
            let page: TagList = res.json().await?;
            tags.extend(page.tags.unwrap_or_default());
            match next {
                Some(path) if path.starts_with('/') => {
                    url = format!("{}://{}{}", scheme, image.resolve_registry(), path)
                }
                Some(absolute) => url = absolute,
                None => return Ok(tags),
            }
        }
    }

    /// Convert a Reference and a tag or digest to a v2 manifest URL.
    fn to_v2_manifest_url(&self, reference: &Reference, tag_or_digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.config
                .protocol
                .scheme_for(reference.resolve_registry()),
            reference.resolve_registry(),
            reference.repository(),
            tag_or_digest,
        )
    }

    /// Convert a Reference to a v2 blob (layer) URL.
    fn to_v2_blob_url(&self, registry: &str, repository: &str, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            self.config.protocol.scheme_for(registry),
            registry,
            repository,
            digest,
        )
    }
}

#[async_trait]
impl Registry for Client {
    async fn repository(&self, name: &Reference) -> Result<Arc<dyn Repository>, RegistryError> {
        let name = name.trim();
        self.ensure_auth(&name).await?;
        Ok(Arc::new(RemoteRepository {
            client: self.clone(),
            name,
        }))
    }
}

/// A repository on a remote registry, reached through a [`Client`].
#[derive(Clone)]
pub struct RemoteRepository {
    client: Client,
    name: Reference,
}

impl RemoteRepository {
    /// Creates a handle on the named repository without contacting the registry.
    pub fn new(client: Client, name: &Reference) -> Self {
        RemoteRepository {
            client,
            name: name.trim(),
        }
    }
}

#[async_trait]
impl Repository for RemoteRepository {
    fn named(&self) -> &Reference {
        &self.name
    }

    async fn manifests(&self) -> Result<Arc<dyn ManifestService>, RegistryError> {
        self.client.ensure_auth(&self.name).await?;
        Ok(Arc::new(self.clone()))
    }

    fn blobs(&self) -> Arc<dyn BlobService> {
        Arc::new(self.clone())
    }

    fn tags(&self) -> Arc<dyn TagService> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ManifestService for RemoteRepository {
    async fn get(&self, digest: &Digest) -> Result<Manifest, RegistryError> {
        self.client
            .pull_manifest(&self.name, &digest.to_string())
            .await
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Manifest, RegistryError> {
        self.client.pull_manifest(&self.name, tag).await
    }
}

#[async_trait]
impl BlobService for RemoteRepository {
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
        self.client.pull_blob(&self.name, digest).await
    }

    async fn open(&self, digest: &Digest, offset: u64) -> Result<BlobStream, RegistryError> {
        self.client.open_blob(&self.name, digest, offset).await
    }
}

#[async_trait]
impl TagService for RemoteRepository {
    async fn get(&self, tag: &str) -> Result<Descriptor, RegistryError> {
        self.client.fetch_manifest_descriptor(&self.name, tag).await
    }

    async fn all(&self) -> Result<Vec<String>, RegistryError> {
        self.client.list_tags(&self.name).await
    }
}

/// The request builder wrapper allows to be instantiated from a
/// `Client` and allows composable operations on the request builder,
/// to produce a `RequestBuilder` object that can be executed.
struct RequestBuilderWrapper<'a> {
    client: &'a Client,
    request_builder: RequestBuilder,
}

// RequestBuilderWrapper type management
impl<'a> RequestBuilderWrapper<'a> {
    /// Create a `RequestBuilderWrapper` from a `Client` instance, by
    /// instantiating the internal `RequestBuilder` with the provided
    /// function `f`.
    fn from_client(
        client: &'a Client,
        f: impl Fn(&reqwest::Client) -> RequestBuilder,
    ) -> RequestBuilderWrapper<'a> {
        let request_builder = f(&client.client);
        RequestBuilderWrapper {
            client,
            request_builder,
        }
    }

    // Produces a final `RequestBuilder` out of this `RequestBuilderWrapper`
    fn into_request_builder(self) -> RequestBuilder {
        self.request_builder
    }
}

// Composable functions applicable to a `RequestBuilderWrapper`
impl<'a> RequestBuilderWrapper<'a> {
    fn apply_accept(self, accept: &[&str]) -> RequestBuilderWrapper<'a> {
        RequestBuilderWrapper {
            client: self.client,
            request_builder: self
                .request_builder
                .header(reqwest::header::ACCEPT, accept.join(", ")),
        }
    }

    /// Updates request as necessary for authentication.
    ///
    /// A cached bearer token goes into the Authorization header; otherwise
    /// the client's own credentials, if any, are attached.
    async fn apply_auth(self, image: &Reference) -> RequestBuilderWrapper<'a> {
        let token = self.client.tokens.read().await.get(image).cloned();
        let request_builder = match token {
            Some(RegistryTokenType::Bearer(token)) => {
                debug!("Using bearer token authentication.");
                self.request_builder
                    .header(reqwest::header::AUTHORIZATION, token.bearer_token())
            }
            _ => self.request_builder.apply_authentication(&self.client.auth),
        };
        RequestBuilderWrapper {
            client: self.client,
            request_builder,
        }
    }
}

/// A client configuration
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Which protocol the client should use
    pub protocol: ClientProtocol,

    /// Accept invalid certificates. Defaults to false
    pub accept_invalid_certificates: bool,
}

/// The protocol that the client should use to connect
#[derive(Debug, Clone, PartialEq)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    Https,
    #[allow(missing_docs)]
    HttpsExcept(Vec<String>),
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Https
    }
}

impl ClientProtocol {
    fn scheme_for(&self, registry: &str) -> &str {
        match self {
            ClientProtocol::Https => "https",
            ClientProtocol::Http => "http",
            ClientProtocol::HttpsExcept(exceptions) => {
                if exceptions.iter().any(|e| e == registry) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}

#[derive(Clone)]
struct BearerChallenge {
    pub realm: Option<String>,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge for BearerChallenge {
    fn challenge_name() -> &'static str {
        "Bearer"
    }

    fn from_raw(raw: RawChallenge) -> Option<Self> {
        match raw {
            RawChallenge::Token68(_) => None,
            RawChallenge::Fields(mut map) => Some(BearerChallenge {
                realm: map.remove("realm"),
                scope: map.remove("scope"),
                service: map.remove("service"),
            }),
        }
    }

    fn into_raw(self) -> RawChallenge {
        let mut map = ChallengeFields::new();
        if let Some(realm) = self.realm {
            map.insert_static_quoting("realm", realm);
        }
        if let Some(scope) = self.scope {
            map.insert_static_quoting("scope", scope);
        }
        if let Some(service) = self.service {
            map.insert_static_quoting("service", service);
        }
        RawChallenge::Fields(map)
    }
}

/// Turns a non-success response into a typed error, decoding the registry's
/// error envelope when there is one.
async fn error_from_response(res: reqwest::Response) -> RegistryError {
    let status = res.status();
    let url = res.url().to_string();
    let text = match res.text().await {
        Ok(text) => text,
        Err(e) => return RegistryError::Http(e),
    };
    if let Ok(envelope) = serde_json::from_str::<OciEnvelope>(&text) {
        if let Some(err) = envelope.errors.into_iter().next() {
            return RegistryError::Api(err);
        }
    }
    match status {
        StatusCode::NOT_FOUND => RegistryError::NotFound(url),
        StatusCode::UNAUTHORIZED => RegistryError::Unauthorized(format!("{} on {}", text, url)),
        s => RegistryError::UnexpectedStatus {
            status: s.as_u16(),
            url,
        },
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned())
}

/// Parses the total length out of a `Content-Range: bytes a-b/total` header.
fn content_range_total(range: &str) -> Option<u64> {
    range.rsplit_once('/').and_then(|(_, total)| total.parse().ok())
}

/// Extracts the target of a `Link: <...>; rel="next"` header.
fn next_link(link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(|t| t.to_owned())
    })
}
