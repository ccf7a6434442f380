//! Image references: `registry/repository[:tag][@digest]`.
use std::convert::{Into, TryFrom};
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::digest::Digest;

/// NAME_TOTAL_LENGTH_MAX is the maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

const DOCKER_HUB_DOMAIN: &str = "docker.io";
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";

lazy_static! {
    static ref TAG_REGEXP: Regex = Regex::new(r"^[\w][\w.-]{0,127}$").unwrap();
    static ref PATH_COMPONENT_REGEXP: Regex =
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$").unwrap();
}

/// Errors produced when parsing an image reference.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The digest part is not a valid digest.
    DigestInvalidFormat,
    /// The repository name contains uppercase characters.
    NameContainsUppercase,
    /// The repository name is empty.
    NameEmpty,
    /// A path component of the repository name is malformed.
    NameNotCanonical,
    /// The repository name is too long.
    NameTooLong,
    /// The reference as a whole is malformed.
    ReferenceInvalidFormat,
    /// The tag part is malformed.
    TagInvalidFormat,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestInvalidFormat => write!(f, "invalid digest format"),
            ParseError::NameContainsUppercase => write!(f, "repository name must be lowercase"),
            ParseError::NameEmpty => write!(f, "repository name must have at least one component"),
            ParseError::NameNotCanonical => write!(f, "repository name must be canonical"),
            ParseError::NameTooLong => write!(
                f,
                "repository name must not be more than {} characters",
                NAME_TOTAL_LENGTH_MAX
            ),
            ParseError::ReferenceInvalidFormat => write!(f, "invalid reference format"),
            ParseError::TagInvalidFormat => write!(f, "invalid tag format"),
        }
    }
}

impl Error for ParseError {}

/// Reference provides a general type to represent any way of referencing images within a registry.
///
/// A reference always names a repository and may additionally carry a tag
/// (a mutable pointer to content) and/or a digest (an immutable content address).
///
/// # Examples
///
/// Parsing a tagged image reference:
///
/// ```
/// use distribution::Reference;
///
/// let reference: Reference = "docker.io/library/hello-world:latest".parse().unwrap();
///
/// assert_eq!("docker.io/library/hello-world:latest", reference.whole().as_str());
/// assert_eq!("docker.io", reference.registry());
/// assert_eq!("library/hello-world", reference.repository());
/// assert_eq!(Some("latest"), reference.tag());
/// assert_eq!(None, reference.digest());
/// assert_eq!("hello-world:latest", reference.familiar_string());
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// registry returns the name of the registry.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// resolve_registry returns the host to contact for the registry.
    ///
    /// Docker Hub is addressed as `docker.io` in references but served from a
    /// different host.
    pub fn resolve_registry(&self) -> &str {
        match self.registry.as_str() {
            DOCKER_HUB_DOMAIN => DOCKER_HUB_REGISTRY,
            registry => registry,
        }
    }

    /// repository returns the name of the repository.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// tag returns the object's tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// digest returns the object's digest, if present.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Whether the reference names a repository without a tag or a digest.
    pub fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// Returns the name-only form of this reference.
    pub fn trim(&self) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: None,
        }
    }

    /// Returns a copy of this reference carrying the given tag.
    pub fn with_tag(&self, tag: &str) -> Result<Reference, ParseError> {
        if !TAG_REGEXP.is_match(tag) {
            return Err(ParseError::TagInvalidFormat);
        }
        Ok(Reference {
            tag: Some(tag.to_owned()),
            ..self.clone()
        })
    }

    /// Returns a copy of this reference carrying the given digest.
    pub fn with_digest(&self, digest: Digest) -> Reference {
        Reference {
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// full_name returns the full repository name and path.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// familiar_name returns the shortened name users are used to seeing:
    /// the Docker Hub domain and the `library/` prefix of official images are
    /// dropped.
    pub fn familiar_name(&self) -> String {
        if self.registry != DOCKER_HUB_DOMAIN {
            return self.full_name();
        }
        match self.repository.strip_prefix(OFFICIAL_REPO_PREFIX) {
            Some(rest) if !rest.contains('/') => rest.to_owned(),
            _ => self.repository.clone(),
        }
    }

    /// familiar_string returns the familiar name together with any tag and digest.
    pub fn familiar_string(&self) -> String {
        self.append_tag_and_digest(self.familiar_name())
    }

    /// whole returns the whole reference.
    pub fn whole(&self) -> String {
        self.append_tag_and_digest(self.full_name())
    }

    fn append_tag_and_digest(&self, mut s: String) -> String {
        if let Some(t) = self.tag() {
            s.push(':');
            s.push_str(t);
        }
        if let Some(d) = self.digest() {
            s.push('@');
            s.push_str(&d.to_string());
        }
        s
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

impl TryFrom<String> for Reference {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let repo_start = s.find('/').ok_or(ParseError::ReferenceInvalidFormat)?;
        if repo_start == 0 {
            return Err(ParseError::ReferenceInvalidFormat);
        }

        // Everything after the first '@' is the digest; a tag, if any, is the
        // part after the last ':' of the remaining path.
        let (name_and_tag, digest) = match s[repo_start + 1..].find('@') {
            Some(i) => {
                let at = repo_start + 1 + i;
                let digest = s[at + 1..]
                    .parse::<Digest>()
                    .map_err(|_| ParseError::DigestInvalidFormat)?;
                (&s[..at], Some(digest))
            }
            None => (s.as_str(), None),
        };
        let (name, tag) = match name_and_tag[repo_start + 1..].rfind(':') {
            Some(i) => {
                let colon = repo_start + 1 + i;
                let tag = &name_and_tag[colon + 1..];
                if !TAG_REGEXP.is_match(tag) {
                    return Err(ParseError::TagInvalidFormat);
                }
                (&name_and_tag[..colon], Some(tag.to_owned()))
            }
            None => (name_and_tag, None),
        };

        let repository = &name[repo_start + 1..];
        if repository.is_empty() {
            return Err(ParseError::NameEmpty);
        }
        if repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong);
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseError::NameContainsUppercase);
        }
        if !repository
            .split('/')
            .all(|component| PATH_COMPONENT_REGEXP.is_match(component))
        {
            return Err(ParseError::NameNotCanonical);
        }

        Ok(Reference {
            registry: name[..repo_start].to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;
    fn try_from(string: &str) -> Result<Self, Self::Error> {
        TryFrom::try_from(string.to_owned())
    }
}

impl Into<String> for Reference {
    fn into(self) -> String {
        self.whole()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DIGEST: &str = "sha256:f29dba55022eec8c0ce1cbfaaed45f2352ab3fbbb1cdcd5ea30ca3513deb70c9";

    mod parse {
        use super::*;

        fn must_parse(image: &str) -> Reference {
            Reference::try_from(image).expect("could not parse reference")
        }

        fn validate_registry_and_repository(reference: &Reference) {
            assert_eq!(reference.registry(), "webassembly.azurecr.io");
            assert_eq!(reference.repository(), "hello");
        }

        fn validate_tag(reference: &Reference) {
            assert_eq!(reference.tag(), Some("v1"));
        }

        fn validate_digest(reference: &Reference) {
            assert_eq!(reference.digest().map(|d| d.to_string()).as_deref(), Some(DIGEST));
        }

        #[test]
        fn name_too_long() {
            assert_eq!(
                Reference::try_from(format!(
                    "webassembly.azurecr.io/{}",
                    (0..256).map(|_| "a").collect::<String>()
                ))
                .err(),
                Some(ParseError::NameTooLong)
            );
        }

        #[test]
        fn owned_string() {
            let reference = Reference::from_str("webassembly.azurecr.io/hello:v1")
                .expect("could not parse reference");

            validate_registry_and_repository(&reference);
            validate_tag(&reference);
            assert_eq!(reference.digest(), None);
        }

        #[test]
        fn tag_only() {
            let reference = must_parse("webassembly.azurecr.io/hello:v1");

            validate_registry_and_repository(&reference);
            validate_tag(&reference);
            assert_eq!(reference.digest(), None);
        }

        #[test]
        fn digest_only() {
            let reference = must_parse(&format!("webassembly.azurecr.io/hello@{}", DIGEST));

            validate_registry_and_repository(&reference);
            validate_digest(&reference);
            assert_eq!(reference.tag(), None);
        }

        #[test]
        fn tag_and_digest() {
            let reference = must_parse(&format!("webassembly.azurecr.io/hello:v1@{}", DIGEST));

            validate_registry_and_repository(&reference);
            validate_tag(&reference);
            validate_digest(&reference);
        }

        #[test]
        fn no_tag_or_digest() {
            let reference = must_parse("webassembly.azurecr.io/hello");

            validate_registry_and_repository(&reference);
            assert!(reference.is_name_only());
        }

        #[test]
        fn registry_with_port() {
            let reference = must_parse("localhost:5000/team/app:v2");
            assert_eq!(reference.registry(), "localhost:5000");
            assert_eq!(reference.repository(), "team/app");
            assert_eq!(reference.tag(), Some("v2"));
        }

        #[test]
        fn missing_slash_char() {
            Reference::try_from("webassembly.azurecr.io:hello")
                .expect_err("no slash should produce an error");
        }

        #[test]
        fn bad_digest() {
            assert_eq!(
                Reference::try_from("example.com/app@sha256:123").err(),
                Some(ParseError::DigestInvalidFormat)
            );
        }

        #[test]
        fn bad_tag() {
            assert_eq!(
                Reference::try_from("example.com/app:-v1").err(),
                Some(ParseError::TagInvalidFormat)
            );
        }

        #[test]
        fn uppercase_name() {
            assert_eq!(
                Reference::try_from("example.com/App:v1").err(),
                Some(ParseError::NameContainsUppercase)
            );
        }
    }

    #[test]
    fn familiar_forms_strip_docker_hub() {
        let reference: Reference = "docker.io/library/busybox:latest".parse().unwrap();
        assert_eq!("busybox", reference.familiar_name());
        assert_eq!("busybox:latest", reference.familiar_string());
        assert_eq!("registry-1.docker.io", reference.resolve_registry());

        let reference: Reference = "docker.io/someone/tool".parse().unwrap();
        assert_eq!("someone/tool", reference.familiar_name());

        let reference: Reference = "example.com/app:v1".parse().unwrap();
        assert_eq!("example.com/app:v1", reference.familiar_string());
        assert_eq!("example.com", reference.resolve_registry());
    }

    #[test]
    fn derived_references() {
        let reference: Reference = "example.com/app:v1".parse().unwrap();
        let digest: Digest = DIGEST.parse().unwrap();
        let canonical = reference.trim().with_digest(digest);
        assert_eq!(format!("example.com/app@{}", DIGEST), canonical.whole());
        let retagged = reference.trim().with_tag("v2").unwrap();
        assert_eq!("example.com/app:v2", retagged.whole());
        assert!(reference.trim().with_tag("bad tag").is_err());
    }
}
