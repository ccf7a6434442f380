//! Content digests and incremental verification of content against them.
//!
//! A [`Digest`] is the `algorithm:hex` content address used throughout the
//! distribution protocol for blobs and manifests. A [`Verifier`] accumulates
//! bytes as they stream past and answers whether they hash to the expected
//! digest.
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha512};

/// The hash algorithms accepted in a digest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    #[allow(missing_docs)]
    Sha256,
    #[allow(missing_docs)]
    Sha512,
}

impl Algorithm {
    /// The name of the algorithm as it appears in a digest string.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

/// Errors produced when parsing a digest string.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    /// The string is not of the form `algorithm:hex`.
    #[error("invalid checksum digest format")]
    InvalidFormat,
    /// The algorithm is not one we can verify.
    #[error("unsupported digest algorithm")]
    UnsupportedAlgorithm,
    /// The hex portion has the wrong length for the algorithm.
    #[error("invalid checksum digest length")]
    InvalidLength,
}

/// A content address of the form `algorithm:hex`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Computes the canonical (SHA256) digest of the given bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut digester = Digester::new(Algorithm::Sha256);
        digester.update(bytes);
        digester.finish()
    }

    /// The algorithm portion of the digest.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The encoded (hex) portion of the digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// A short identifier for display purposes: the first 12 hex characters.
    pub fn short_id(&self) -> &str {
        &self.hex[..12]
    }

    /// Returns a verifier that checks content against this digest.
    pub fn verifier(&self) -> Verifier {
        Verifier {
            expected: self.clone(),
            digester: Digester::new(self.algorithm),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s.split_once(':').ok_or(DigestError::InvalidFormat)?;
        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            "" => return Err(DigestError::InvalidFormat),
            _ => return Err(DigestError::UnsupportedAlgorithm),
        };
        if hex.len() != algorithm.hex_len() {
            return Err(DigestError::InvalidLength);
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::InvalidFormat);
        }
        Ok(Digest {
            algorithm,
            hex: hex.to_owned(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

#[derive(Clone)]
enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Computes a digest over content fed to it incrementally.
#[derive(Clone)]
pub struct Digester {
    algorithm: Algorithm,
    hasher: Hasher,
}

impl Digester {
    /// Creates a digester for the given algorithm.
    pub fn new(algorithm: Algorithm) -> Self {
        let hasher = match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Digester { algorithm, hasher }
    }

    /// Feeds more content into the digest.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// The digest of everything fed so far.
    pub fn finish(self) -> Digest {
        let hex = match self.hasher {
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
            Hasher::Sha512(h) => format!("{:x}", h.finalize()),
        };
        Digest {
            algorithm: self.algorithm,
            hex,
        }
    }
}

impl std::io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Accumulates content and reports whether it matches an expected digest.
///
/// The verifier can be fed across several resumed transfers; only a full
/// restart of the content requires a fresh verifier.
#[derive(Clone)]
pub struct Verifier {
    expected: Digest,
    digester: Digester,
}

impl Verifier {
    /// Feeds more content into the verifier.
    pub fn update(&mut self, data: &[u8]) {
        self.digester.update(data)
    }

    /// Whether the content fed so far hashes to the expected digest.
    pub fn verified(&self) -> bool {
        self.digester.clone().finish() == self.expected
    }

    /// The digest the content is expected to match.
    pub fn expected(&self) -> &Digest {
        &self.expected
    }
}

impl std::io::Write for Verifier {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    const HELLO_SHA256: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn computes_sha256_of_bytes() {
        assert_eq!(HELLO_SHA256, Digest::from_bytes(b"hello").to_string());
    }

    #[test]
    fn verifier_accumulates_across_writes() {
        let digest: Digest = HELLO_SHA256.parse().expect("valid digest");
        let mut verifier = digest.verifier();
        verifier.write_all(b"he").unwrap();
        assert!(!verifier.verified());
        verifier.write_all(b"llo").unwrap();
        assert!(verifier.verified());
        verifier.update(b"!");
        assert!(!verifier.verified());
    }

    #[test]
    fn short_id_is_twelve_characters() {
        let digest: Digest = HELLO_SHA256.parse().unwrap();
        assert_eq!("2cf24dba5fb0", digest.short_id());
    }

    #[test]
    fn rejects_malformed_digests() {
        assert_eq!(
            Err(DigestError::InvalidFormat),
            "2cf24dba5fb0".parse::<Digest>()
        );
        assert_eq!(
            Err(DigestError::UnsupportedAlgorithm),
            "md5:d41d8cd98f00b204e9800998ecf8427e".parse::<Digest>()
        );
        assert_eq!(Err(DigestError::InvalidLength), "sha256:abc".parse::<Digest>());
        assert_eq!(
            Err(DigestError::InvalidFormat),
            HELLO_SHA256.to_uppercase().replace("SHA256", "sha256").parse::<Digest>()
        );
    }

    #[test]
    fn sha512_digests_verify() {
        let mut digester = Digester::new(Algorithm::Sha512);
        digester.update(b"hello");
        let digest = digester.finish();
        assert_eq!(128, digest.hex().len());
        let mut verifier = digest.verifier();
        verifier.update(b"hello");
        assert!(verifier.verified());
    }

    #[test]
    fn serializes_as_a_string() {
        let digest: Digest = HELLO_SHA256.parse().unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(format!("\"{}\"", HELLO_SHA256), json);
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, back);
        assert!(serde_json::from_str::<Digest>("\"sha256:nope\"").is_err());
    }
}
