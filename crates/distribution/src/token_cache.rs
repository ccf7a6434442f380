use crate::reference::Reference;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Tokens whose lifetime the registry does not state are assumed to last
/// this long, which is the minimum the token protocol guarantees.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// A token granted during the OAuth2-like workflow for registries.
#[derive(Deserialize, Clone)]
pub(crate) struct RegistryToken {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl RegistryToken {
    pub fn bearer_token(&self) -> String {
        format!("Bearer {}", self.token())
    }

    pub fn token(&self) -> &str {
        self.token
            .as_deref()
            .or(self.access_token.as_deref())
            .unwrap_or_default()
    }

    fn lifetime(&self) -> Duration {
        self.expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME)
    }
}

#[derive(Clone)]
pub(crate) enum RegistryTokenType {
    Bearer(RegistryToken),
    /// The registry did not ask for a bearer token; requests carry the
    /// client's own credentials, if any.
    Unchallenged,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Default)]
pub(crate) struct TokenCache {
    // (registry, repository) -> (token, expiration)
    tokens: BTreeMap<(String, String), (RegistryTokenType, u64)>,
}

impl TokenCache {
    pub(crate) fn new() -> Self {
        TokenCache {
            tokens: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, reference: &Reference, token: RegistryTokenType) {
        let expiration = match token {
            RegistryTokenType::Unchallenged => u64::MAX,
            RegistryTokenType::Bearer(ref t) => now().saturating_add(t.lifetime().as_secs()),
        };
        let registry = reference.resolve_registry().to_string();
        let repository = reference.repository().to_string();
        debug!(%registry, %repository, %expiration, "Inserting token");
        self.tokens.insert((registry, repository), (token, expiration));
    }

    pub(crate) fn get(&self, reference: &Reference) -> Option<&RegistryTokenType> {
        let registry = reference.resolve_registry().to_string();
        let repository = reference.repository().to_string();
        match self.tokens.get(&(registry.clone(), repository.clone())) {
            Some((ref token, expiration)) => {
                if now() > *expiration {
                    debug!(%registry, %repository, %expiration, miss=false, expired=true, "Fetching token");
                    None
                } else {
                    debug!(%registry, %repository, %expiration, miss=false, expired=false, "Fetching token");
                    Some(token)
                }
            }
            None => {
                debug!(%registry, %repository, miss = true, "Fetching token");
                None
            }
        }
    }

    pub(crate) fn contains_key(&self, reference: &Reference) -> bool {
        self.get(reference).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn token(json: &str) -> RegistryToken {
        serde_json::from_str(json).expect("token json")
    }

    #[test]
    fn reads_either_token_field() {
        assert_eq!("abc", token(r#"{"token":"abc"}"#).token());
        assert_eq!("xyz", token(r#"{"access_token":"xyz"}"#).token());
        assert_eq!("Bearer abc", token(r#"{"token":"abc"}"#).bearer_token());
    }

    #[test]
    fn expired_tokens_are_misses() {
        let reference: Reference = "example.com/app:v1".parse().unwrap();
        let mut cache = TokenCache::new();
        assert!(!cache.contains_key(&reference));

        cache.insert(
            &reference,
            RegistryTokenType::Bearer(token(r#"{"token":"abc","expires_in":300}"#)),
        );
        assert!(cache.contains_key(&reference));

        // Same repository, different tag: same entry.
        let other: Reference = "example.com/app:v2".parse().unwrap();
        assert!(cache.contains_key(&other));

        let mut cache = TokenCache::new();
        cache.tokens.insert(
            ("example.com".into(), "app".into()),
            (RegistryTokenType::Unchallenged, now() - 10),
        );
        assert!(!cache.contains_key(&reference));
    }
}
