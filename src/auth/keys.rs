//! JWK set loading and kid-indexed key lookup
//!
//! The key set is parsed once at startup and immutable afterwards. Every
//! key must carry both `kid` and `alg`; a duplicate `kid` fails the load.

use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key set is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Key without kid")]
    MissingKid,

    #[error("Key without alg")]
    MissingAlg,

    #[error("Key with duplicate kid")]
    DuplicateKid,

    #[error("unsupported key algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("unusable key material for kid '{kid}'")]
    BadKeyMaterial {
        kid: String,
        #[source]
        source: jsonwebtoken::errors::Error,
    },

    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),
}

/// A verification key loaded from a JWK set
#[derive(Clone)]
pub struct Key {
    kid: String,
    alg: Algorithm,
    decoding: DecodingKey,
}

impl Key {
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn alg(&self) -> Algorithm {
        self.alg
    }

    /// Public key material for signature verification
    pub fn decoding(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .finish()
    }
}

/// Immutable kid-indexed key set, safe to share across readers
#[derive(Debug, Default)]
pub struct KeyStore {
    keys_by_kid: HashMap<String, Key>,
}

impl KeyStore {
    /// A store with no keys; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a JWK set from its JSON serialization.
    pub fn from_jwk_set(json: &str) -> Result<Self, KeyStoreError> {
        let jwks: JwkSet = serde_json::from_str(json)?;

        let mut keys_by_kid = HashMap::new();
        for jwk in &jwks.keys {
            let key = Self::to_key(jwk)?;
            debug!(kid = %key.kid, alg = ?key.alg, "loaded verification key");
            if keys_by_kid.insert(key.kid.clone(), key).is_some() {
                return Err(KeyStoreError::DuplicateKid);
            }
        }

        info!(key_count = keys_by_kid.len(), "key store loaded");
        Ok(Self { keys_by_kid })
    }

    /// Load a JWK set file. A missing file yields an empty store; any
    /// other failure is fatal.
    pub fn from_file(path: &Path) -> Result<Self, KeyStoreError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_jwk_set(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "key file not found, starting with empty key store");
                Ok(Self::empty())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn lookup(&self, kid: &str) -> Option<&Key> {
        self.keys_by_kid.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys_by_kid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys_by_kid.is_empty()
    }

    fn to_key(jwk: &Jwk) -> Result<Key, KeyStoreError> {
        let kid = jwk
            .common
            .key_id
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(KeyStoreError::MissingKid)?;

        let key_alg = jwk
            .common
            .key_algorithm
            .clone()
            .ok_or(KeyStoreError::MissingAlg)?;
        let alg = signature_algorithm(&key_alg)
            .ok_or_else(|| KeyStoreError::UnsupportedAlgorithm(format!("{key_alg:?}")))?;

        let decoding = DecodingKey::from_jwk(jwk)
            .map_err(|source| KeyStoreError::BadKeyMaterial {
                kid: kid.clone(),
                source,
            })?;

        Ok(Key { kid, alg, decoding })
    }
}

/// Map a JWK `alg` to a JWS signature algorithm. Encryption algorithms
/// (RSA-OAEP and friends) have no signature counterpart.
fn signature_algorithm(key_alg: &KeyAlgorithm) -> Option<Algorithm> {
    match key_alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_RSA_N: &str = "1cHliYDNuiNag8RcQUm_NGpq_BzgeaAGvDlHcctlBhqe9imCvm_zjWNyDOlonnMOMbnZSDh73aVHjuo0LTj2edPdrxcZjVXBnxiSNdBHBHujEculb7Q1uYAGr1m76Pmkzd3Ql9pV1ibkO_5hZjSrqVAL1W_-f6bLadxsbvXnZ71gXnQLohtYLp57pEKCDG_yMxwmT36CkiAim6y95_z4is1iXugGhY5FjuPSYpcx96QLOPuhpQ6Ck_T9n-MXFHfqHA67W97dSwwyDIGNaVg3OlPBnx_B8_3GK6D5uaSMGa0WS44iXAd8CbMCm0t-AghNOxXZn1Tocmeh02f1Gt48hw";
    const TEST_RSA_E: &str = "AQAB";

    fn rsa_jwk(kid: &str, alg: &str) -> String {
        format!(
            r#"{{"kty":"RSA","kid":"{kid}","alg":"{alg}","n":"{TEST_RSA_N}","e":"{TEST_RSA_E}"}}"#
        )
    }

    #[test]
    fn test_load_single_key() {
        let jwks = format!(r#"{{"keys":[{}]}}"#, rsa_jwk("RS256", "RS256"));
        let store = KeyStore::from_jwk_set(&jwks).unwrap();

        assert_eq!(store.len(), 1);
        let key = store.lookup("RS256").unwrap();
        assert_eq!(key.kid(), "RS256");
        assert_eq!(key.alg(), Algorithm::RS256);
        assert!(store.lookup("other").is_none());
    }

    #[test]
    fn test_missing_kid_fails() {
        let jwks = format!(
            r#"{{"keys":[{{"kty":"RSA","alg":"RS256","n":"{TEST_RSA_N}","e":"{TEST_RSA_E}"}}]}}"#
        );
        let err = KeyStore::from_jwk_set(&jwks).unwrap_err();
        assert!(matches!(err, KeyStoreError::MissingKid));
        assert_eq!(err.to_string(), "Key without kid");
    }

    #[test]
    fn test_missing_alg_fails() {
        let jwks = format!(
            r#"{{"keys":[{{"kty":"RSA","kid":"K","n":"{TEST_RSA_N}","e":"{TEST_RSA_E}"}}]}}"#
        );
        let err = KeyStore::from_jwk_set(&jwks).unwrap_err();
        assert!(matches!(err, KeyStoreError::MissingAlg));
        assert_eq!(err.to_string(), "Key without alg");
    }

    #[test]
    fn test_duplicate_kid_fails() {
        let jwks = format!(
            r#"{{"keys":[{},{}]}}"#,
            rsa_jwk("K", "RS256"),
            rsa_jwk("K", "RS512")
        );
        let err = KeyStore::from_jwk_set(&jwks).unwrap_err();
        assert!(matches!(err, KeyStoreError::DuplicateKid));
        assert_eq!(err.to_string(), "Key with duplicate kid");
    }

    #[test]
    fn test_malformed_json_fails() {
        assert!(matches!(
            KeyStore::from_jwk_set("not json").unwrap_err(),
            KeyStoreError::Malformed(_)
        ));
    }

    #[test]
    fn test_missing_file_yields_empty_store() {
        let store = KeyStore::from_file(Path::new("/nonexistent/keys.jwk")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_encryption_alg_rejected() {
        let jwks = format!(
            r#"{{"keys":[{{"kty":"RSA","kid":"K","alg":"RSA-OAEP","n":"{TEST_RSA_N}","e":"{TEST_RSA_E}"}}]}}"#
        );
        let err = KeyStore::from_jwk_set(&jwks).unwrap_err();
        assert!(matches!(err, KeyStoreError::UnsupportedAlgorithm(_)));
    }
}
