//! Proxy configuration

use serde::Deserialize;
use std::path::PathBuf;

/// Configuration for the stream proxy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Whether streams are torn down when their token expires mid-flight.
    /// When false, grant expiry is forced to "never" regardless of `exp`.
    pub expire_in_flight_requests: bool,

    /// Namespace prefix for the challenge-delta claim
    /// (e.g. "https://example.com/")
    pub challenge_delta_claim_namespace: String,

    /// Name of the challenge-delta numeric-date claim
    pub challenge_delta_claim_name: String,

    /// JWK set file location
    pub keys: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            expire_in_flight_requests: true,
            challenge_delta_claim_namespace: String::new(),
            challenge_delta_claim_name: "caf".to_string(),
            keys: PathBuf::from("keys.jwk"),
        }
    }
}

impl ProxyConfig {
    /// Fully-qualified name of the challenge-delta claim
    pub fn challenge_delta_claim(&self) -> String {
        format!(
            "{}{}",
            self.challenge_delta_claim_namespace, self.challenge_delta_claim_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert!(config.expire_in_flight_requests);
        assert_eq!(config.challenge_delta_claim(), "caf");
        assert_eq!(config.keys, PathBuf::from("keys.jwk"));
    }

    #[test]
    fn test_namespaced_challenge_claim() {
        let config = ProxyConfig {
            challenge_delta_claim_namespace: "https://example.com/".to_string(),
            ..ProxyConfig::default()
        };
        assert_eq!(config.challenge_delta_claim(), "https://example.com/caf");
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ProxyConfig =
            serde_json::from_str(r#"{"expire_in_flight_requests": false}"#).unwrap();
        assert!(!config.expire_in_flight_requests);
        assert_eq!(config.challenge_delta_claim_name, "caf");
    }
}
