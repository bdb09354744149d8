//! Signed configuration.
//!
//! The daemon refuses all device work until it is handed a
//! configuration blob: a 64-byte secp256k1 signature followed by a
//! serialized `Configuration` message. Any one of the pinned release
//! keys verifying the signature accepts the blob. The parsed record
//! carries origin allow/deny rules, the supported-device table, an
//! optional expiry, and the wire-protocol descriptor set.

use std::time::{SystemTime, UNIX_EPOCH};

use k256::ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};
use prost::Message as _;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Length of the detached signature prefix.
const SIGNATURE_LEN: usize = 64;

/// Release signing keys, SEC1 uncompressed points.
const SIGNATURE_KEYS: &[&str] = &[
    "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798\
     483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8",
    "04c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5\
     1ae168fea63dc339a3c58419466ceaeef7f632653266d0e1236431a950cfe52a",
];

/// One supported-device pattern. An absent field matches anything.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceDescriptor {
    /// USB vendor id to match.
    #[prost(uint32, optional, tag = "1")]
    pub vendor_id: Option<u32>,
    /// USB product id to match.
    #[prost(uint32, optional, tag = "2")]
    pub product_id: Option<u32>,
}

/// The configuration record carried inside a signed blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Configuration {
    /// Origin patterns that are allowed to talk to the daemon.
    #[prost(string, repeated, tag = "1")]
    pub whitelist_urls: Vec<String>,
    /// Origin patterns rejected even when whitelisted.
    #[prost(string, repeated, tag = "2")]
    pub blacklist_urls: Vec<String>,
    /// Serialized descriptor set for the token protocol.
    #[prost(bytes = "vec", tag = "3")]
    pub wire_protocol: Vec<u8>,
    /// Expiry as seconds since the epoch; absent means never.
    #[prost(uint64, optional, tag = "4")]
    pub valid_until: Option<u64>,
    /// Devices the daemon will expose.
    #[prost(message, repeated, tag = "5")]
    pub known_devices: Vec<DeviceDescriptor>,
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The blob is shorter than a signature.
    #[error("configuration string is malformed")]
    Malformed,

    /// No pinned key verified the signature.
    #[error("configuration signature is not correct")]
    BadSignature,

    /// The message part did not parse as a `Configuration`.
    #[error("configuration is malformed: {0}")]
    Decode(String),

    /// A URL rule is not a valid regular expression.
    #[error("configuration contains an invalid URL pattern: {0}")]
    BadPattern(String),
}

/// Parse the built-in pinned key list, skipping entries that do not
/// decode to valid curve points.
pub fn builtin_keys() -> Vec<VerifyingKey> {
    SIGNATURE_KEYS
        .iter()
        .filter_map(|hex| {
            let bytes = data_encoding::HEXLOWER_PERMISSIVE
                .decode(hex.as_bytes())
                .ok()?;
            match VerifyingKey::from_sec1_bytes(&bytes) {
                Ok(key) => Some(key),
                Err(_) => {
                    warn!("skipping unparsable pinned configuration key");
                    None
                }
            }
        })
        .collect()
}

/// Verify a detached signature against each key in turn.
fn verify_signature(sig: &[u8], msg: &[u8], keys: &[VerifyingKey]) -> bool {
    let Ok(signature) = Signature::from_slice(sig) else {
        return false;
    };
    keys.iter().any(|key| key.verify(msg, &signature).is_ok())
}

/// A verified, parsed configuration with its compiled URL rules.
#[derive(Debug)]
pub struct SignedConfig {
    config: Configuration,
    whitelist: Vec<Regex>,
    blacklist: Vec<Regex>,
}

impl SignedConfig {
    /// Verify and parse a raw `sig || msg` blob.
    pub fn from_signed_blob(raw: &[u8], keys: &[VerifyingKey]) -> Result<Self, ConfigError> {
        if raw.len() <= SIGNATURE_LEN {
            return Err(ConfigError::Malformed);
        }
        let (sig, msg) = raw.split_at(SIGNATURE_LEN);
        if !verify_signature(sig, msg, keys) {
            return Err(ConfigError::BadSignature);
        }

        let config =
            Configuration::decode(msg).map_err(|e| ConfigError::Decode(e.to_string()))?;
        Self::from_configuration(config)
    }

    /// Build from an already-trusted record, compiling the URL rules.
    pub fn from_configuration(config: Configuration) -> Result<Self, ConfigError> {
        let whitelist = compile_rules(&config.whitelist_urls)?;
        let blacklist = compile_rules(&config.blacklist_urls)?;
        Ok(Self {
            config,
            whitelist,
            blacklist,
        })
    }

    /// The parsed record.
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Whether all required fields are present.
    pub fn is_initialized(&self) -> bool {
        !self.config.wire_protocol.is_empty()
    }

    /// Whether the configuration has not passed its expiry.
    pub fn is_unexpired(&self) -> bool {
        match self.config.valid_until {
            None => true,
            Some(valid_until) => valid_until > unix_now(),
        }
    }

    /// Whether `url` matches a whitelist rule and no blacklist rule.
    pub fn is_url_allowed(&self, url: &str) -> bool {
        let matches = |rules: &[Regex]| rules.iter().any(|r| r.is_match(url));
        matches(&self.whitelist) && !matches(&self.blacklist)
    }

    /// Whether some known-device entry matches this vendor/product.
    pub fn is_device_supported(&self, vendor_id: u16, product_id: u16) -> bool {
        self.config.known_devices.iter().any(|d| {
            d.vendor_id.map_or(true, |v| v == u32::from(vendor_id))
                && d.product_id.map_or(true, |p| p == u32::from(product_id))
        })
    }
}

fn compile_rules(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            // rules must match the whole origin, not a substring
            Regex::new(&format!("^(?:{p})$")).map_err(|_| ConfigError::BadPattern(p.clone()))
        })
        .collect()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sign_configuration, test_configuration, test_signing_key};

    fn keys() -> Vec<VerifyingKey> {
        vec![*test_signing_key().verifying_key()]
    }

    #[test]
    fn builtin_keys_all_parse() {
        let keys = builtin_keys();
        assert!(!keys.is_empty());
        assert_eq!(keys.len(), SIGNATURE_KEYS.len(), "every pinned key must parse");
    }

    #[test]
    fn builtin_keys_reject_a_foreign_signature() {
        let blob = sign_configuration(&test_configuration(), &test_signing_key());
        let err = SignedConfig::from_signed_blob(&blob, &builtin_keys()).unwrap_err();
        assert!(matches!(err, ConfigError::BadSignature));
    }

    #[test]
    fn valid_blob_verifies_and_parses() {
        let blob = sign_configuration(&test_configuration(), &test_signing_key());
        let config = SignedConfig::from_signed_blob(&blob, &keys()).unwrap();
        assert!(config.is_initialized());
        assert!(config.is_unexpired());
    }

    #[test]
    fn short_blob_is_malformed() {
        let err = SignedConfig::from_signed_blob(&[0u8; 64], &keys()).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed));
    }

    #[test]
    fn tampered_blob_fails_verification() {
        let mut blob = sign_configuration(&test_configuration(), &test_signing_key());
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        let err = SignedConfig::from_signed_blob(&blob, &keys()).unwrap_err();
        assert!(matches!(err, ConfigError::BadSignature));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let other = k256::ecdsa::SigningKey::from_bytes(&[0x55u8; 32].into()).unwrap();
        let blob = sign_configuration(&test_configuration(), &other);
        let err = SignedConfig::from_signed_blob(&blob, &keys()).unwrap_err();
        assert!(matches!(err, ConfigError::BadSignature));
    }

    #[test]
    fn expiry_is_checked_against_wall_clock() {
        let mut config = test_configuration();
        config.valid_until = Some(0);
        let expired = SignedConfig::from_configuration(config).unwrap();
        assert!(!expired.is_unexpired());

        let mut config = test_configuration();
        config.valid_until = Some(u64::MAX);
        let fresh = SignedConfig::from_configuration(config).unwrap();
        assert!(fresh.is_unexpired());
    }

    #[test]
    fn url_rules_are_full_matches() {
        let mut config = test_configuration();
        config.whitelist_urls = vec!["https://example\\.com".to_owned()];
        config.blacklist_urls = vec![];
        let signed = SignedConfig::from_configuration(config).unwrap();

        assert!(signed.is_url_allowed("https://example.com"));
        assert!(!signed.is_url_allowed("https://example.com.evil"));
        assert!(!signed.is_url_allowed("prefix https://example.com"));
    }

    #[test]
    fn blacklist_overrides_whitelist() {
        let mut config = test_configuration();
        config.whitelist_urls = vec!["https://.*".to_owned()];
        config.blacklist_urls = vec!["https://bad\\.example".to_owned()];
        let signed = SignedConfig::from_configuration(config).unwrap();

        assert!(signed.is_url_allowed("https://good.example"));
        assert!(!signed.is_url_allowed("https://bad.example"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut config = test_configuration();
        config.whitelist_urls = vec!["(unclosed".to_owned()];
        let err = SignedConfig::from_configuration(config).unwrap_err();
        assert!(matches!(err, ConfigError::BadPattern(_)));
    }

    #[test]
    fn device_support_wildcards() {
        let mut config = test_configuration();
        config.known_devices = vec![
            DeviceDescriptor {
                vendor_id: Some(0x534c),
                product_id: Some(0x0001),
            },
            DeviceDescriptor {
                vendor_id: Some(0x1209),
                product_id: None,
            },
        ];
        let signed = SignedConfig::from_configuration(config).unwrap();

        assert!(signed.is_device_supported(0x534c, 0x0001));
        assert!(!signed.is_device_supported(0x534c, 0x0002));
        assert!(signed.is_device_supported(0x1209, 0xABCD));
        assert!(!signed.is_device_supported(0xAAAA, 0x0001));
    }

    #[test]
    fn empty_known_devices_supports_nothing() {
        let mut config = test_configuration();
        config.known_devices = vec![];
        let signed = SignedConfig::from_configuration(config).unwrap();
        assert!(!signed.is_device_supported(0x534c, 0x0001));
    }
}
