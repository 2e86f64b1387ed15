//! Configuration types for the MQTT relay gateway
//!
//! Configuration is read from an optional JSON file and then overlaid with
//! environment style keys (`CLIENT_CERT_VALIDATION_METHODS`, `OCSP_DEPTH`,
//! `CRL_DISTRIBUTION_POINTS`, ...), optionally behind a common prefix.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::certificate::CertificateError;
use crate::revocation::ValidationMethod;

/// MQTT Relay Gateway Configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct GatewayConfig {
    /// Listener and broker addresses
    pub listener: ListenerConfig,

    /// Client side TLS termination
    pub tls: TlsConfig,

    /// Client certificate revocation checks
    pub revocation: RevocationConfig,

    /// Access Control Lists
    pub acl: AclConfig,

    /// Topic rewriting policy
    pub policy: PolicyConfig,

    /// General settings
    pub general: GeneralConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid client validation method {0:?}")]
    InvalidMethod(String),

    #[error("failed to load {what}: {source}")]
    Certificate {
        what: &'static str,
        source: CertificateError,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(reqwest::Error),

    #[error("failed to compile ACL rule '{rule}': {reason}")]
    AclRule { rule: String, reason: String },

    #[error("failed to configure TLS: {0}")]
    Tls(String),

    #[error("{0}")]
    Invalid(String),
}

// ============================================================================
// Listener Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ListenerConfig {
    /// Address clients connect to
    pub address: String,

    /// Address of the upstream MQTT broker
    pub target: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            target: default_target(),
        }
    }
}

// ============================================================================
// TLS Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsConfig {
    /// Server certificate chain (PEM)
    pub cert_file: Option<PathBuf>,

    /// Server private key (PEM)
    pub key_file: Option<PathBuf>,

    /// CA bundle used to verify client certificates; enables mTLS
    pub client_ca_file: Option<PathBuf>,
}

// ============================================================================
// Revocation Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RevocationConfig {
    /// Active validation methods, run in order
    pub methods: Vec<ValidationMethod>,

    /// Timeout for OCSP, CRL and issuer fetches
    pub http_timeout_secs: u64,

    pub ocsp: OcspConfig,

    pub crl: CrlConfig,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            methods: Vec::new(),
            http_timeout_secs: default_http_timeout(),
            ocsp: OcspConfig::default(),
            crl: CrlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct OcspConfig {
    /// Certificates checked counting from the leaf; 0 checks the leaf only
    pub depth: usize,

    /// Responder used instead of the one named in the certificate
    pub responder_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrlConfig {
    /// Certificates checked counting from the leaf
    pub depth: usize,

    /// CRL file used when no distribution point applies
    pub offline_crl_file: Option<PathBuf>,

    /// Issuer used to verify the offline CRL signature
    pub offline_crl_issuer_cert_file: Option<PathBuf>,

    /// Distribution point used for certificates that do not name one
    pub distribution_points: Option<String>,

    /// Issuer used to verify CRLs fetched from `distribution_points`
    pub distribution_points_issuer_cert_file: Option<PathBuf>,

    /// Require a signature check of CRLs fetched from `distribution_points`
    pub distribution_points_sign_check: bool,
}

impl Default for CrlConfig {
    fn default() -> Self {
        Self {
            depth: default_crl_depth(),
            offline_crl_file: None,
            offline_crl_issuer_cert_file: None,
            distribution_points: None,
            distribution_points_issuer_cert_file: None,
            distribution_points_sign_check: false,
        }
    }
}

// ============================================================================
// ACL Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AclConfig {
    /// Enable ACL enforcement
    pub enabled: bool,

    /// Default action when no rule matches
    pub default_action: AclAction,

    /// ACL rules (evaluated by priority, first match wins)
    #[serde(default)]
    pub rules: Vec<AclRule>,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_action: AclAction::Allow,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AclRule {
    /// Rule name (for logging and debugging)
    pub name: String,

    /// Match conditions (all must match)
    #[serde(default, rename = "match")]
    pub match_conditions: AclMatch,

    /// Topic patterns this rule applies to (ignored for connect)
    #[serde(default)]
    pub topics: Vec<String>,

    /// Actions this rule applies to (empty = all actions)
    #[serde(default)]
    pub actions: Vec<MqttAction>,

    /// Decision: allow or deny
    pub decision: AclAction,

    /// Priority (higher = evaluated first, default = 0)
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct AclMatch {
    /// Match by exact username
    pub username: Option<String>,
    /// Match by username regex
    pub username_regex: Option<String>,
    /// Match by exact client ID
    pub client_id: Option<String>,
    /// Match by client ID regex
    pub client_id_regex: Option<String>,
    /// Match by client IP (CIDR notation supported)
    pub client_ip: Option<String>,
    /// Match by exact client certificate common name
    pub common_name: Option<String>,
    /// Match by client certificate common name regex
    pub common_name_regex: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AclAction {
    #[default]
    Deny,
    Allow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MqttAction {
    Connect,
    Publish,
    Subscribe,
    /// Accepted in rules but never evaluated: UNSUBSCRIBE has no authorization hook
    Unsubscribe,
}

// ============================================================================
// Policy Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct PolicyConfig {
    /// Prefix added to every topic; supports `{username}` and `{client_id}`
    pub topic_prefix: Option<String>,
}

// ============================================================================
// General Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct GeneralConfig {
    /// Log all MQTT packets (verbose)
    pub log_packets: bool,
}

// ============================================================================
// Loading
// ============================================================================

impl GatewayConfig {
    /// Read a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Overlay settings from the process environment
    pub fn apply_env(&mut self, prefix: &str) -> Result<(), ConfigError> {
        self.apply_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Overlay settings from `lookup`, which is asked for `prefix + KEY`.
    ///
    /// Empty values are treated as unset.
    pub fn apply_lookup<F>(&mut self, prefix: &str, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{}{}", prefix, key)).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("ADDRESS") {
            self.listener.address = value;
        }
        if let Some(value) = get("TARGET") {
            self.listener.target = value;
        }
        if let Some(value) = get("CERT_FILE") {
            self.tls.cert_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("KEY_FILE") {
            self.tls.key_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CLIENT_CA_FILE") {
            self.tls.client_ca_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CLIENT_CERT_VALIDATION_METHODS") {
            self.revocation.methods = ValidationMethod::parse_list(&value)?;
        }
        if let Some(value) = get("OCSP_DEPTH") {
            self.revocation.ocsp.depth = parse_number("OCSP_DEPTH", &value)?;
        }
        if let Some(value) = get("OCSP_RESPONDER_URL") {
            self.revocation.ocsp.responder_url = Some(value);
        }
        if let Some(value) = get("CRL_DEPTH") {
            self.revocation.crl.depth = parse_number("CRL_DEPTH", &value)?;
        }
        if let Some(value) = get("OFFLINE_CRL_FILE") {
            self.revocation.crl.offline_crl_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("OFFLINE_CRL_ISSUER_CERT_FILE") {
            self.revocation.crl.offline_crl_issuer_cert_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CRL_DISTRIBUTION_POINTS") {
            self.revocation.crl.distribution_points = Some(value);
        }
        if let Some(value) = get("CRL_DISTRIBUTION_POINTS_ISSUER_CERT_FILE") {
            self.revocation.crl.distribution_points_issuer_cert_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CRL_DISTRIBUTION_POINTS_SIGN_CHECK") {
            self.revocation.crl.distribution_points_sign_check =
                parse_bool("CRL_DISTRIBUTION_POINTS_SIGN_CHECK", &value)?;
        }
        if let Some(value) = get("LOG_PACKETS") {
            self.general.log_packets = parse_bool("LOG_PACKETS", &value)?;
        }

        Ok(())
    }

    /// Check settings that depend on each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(ConfigError::Invalid(
                "tls cert-file and key-file must be configured together".to_string(),
            ));
        }
        if self.tls.client_ca_file.is_some() && self.tls.cert_file.is_none() {
            return Err(ConfigError::Invalid(
                "tls client-ca-file requires cert-file and key-file".to_string(),
            ));
        }
        if !self.revocation.methods.is_empty() && self.tls.client_ca_file.is_none() {
            return Err(ConfigError::Invalid(
                "client certificate validation methods require tls client-ca-file".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_address() -> String {
    "0.0.0.0:1883".to_string()
}

fn default_target() -> String {
    "localhost:1884".to_string()
}

fn default_http_timeout() -> u64 {
    10
}

fn default_crl_depth() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.listener.address, "0.0.0.0:1883");
        assert!(config.revocation.methods.is_empty());
        assert_eq!(config.revocation.ocsp.depth, 0);
        assert_eq!(config.revocation.crl.depth, 1);
        assert!(!config.acl.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_config() {
        let json = r#"{
            "listener": {"address": "127.0.0.1:8883", "target": "broker:1883"},
            "tls": {
                "cert-file": "/etc/relay/server.pem",
                "key-file": "/etc/relay/server.key",
                "client-ca-file": "/etc/relay/ca.pem"
            },
            "revocation": {
                "methods": ["ocsp", "CRL"],
                "ocsp": {"responder-url": "http://ocsp.local/"},
                "crl": {"offline-crl-file": "/etc/relay/ca.crl"}
            },
            "acl": {
                "enabled": true,
                "default-action": "deny",
                "rules": [
                    {
                        "name": "sensor-publish",
                        "match": {"common-name-regex": "^sensor-"},
                        "topics": ["sensors/+/data"],
                        "actions": ["publish"],
                        "decision": "allow"
                    }
                ]
            },
            "policy": {"topic-prefix": "tenants/{username}"}
        }"#;

        let config: GatewayConfig = serde_json::from_str(json).expect("Failed to parse");
        assert_eq!(config.listener.target, "broker:1883");
        assert_eq!(
            config.revocation.methods,
            vec![ValidationMethod::Ocsp, ValidationMethod::Crl]
        );
        assert_eq!(config.revocation.crl.depth, 1);
        assert_eq!(config.acl.rules[0].name, "sensor-publish");
        assert_eq!(
            config.policy.topic_prefix.as_deref(),
            Some("tenants/{username}")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overlay() {
        let mut config = GatewayConfig::default();
        config
            .apply_lookup(
                "MQTT_RELAY_",
                lookup(&[
                    ("MQTT_RELAY_CLIENT_CERT_VALIDATION_METHODS", " crl , OCSP "),
                    ("MQTT_RELAY_OCSP_DEPTH", "2"),
                    ("MQTT_RELAY_CRL_DISTRIBUTION_POINTS", "http://crl.local/ca.crl"),
                    ("MQTT_RELAY_CRL_DISTRIBUTION_POINTS_SIGN_CHECK", "true"),
                    ("MQTT_RELAY_OFFLINE_CRL_FILE", ""),
                    ("CRL_DEPTH", "5"),
                ]),
            )
            .unwrap();

        assert_eq!(
            config.revocation.methods,
            vec![ValidationMethod::Crl, ValidationMethod::Ocsp]
        );
        assert_eq!(config.revocation.ocsp.depth, 2);
        // Unprefixed keys are ignored
        assert_eq!(config.revocation.crl.depth, 1);
        assert!(config.revocation.crl.distribution_points_sign_check);
        assert!(config.revocation.crl.offline_crl_file.is_none());
    }

    #[test]
    fn test_env_unknown_method_is_fatal() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_lookup("", lookup(&[("CLIENT_CERT_VALIDATION_METHODS", "OCSP,LDAP")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMethod(m) if m == "LDAP"));
    }

    #[test]
    fn test_env_invalid_depth() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_lookup("", lookup(&[("CRL_DEPTH", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "CRL_DEPTH"));
    }

    #[test]
    fn test_validate_methods_require_client_ca() {
        let mut config = GatewayConfig::default();
        config.revocation.methods = vec![ValidationMethod::Ocsp];
        assert!(config.validate().is_err());

        config.tls.cert_file = Some(PathBuf::from("server.pem"));
        config.tls.key_file = Some(PathBuf::from("server.key"));
        config.tls.client_ca_file = Some(PathBuf::from("ca.pem"));
        config.validate().unwrap();
    }
}
