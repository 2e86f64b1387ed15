//! Client certificate revocation checks
//!
//! After the TLS handshake the presented certificates are checked against
//! the configured revocation sources. Every active method runs against every
//! certificate within its depth and the first failure rejects the client.
//!
//! Depth counts certificates from the leaf, inclusive. A depth of 0 is
//! treated as 1, so the leaf is always checked.

mod crl;
mod fetch;
mod ocsp;

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::certificate::{find_issuer, CertificateError, PeerCertificate};
use crate::config::{ConfigError, RevocationConfig};

pub use crl::{CrlVerifier, RevocationList};
pub use ocsp::{OcspStatus, OcspVerifier, ResponseStatus};

/// A revocation checking method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValidationMethod {
    Ocsp,
    Crl,
}

impl ValidationMethod {
    /// Parse a comma separated list such as `"OCSP, crl"`
    pub fn parse_list(value: &str) -> Result<Vec<Self>, ConfigError> {
        value
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocsp => "OCSP",
            Self::Crl => "CRL",
        }
    }
}

impl FromStr for ValidationMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OCSP" => Ok(Self::Ocsp),
            "CRL" => Ok(Self::Crl),
            _ => Err(ConfigError::InvalidMethod(s.trim().to_string())),
        }
    }
}

impl TryFrom<String> for ValidationMethod {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ValidationMethod> for String {
    fn from(method: ValidationMethod) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for ValidationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("client certificate not received")]
    NoCertificate,

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("neither the issuer certificate is present in the chain nor is the issuer certificate URL present in AIA of {subject}")]
    IssuerUnavailable { subject: String },

    #[error("no OCSP responder configured and no OCSP server in AIA of {subject}")]
    NoOcspResponder { subject: String },

    #[error("request to {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("invalid OCSP response: {0}")]
    OcspResponse(String),

    #[error("OCSP responder failed with status {0}")]
    OcspServerFailed(ResponseStatus),

    #[error("OCSP responder does not know certificate with serial number {serial}")]
    OcspUnknown { serial: String },

    #[error("certificate revoked: serial number {serial} revoked at {revoked_at}")]
    Revoked {
        serial: String,
        revoked_at: DateTime<Utc>,
    },

    #[error("neither offline crl file nor crl distribution points in certificate nor configured crl distribution points exist")]
    NoCrl,

    #[error("failed to parse CRL: {0}")]
    CrlParse(String),

    #[error("crl expired")]
    CrlExpired,

    #[error("failed to verify CRL signature: {0}")]
    CrlSignature(String),

    #[error("failed to read offline CRL {path}: {source}")]
    OfflineCrl {
        path: String,
        source: std::io::Error,
    },
}

impl From<asn1_rs::Error> for VerifyError {
    fn from(e: asn1_rs::Error) -> Self {
        VerifyError::OcspResponse(e.to_string())
    }
}

impl From<asn1_rs::Err<asn1_rs::Error>> for VerifyError {
    fn from(e: asn1_rs::Err<asn1_rs::Error>) -> Self {
        VerifyError::OcspResponse(format!("malformed response: {}", e))
    }
}

impl From<asn1_rs::SerializeError> for VerifyError {
    fn from(e: asn1_rs::SerializeError) -> Self {
        VerifyError::OcspResponse(format!("failed to encode request: {}", e))
    }
}

/// One revocation method applied to a single certificate
#[async_trait]
pub trait RevocationCheck: Send + Sync {
    fn method(&self) -> ValidationMethod;

    /// Number of certificates checked, counting from the leaf
    fn depth(&self) -> usize;

    /// Check `cert`. `issuer` is the issuer paired with it in the presented
    /// chain, when one is known.
    async fn check(
        &self,
        cert: &PeerCertificate,
        issuer: Option<&PeerCertificate>,
    ) -> Result<(), VerifyError>;
}

/// The ordered set of active revocation methods
#[derive(Clone, Default)]
pub struct RevocationVerifier {
    checks: Vec<Arc<dyn RevocationCheck>>,
}

impl RevocationVerifier {
    pub fn new(checks: Vec<Arc<dyn RevocationCheck>>) -> Self {
        Self { checks }
    }

    /// Build the configured methods, validating their static inputs
    pub fn from_config(config: &RevocationConfig) -> Result<Self, ConfigError> {
        let http = fetch::http_client(Duration::from_secs(config.http_timeout_secs))?;

        let mut checks: Vec<Arc<dyn RevocationCheck>> = Vec::new();
        for method in &config.methods {
            if checks.iter().any(|c| c.method() == *method) {
                continue;
            }
            let check: Arc<dyn RevocationCheck> = match method {
                ValidationMethod::Ocsp => Arc::new(OcspVerifier::new(&config.ocsp, http.clone())?),
                ValidationMethod::Crl => Arc::new(CrlVerifier::new(&config.crl, http.clone())?),
            };
            info!(method = %method, depth = check.depth(), "Client certificate validation enabled");
            checks.push(check);
        }

        Ok(Self::new(checks))
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn methods(&self) -> Vec<ValidationMethod> {
        self.checks.iter().map(|c| c.method()).collect()
    }

    /// Check the certificates a client presented.
    ///
    /// `verified_chains` are chains already validated against the trust
    /// store, leaf first; each certificate is paired with the next one as its
    /// issuer and the last one with itself. When no verified chain is given,
    /// `raw_certs` are parsed and issuers are looked up among them.
    pub async fn verify_peer_certificate(
        &self,
        raw_certs: &[Vec<u8>],
        verified_chains: &[Vec<PeerCertificate>],
    ) -> Result<(), VerifyError> {
        if self.checks.is_empty() {
            return Ok(());
        }

        if verified_chains.iter().any(|chain| !chain.is_empty()) {
            for chain in verified_chains {
                self.verify_chain(chain).await?;
            }
            return Ok(());
        }

        if raw_certs.is_empty() {
            return Err(VerifyError::NoCertificate);
        }
        let certs = raw_certs
            .iter()
            .map(|der| PeerCertificate::from_der(der))
            .collect::<Result<Vec<_>, _>>()?;
        self.verify_raw(&certs).await
    }

    async fn verify_chain(&self, chain: &[PeerCertificate]) -> Result<(), VerifyError> {
        for check in &self.checks {
            for (i, cert) in chain.iter().enumerate().take(effective_depth(check.depth())) {
                let issuer = chain.get(i + 1).unwrap_or(cert);
                debug!(
                    method = %check.method(),
                    subject = %cert.subject(),
                    serial = %cert.serial_hex(),
                    "Checking certificate revocation"
                );
                check.check(cert, Some(issuer)).await?;
            }
        }
        Ok(())
    }

    async fn verify_raw(&self, certs: &[PeerCertificate]) -> Result<(), VerifyError> {
        for check in &self.checks {
            for cert in certs.iter().take(effective_depth(check.depth())) {
                debug!(
                    method = %check.method(),
                    subject = %cert.subject(),
                    serial = %cert.serial_hex(),
                    "Checking certificate revocation"
                );
                check.check(cert, find_issuer(cert, certs)).await?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RevocationVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationVerifier")
            .field("methods", &self.methods())
            .finish()
    }
}

fn effective_depth(depth: usize) -> usize {
    depth.max(1)
}

/// Resolve the issuer of `cert`: itself for a root CA, otherwise the paired
/// issuer, otherwise the certificate named by its AIA CA Issuers URL.
pub(crate) async fn resolve_issuer<'a>(
    http: &reqwest::Client,
    cert: &'a PeerCertificate,
    paired: Option<&'a PeerCertificate>,
) -> Result<Cow<'a, PeerCertificate>, VerifyError> {
    if cert.is_root_ca() {
        return Ok(Cow::Borrowed(cert));
    }
    if let Some(issuer) = paired {
        return Ok(Cow::Borrowed(issuer));
    }
    match cert.issuing_certificate_urls().first() {
        Some(url) => {
            debug!(subject = %cert.subject(), url = %url, "Fetching issuer certificate");
            Ok(Cow::Owned(fetch::fetch_certificate(http, url).await?))
        }
        None => Err(VerifyError::IssuerUnavailable {
            subject: cert.subject().to_string(),
        }),
    }
}
