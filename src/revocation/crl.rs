//! CRL revocation checks
//!
//! A certificate is checked against the first available source: the CRL
//! distribution point named in the certificate, the configured distribution
//! point URL, or the offline CRL file. The configured distribution point is
//! only used together with its issuer certificate file, and its CRLs are
//! always signature checked.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::time::ASN1Time;

use super::{fetch, resolve_issuer, RevocationCheck, ValidationMethod, VerifyError};
use crate::certificate::{decode_pem_or_der, serials_match, PeerCertificate};
use crate::config::{ConfigError, CrlConfig};

const PEM_LABEL: &str = "X509 CRL";

/// One revoked serial number
#[derive(Debug, Clone, PartialEq, Eq)]
struct RevokedEntry {
    serial: Vec<u8>,
    revoked_at: DateTime<Utc>,
}

/// A parsed certificate revocation list
#[derive(Debug, Clone)]
pub struct RevocationList {
    der: Vec<u8>,
    next_update: Option<DateTime<Utc>>,
    revoked: Vec<RevokedEntry>,
}

impl RevocationList {
    /// Parse a CRL given as PEM (`X509 CRL`) or DER
    pub fn from_pem_or_der(data: &[u8]) -> Result<Self, VerifyError> {
        let der =
            decode_pem_or_der(data, PEM_LABEL).map_err(|e| VerifyError::CrlParse(e.to_string()))?;
        let (_, crl) = CertificateRevocationList::from_der(&der)
            .map_err(|e| VerifyError::CrlParse(e.to_string()))?;

        let next_update = crl.next_update().map(asn1_to_utc);
        let revoked = crl
            .iter_revoked_certificates()
            .map(|entry| RevokedEntry {
                serial: entry.raw_serial().to_vec(),
                revoked_at: asn1_to_utc(entry.revocation_date),
            })
            .collect();

        Ok(Self {
            der,
            next_update,
            revoked,
        })
    }

    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        self.next_update
    }

    /// Fails when `nextUpdate` is absent or already passed
    pub fn check_expiry(&self, now: DateTime<Utc>) -> Result<(), VerifyError> {
        match self.next_update {
            Some(next_update) if next_update >= now => Ok(()),
            _ => Err(VerifyError::CrlExpired),
        }
    }

    /// Verify the CRL signature with `issuer`'s public key
    pub fn verify_signature(&self, issuer: &PeerCertificate) -> Result<(), VerifyError> {
        let (_, crl) = CertificateRevocationList::from_der(&self.der)
            .map_err(|e| VerifyError::CrlParse(e.to_string()))?;
        let (_, issuer_cert) = X509Certificate::from_der(issuer.der())
            .map_err(|e| VerifyError::CrlSignature(e.to_string()))?;

        crl.verify_signature(issuer_cert.public_key())
            .map_err(|e| VerifyError::CrlSignature(e.to_string()))
    }

    /// Revocation time of `serial`, if it is listed
    pub fn revoked_at(&self, serial: &[u8]) -> Option<DateTime<Utc>> {
        self.revoked
            .iter()
            .find(|entry| serials_match(&entry.serial, serial))
            .map(|entry| entry.revoked_at)
    }

    pub fn contains(&self, serial: &[u8]) -> bool {
        self.revoked_at(serial).is_some()
    }

    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

fn asn1_to_utc(time: ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_default()
}

/// Configured distribution point URL and the issuer signing its CRLs
#[derive(Debug)]
struct StaticDistributionPoint {
    url: String,
    issuer: PeerCertificate,
}

/// Configured offline CRL file
#[derive(Debug)]
struct OfflineCrl {
    path: PathBuf,
    issuer: Option<PeerCertificate>,
}

impl OfflineCrl {
    fn read(&self) -> Result<Vec<u8>, VerifyError> {
        std::fs::read(&self.path).map_err(|source| VerifyError::OfflineCrl {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// Revocation check against certificate revocation lists
#[derive(Debug)]
pub struct CrlVerifier {
    depth: usize,
    distribution_point: Option<StaticDistributionPoint>,
    offline: Option<OfflineCrl>,
    http: reqwest::Client,
}

impl CrlVerifier {
    pub fn new(config: &CrlConfig, http: reqwest::Client) -> Result<Self, ConfigError> {
        let distribution_point = match &config.distribution_points {
            Some(url) => {
                reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                    key: "CRL_DISTRIBUTION_POINTS".to_string(),
                    value: url.clone(),
                    reason: e.to_string(),
                })?;
                let issuer = config
                    .distribution_points_issuer_cert_file
                    .as_deref()
                    .map(|path| load_issuer(path, "CRL distribution points issuer certificate"))
                    .transpose()?;
                match issuer {
                    Some(issuer) => Some(StaticDistributionPoint {
                        url: url.clone(),
                        issuer,
                    }),
                    None if config.distribution_points_sign_check => {
                        return Err(ConfigError::Invalid(
                            "CRL distribution points sign check requires an issuer certificate file"
                                .to_string(),
                        ));
                    }
                    None => {
                        warn!(url = %url, "Ignoring CRL distribution point configured without an issuer certificate file");
                        None
                    }
                }
            }
            None => None,
        };

        let offline = match &config.offline_crl_file {
            Some(path) => {
                let issuer = config
                    .offline_crl_issuer_cert_file
                    .as_deref()
                    .map(|path| load_issuer(path, "offline CRL issuer certificate"))
                    .transpose()?;
                let offline = OfflineCrl {
                    path: path.clone(),
                    issuer,
                };
                let invalid = |reason: String| ConfigError::InvalidValue {
                    key: "OFFLINE_CRL_FILE".to_string(),
                    value: path.display().to_string(),
                    reason,
                };
                let data = offline.read().map_err(|e| invalid(e.to_string()))?;
                RevocationList::from_pem_or_der(&data).map_err(|e| invalid(e.to_string()))?;
                Some(offline)
            }
            None => None,
        };

        Ok(Self {
            depth: config.depth,
            distribution_point,
            offline,
            http,
        })
    }

    /// Fetch the CRL covering `cert` and check its expiry and signature
    async fn revocation_list(
        &self,
        cert: &PeerCertificate,
        issuer: Option<&PeerCertificate>,
    ) -> Result<RevocationList, VerifyError> {
        let now = Utc::now();

        if let Some(url) = cert.crl_distribution_points().first() {
            debug!(subject = %cert.subject(), url = %url, "Fetching CRL from certificate distribution point");
            let list = RevocationList::from_pem_or_der(&fetch::get(&self.http, url).await?)?;
            list.check_expiry(now)?;
            let issuer = resolve_issuer(&self.http, cert, issuer).await?;
            list.verify_signature(&issuer)?;
            return Ok(list);
        }

        if let Some(point) = &self.distribution_point {
            debug!(subject = %cert.subject(), url = %point.url, "Fetching CRL from configured distribution point");
            let list = RevocationList::from_pem_or_der(&fetch::get(&self.http, &point.url).await?)?;
            list.check_expiry(now)?;
            list.verify_signature(&point.issuer)?;
            return Ok(list);
        }

        if let Some(offline) = &self.offline {
            debug!(subject = %cert.subject(), path = %offline.path.display(), "Reading offline CRL");
            let list = RevocationList::from_pem_or_der(&offline.read()?)?;
            list.check_expiry(now)?;
            if let Some(issuer) = &offline.issuer {
                list.verify_signature(issuer)?;
            }
            return Ok(list);
        }

        Err(VerifyError::NoCrl)
    }
}

#[async_trait]
impl RevocationCheck for CrlVerifier {
    fn method(&self) -> ValidationMethod {
        ValidationMethod::Crl
    }

    fn depth(&self) -> usize {
        self.depth
    }

    async fn check(
        &self,
        cert: &PeerCertificate,
        issuer: Option<&PeerCertificate>,
    ) -> Result<(), VerifyError> {
        let list = self.revocation_list(cert, issuer).await?;

        match list.revoked_at(cert.serial()) {
            Some(revoked_at) => {
                warn!(subject = %cert.subject(), serial = %cert.serial_hex(), %revoked_at, "Certificate revoked");
                Err(VerifyError::Revoked {
                    serial: cert.serial_hex(),
                    revoked_at,
                })
            }
            None => Ok(()),
        }
    }
}

fn load_issuer(path: &Path, what: &'static str) -> Result<PeerCertificate, ConfigError> {
    PeerCertificate::load(path).map_err(|source| ConfigError::Certificate { what, source })
}
