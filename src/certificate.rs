//! X.509 peer certificates
//!
//! [`PeerCertificate`] is an owned view of the fields the gateway needs from a
//! client certificate or one of its issuers: identity, revocation endpoints,
//! key identifiers and the public key. It is extracted once with x509-parser
//! so it can be shared freely across tasks.

use std::path::Path;

use asn1_rs::BitString;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;
use x509_parser::verify::verify_signature;
use x509_parser::x509::AlgorithmIdentifier;

/// id-ad-ocsp access method
pub const OID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";
/// id-ad-caIssuers access method
pub const OID_AD_CA_ISSUERS: &str = "1.3.6.1.5.5.7.48.2";
/// serialNumber attribute of a distinguished name
const OID_DN_SERIAL_NUMBER: &str = "2.5.4.5";

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("no {0} block found in PEM input")]
    MissingPem(&'static str),

    #[error("invalid PEM input: {0}")]
    Pem(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("signature of {subject} does not verify against {issuer}: {reason}")]
    BadSignature {
        subject: String,
        issuer: String,
        reason: String,
    },

    #[error("signature by {signer} rejected: {reason}")]
    BadDataSignature { signer: String, reason: String },
}

/// Parsed client or issuer certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    der: Vec<u8>,
    subject: String,
    issuer: String,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
    common_name: Option<String>,
    subject_serial_number: Option<String>,
    issuer_serial_number: Option<String>,
    serial: Vec<u8>,
    is_ca: bool,
    authority_key_id: Option<Vec<u8>>,
    subject_key_id: Option<Vec<u8>>,
    ocsp_servers: Vec<String>,
    issuing_certificate_urls: Vec<String>,
    crl_distribution_points: Vec<String>,
    ocsp_signing: bool,
    public_key: Vec<u8>,
}

impl PeerCertificate {
    /// Parse a DER encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (_, x509) =
            X509Certificate::from_der(der).map_err(|e| CertificateError::Parse(e.to_string()))?;

        let subject = x509.subject();
        let issuer = x509.issuer();

        let mut cert = Self {
            der: der.to_vec(),
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            subject_raw: subject.as_raw().to_vec(),
            issuer_raw: issuer.as_raw().to_vec(),
            common_name: subject
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_owned),
            subject_serial_number: dn_serial_number(subject),
            issuer_serial_number: dn_serial_number(issuer),
            serial: x509.raw_serial().to_vec(),
            is_ca: x509.is_ca(),
            authority_key_id: None,
            subject_key_id: None,
            ocsp_servers: Vec::new(),
            issuing_certificate_urls: Vec::new(),
            crl_distribution_points: Vec::new(),
            ocsp_signing: false,
            public_key: x509.public_key().subject_public_key.data.to_vec(),
        };

        for extension in x509.extensions() {
            match extension.parsed_extension() {
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    cert.authority_key_id = aki.key_identifier.as_ref().map(|k| k.0.to_vec());
                }
                ParsedExtension::SubjectKeyIdentifier(ski) => {
                    cert.subject_key_id = Some(ski.0.to_vec());
                }
                ParsedExtension::AuthorityInfoAccess(aia) => {
                    for access in &aia.accessdescs {
                        let GeneralName::URI(uri) = &access.access_location else {
                            continue;
                        };
                        match access.access_method.to_id_string().as_str() {
                            OID_AD_OCSP => cert.ocsp_servers.push(uri.to_string()),
                            OID_AD_CA_ISSUERS => cert.issuing_certificate_urls.push(uri.to_string()),
                            _ => {}
                        }
                    }
                }
                ParsedExtension::CRLDistributionPoints(points) => {
                    for point in &points.points {
                        if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                            cert.crl_distribution_points
                                .extend(names.iter().filter_map(|name| match name {
                                    GeneralName::URI(uri) => Some(uri.to_string()),
                                    _ => None,
                                }));
                        }
                    }
                }
                ParsedExtension::ExtendedKeyUsage(eku) => {
                    cert.ocsp_signing = eku.ocsp_signing;
                }
                _ => {}
            }
        }

        Ok(cert)
    }

    /// Parse a certificate given either as PEM or as raw DER
    pub fn from_pem_or_der(data: &[u8]) -> Result<Self, CertificateError> {
        Self::from_der(&decode_pem_or_der(data, "CERTIFICATE")?)
    }

    /// Load a PEM or DER certificate file
    pub fn load(path: &Path) -> Result<Self, CertificateError> {
        let data = std::fs::read(path).map_err(|source| CertificateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_pem_or_der(&data)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name in RFC 4514 form
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer distinguished name in RFC 4514 form
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// DER encoding of the subject name
    pub fn subject_raw(&self) -> &[u8] {
        &self.subject_raw
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Serial number as it appears in the certificate (big endian, signed)
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Serial number as lowercase hex without leading zeros
    pub fn serial_hex(&self) -> String {
        serial_to_hex(&self.serial)
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// OCSP responder URLs from the Authority Information Access extension
    pub fn ocsp_servers(&self) -> &[String] {
        &self.ocsp_servers
    }

    /// CA Issuers URLs from the Authority Information Access extension
    pub fn issuing_certificate_urls(&self) -> &[String] {
        &self.issuing_certificate_urls
    }

    pub fn crl_distribution_points(&self) -> &[String] {
        &self.crl_distribution_points
    }

    /// Whether the extended key usage allows signing OCSP responses
    pub fn is_ocsp_signer(&self) -> bool {
        self.ocsp_signing
    }

    /// Contents of the subjectPublicKey bit string
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// A CA certificate that issued itself
    pub fn is_root_ca(&self) -> bool {
        if !self.is_ca {
            return false;
        }
        let same_key_id = matches!(
            (&self.authority_key_id, &self.subject_key_id),
            (Some(aki), Some(ski)) if !aki.is_empty() && aki == ski
        );
        same_key_id || self.issuer_raw == self.subject_raw
    }

    /// Whether `issuer`'s subject names this certificate's issuer.
    ///
    /// When both names carry a serialNumber attribute those are compared,
    /// otherwise the full names are.
    pub fn is_issued_by(&self, issuer: &PeerCertificate) -> bool {
        match (&self.issuer_serial_number, &issuer.subject_serial_number) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => self.issuer_raw == issuer.subject_raw,
        }
    }

    /// Verify this certificate's signature with `issuer`'s public key
    pub fn verify_signed_by(&self, issuer: &PeerCertificate) -> Result<(), CertificateError> {
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        let (_, issuer_cert) = X509Certificate::from_der(&issuer.der)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        cert.verify_signature(Some(issuer_cert.public_key()))
            .map_err(|e| CertificateError::BadSignature {
                subject: self.subject.clone(),
                issuer: issuer.subject.clone(),
                reason: e.to_string(),
            })
    }

    /// Verify a signature this certificate's key made over `data`, such as
    /// the signed part of an OCSP response
    pub fn verify_data_signature(
        &self,
        algorithm: &AlgorithmIdentifier<'_>,
        signature: &BitString<'_>,
        data: &[u8],
    ) -> Result<(), CertificateError> {
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        verify_signature(cert.public_key(), algorithm, signature, data).map_err(|e| {
            CertificateError::BadDataSignature {
                signer: self.subject.clone(),
                reason: e.to_string(),
            }
        })
    }
}

/// Find the issuer of `cert` among `candidates`
pub fn find_issuer<'a>(
    cert: &PeerCertificate,
    candidates: &'a [PeerCertificate],
) -> Option<&'a PeerCertificate> {
    candidates
        .iter()
        .find(|candidate| candidate.der != cert.der && cert.is_issued_by(candidate))
}

/// Compare two DER integer serials ignoring leading zero bytes
pub fn serials_match(a: &[u8], b: &[u8]) -> bool {
    strip_leading_zeros(a) == strip_leading_zeros(b)
}

pub(crate) fn serial_to_hex(serial: &[u8]) -> String {
    let digits: String = strip_leading_zeros(serial)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    match digits.trim_start_matches('0') {
        "" => "0".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn dn_serial_number(name: &x509_parser::x509::X509Name<'_>) -> Option<String> {
    name.iter_attributes()
        .find(|attr| attr.attr_type().to_id_string() == OID_DN_SERIAL_NUMBER)
        .and_then(|attr| attr.as_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Return the DER bytes of the first PEM block labelled `label`, or the input
/// unchanged when it is not PEM.
pub fn decode_pem_or_der(data: &[u8], label: &'static str) -> Result<Vec<u8>, CertificateError> {
    let is_pem = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| data[start..].starts_with(b"-----BEGIN"))
        .unwrap_or(false);
    if !is_pem {
        return Ok(data.to_vec());
    }

    for pem in Pem::iter_from_buffer(data) {
        let pem = pem.map_err(|e| CertificateError::Pem(e.to_string()))?;
        if pem.label == label {
            return Ok(pem.contents);
        }
    }
    Err(CertificateError::MissingPem(label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPki;

    #[test]
    fn test_serials_match_ignores_leading_zeros() {
        assert!(serials_match(&[0x00, 0x10, 0x01], &[0x10, 0x01]));
        assert!(!serials_match(&[0x10, 0x02], &[0x10, 0x01]));
        assert_eq!(serial_to_hex(&[0x00, 0x0a, 0xbc]), "abc");
        assert_eq!(serial_to_hex(&[0x00]), "0");
    }

    #[test]
    fn test_extracts_revocation_endpoints() {
        let pki = TestPki::builder()
            .ocsp_url("http://ocsp.example.test/")
            .ca_issuers_url("http://ca.example.test/intermediate.pem")
            .crl_url("http://crl.example.test/leaf.crl")
            .build();

        let leaf = pki.leaf();
        assert_eq!(leaf.common_name(), Some("device-001"));
        assert_eq!(leaf.ocsp_servers(), ["http://ocsp.example.test/"]);
        assert_eq!(
            leaf.issuing_certificate_urls(),
            ["http://ca.example.test/intermediate.pem"]
        );
        assert_eq!(
            leaf.crl_distribution_points(),
            ["http://crl.example.test/leaf.crl"]
        );
        assert!(!leaf.is_ca());
    }

    #[test]
    fn test_root_detection() {
        let pki = TestPki::builder().build();

        assert!(pki.root().is_root_ca());
        assert!(!pki.intermediate().is_root_ca());
        assert!(!pki.leaf().is_root_ca());
    }

    #[test]
    fn test_find_issuer_in_presented_set() {
        let pki = TestPki::builder().build();
        let presented = vec![pki.leaf().clone(), pki.intermediate().clone()];

        let issuer = find_issuer(pki.leaf(), &presented).unwrap();
        assert_eq!(issuer, pki.intermediate());
        assert!(find_issuer(pki.intermediate(), &presented).is_none());
    }

    #[test]
    fn test_signature_verification() {
        let pki = TestPki::builder().build();

        pki.leaf().verify_signed_by(pki.intermediate()).unwrap();
        assert!(pki.leaf().verify_signed_by(pki.root()).is_err());
    }

    #[test]
    fn test_pem_and_der_inputs() {
        let pki = TestPki::builder().build();
        let pem = pki.leaf_pem();

        let from_pem = PeerCertificate::from_pem_or_der(pem.as_bytes()).unwrap();
        let from_der = PeerCertificate::from_pem_or_der(pki.leaf().der()).unwrap();
        assert_eq!(from_pem, from_der);

        let err = decode_pem_or_der(pem.as_bytes(), "X509 CRL").unwrap_err();
        assert!(matches!(err, CertificateError::MissingPem("X509 CRL")));
    }
}
