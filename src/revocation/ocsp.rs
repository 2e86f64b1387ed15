//! OCSP (RFC 6960) revocation checks
//!
//! Requests identify the certificate with SHA-256 hashes of the issuer name
//! and key. Responses must be signed by the issuer, or by a responder
//! certificate the issuer signed for OCSP signing.

use std::fmt;

use asn1_rs::{
    oid, Any, BitString, Class, Enumerated, Error as Asn1Error, FromDer, GeneralizedTime, Integer,
    Null, OctetString, Oid, ParseResult, Sequence, SerializeResult, Tag, ToDer,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ring::digest;
use tracing::{debug, warn};
use x509_parser::oid_registry::{
    OID_HASH_SHA1, OID_NIST_HASH_SHA256, OID_NIST_HASH_SHA384, OID_NIST_HASH_SHA512,
};
use x509_parser::x509::AlgorithmIdentifier;

use super::{fetch, resolve_issuer, RevocationCheck, ValidationMethod, VerifyError};
use crate::certificate::{serials_match, PeerCertificate};
use crate::config::{ConfigError, OcspConfig};

const OID_PKIX_OCSP_BASIC: Oid<'static> = oid!(1.3.6.1.5.5.7.48.1.1);

/// OCSPResponseStatus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Successful,
    MalformedRequest,
    InternalError,
    TryLater,
    SigRequired,
    Unauthorized,
    Unrecognized(u8),
}

impl From<u8> for ResponseStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Successful,
            1 => Self::MalformedRequest,
            2 => Self::InternalError,
            3 => Self::TryLater,
            5 => Self::SigRequired,
            6 => Self::Unauthorized,
            other => Self::Unrecognized(other),
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Successful => f.write_str("successful"),
            Self::MalformedRequest => f.write_str("malformed request"),
            Self::InternalError => f.write_str("internal error"),
            Self::TryLater => f.write_str("try later"),
            Self::SigRequired => f.write_str("signature required"),
            Self::Unauthorized => f.write_str("unauthorized"),
            Self::Unrecognized(code) => write!(f, "unrecognized ({})", code),
        }
    }
}

/// Revocation state reported by a responder for one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcspStatus {
    Good,
    Revoked { revoked_at: DateTime<Utc> },
    Unknown,
    ServerFailed(ResponseStatus),
}

/// Online revocation check against an OCSP responder
pub struct OcspVerifier {
    depth: usize,
    responder_url: Option<String>,
    http: reqwest::Client,
}

impl OcspVerifier {
    pub fn new(config: &OcspConfig, http: reqwest::Client) -> Result<Self, ConfigError> {
        let responder_url = match &config.responder_url {
            Some(url) => {
                reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                    key: "OCSP_RESPONDER_URL".to_string(),
                    value: url.clone(),
                    reason: e.to_string(),
                })?;
                Some(url.clone())
            }
            None => None,
        };

        Ok(Self {
            depth: config.depth,
            responder_url,
            http,
        })
    }

    /// Ask the responder about `cert` and return its answer
    pub async fn status(
        &self,
        cert: &PeerCertificate,
        issuer: &PeerCertificate,
    ) -> Result<OcspStatus, VerifyError> {
        let url = match (&self.responder_url, cert.ocsp_servers().first()) {
            (Some(url), _) | (None, Some(url)) => url.as_str(),
            (None, None) => {
                return Err(VerifyError::NoOcspResponder {
                    subject: cert.subject().to_string(),
                })
            }
        };

        let request = build_request(cert, issuer)?;
        debug!(url = %url, serial = %cert.serial_hex(), "Sending OCSP request");
        let response = fetch::post_ocsp(&self.http, url, request).await?;
        parse_response(&response, cert, issuer)
    }
}

#[async_trait]
impl RevocationCheck for OcspVerifier {
    fn method(&self) -> ValidationMethod {
        ValidationMethod::Ocsp
    }

    fn depth(&self) -> usize {
        self.depth
    }

    async fn check(
        &self,
        cert: &PeerCertificate,
        issuer: Option<&PeerCertificate>,
    ) -> Result<(), VerifyError> {
        let issuer = resolve_issuer(&self.http, cert, issuer).await?;

        match self.status(cert, &issuer).await? {
            OcspStatus::Good => Ok(()),
            OcspStatus::Revoked { revoked_at } => {
                warn!(subject = %cert.subject(), serial = %cert.serial_hex(), %revoked_at, "Certificate revoked");
                Err(VerifyError::Revoked {
                    serial: cert.serial_hex(),
                    revoked_at,
                })
            }
            OcspStatus::Unknown => Err(VerifyError::OcspUnknown {
                serial: cert.serial_hex(),
            }),
            OcspStatus::ServerFailed(status) => Err(VerifyError::OcspServerFailed(status)),
        }
    }
}

/// DER encoded OCSPRequest for a single certificate
pub(crate) fn build_request(
    cert: &PeerCertificate,
    issuer: &PeerCertificate,
) -> Result<Vec<u8>, VerifyError> {
    let name_hash = digest::digest(&digest::SHA256, issuer.subject_raw());
    let key_hash = digest::digest(&digest::SHA256, issuer.public_key());

    let hash_algorithm = sequence(&[OID_NIST_HASH_SHA256.to_der_vec()?, Null {}.to_der_vec()?])?;
    let cert_id = sequence(&[
        hash_algorithm,
        OctetString::new(name_hash.as_ref()).to_der_vec()?,
        OctetString::new(key_hash.as_ref()).to_der_vec()?,
        Integer::new(cert.serial()).to_der_vec()?,
    ])?;
    let request = sequence(&[cert_id])?;
    let request_list = sequence(&[request])?;
    let tbs_request = sequence(&[request_list])?;
    Ok(sequence(&[tbs_request])?)
}

fn sequence(elements: &[Vec<u8>]) -> SerializeResult<Vec<u8>> {
    Sequence::new(elements.concat().into()).to_der_vec()
}

/// Parse an OCSPResponse and return the status of `cert`
pub(crate) fn parse_response(
    response: &[u8],
    cert: &PeerCertificate,
    issuer: &PeerCertificate,
) -> Result<OcspStatus, VerifyError> {
    let (_, (status, response_bytes)) = parse_ocsp_response(response)?;
    if status != ResponseStatus::Successful {
        return Ok(OcspStatus::ServerFailed(status));
    }

    let Some((response_type, basic)) = response_bytes else {
        return Err(VerifyError::OcspResponse(
            "successful response carries no response bytes".to_string(),
        ));
    };
    if response_type != OID_PKIX_OCSP_BASIC {
        return Err(VerifyError::OcspResponse(format!(
            "unsupported response type {}",
            response_type.to_id_string()
        )));
    }
    let (_, basic) = parse_basic_response(basic)?;

    let responder_certs = basic
        .certs
        .iter()
        .map(|der| PeerCertificate::from_der(der))
        .collect::<Result<Vec<_>, _>>()?;
    let signer = response_signer(&responder_certs, issuer)?;

    let (_, algorithm) = AlgorithmIdentifier::from_der(basic.signature_algorithm).map_err(|e| {
        VerifyError::OcspResponse(format!("invalid signature algorithm: {}", e))
    })?;
    signer
        .verify_data_signature(&algorithm, &basic.signature, basic.tbs_response_data)
        .map_err(|e| VerifyError::OcspResponse(format!("response signature does not verify: {}", e)))?;

    for single in &basic.responses {
        if !cert_id_matches(single, cert, issuer)? {
            continue;
        }

        return match &single.status {
            CertStatus::Good => Ok(OcspStatus::Good),
            CertStatus::Revoked(time) => Ok(OcspStatus::Revoked {
                revoked_at: revocation_time(time)?,
            }),
            CertStatus::Unknown => Ok(OcspStatus::Unknown),
        };
    }

    Err(VerifyError::OcspResponse(format!(
        "no response for certificate with serial number {}",
        cert.serial_hex()
    )))
}

/// Pick the certificate whose key signed the response
fn response_signer<'a>(
    responder_certs: &'a [PeerCertificate],
    issuer: &'a PeerCertificate,
) -> Result<&'a PeerCertificate, VerifyError> {
    match responder_certs.first() {
        None => Ok(issuer),
        Some(responder) if responder.der() == issuer.der() => Ok(issuer),
        Some(responder) => {
            responder.verify_signed_by(issuer)?;
            if !responder.is_ocsp_signer() {
                return Err(VerifyError::OcspResponse(format!(
                    "responder certificate {} is not authorized to sign OCSP responses",
                    responder.subject()
                )));
            }
            Ok(responder)
        }
    }
}

fn cert_id_matches(
    single: &SingleResponse<'_>,
    cert: &PeerCertificate,
    issuer: &PeerCertificate,
) -> Result<bool, VerifyError> {
    if !serials_match(single.serial, cert.serial()) {
        return Ok(false);
    }

    let algorithm = if single.hash_algorithm == OID_HASH_SHA1 {
        &digest::SHA1_FOR_LEGACY_USE_ONLY
    } else if single.hash_algorithm == OID_NIST_HASH_SHA256 {
        &digest::SHA256
    } else if single.hash_algorithm == OID_NIST_HASH_SHA384 {
        &digest::SHA384
    } else if single.hash_algorithm == OID_NIST_HASH_SHA512 {
        &digest::SHA512
    } else {
        return Err(VerifyError::OcspResponse(format!(
            "unsupported CertID hash algorithm {}",
            single.hash_algorithm.to_id_string()
        )));
    };

    Ok(digest::digest(algorithm, issuer.subject_raw()).as_ref() == single.issuer_name_hash
        && digest::digest(algorithm, issuer.public_key()).as_ref() == single.issuer_key_hash)
}

fn revocation_time(time: &GeneralizedTime) -> Result<DateTime<Utc>, VerifyError> {
    let time = time.utc_datetime()?;
    DateTime::from_timestamp(time.unix_timestamp(), time.nanosecond())
        .ok_or_else(|| VerifyError::OcspResponse("revocation time out of range".to_string()))
}

// ============================================================================
// Response decoding
// ============================================================================

/// The parts of a BasicOCSPResponse needed to answer a status query
struct BasicResponse<'a> {
    /// Encoded ResponseData, the signed part of the response
    tbs_response_data: &'a [u8],
    responses: Vec<SingleResponse<'a>>,
    /// Encoded AlgorithmIdentifier
    signature_algorithm: &'a [u8],
    signature: BitString<'a>,
    /// Encoded certificates embedded by a delegated responder
    certs: Vec<&'a [u8]>,
}

struct SingleResponse<'a> {
    hash_algorithm: Oid<'a>,
    issuer_name_hash: &'a [u8],
    issuer_key_hash: &'a [u8],
    serial: &'a [u8],
    status: CertStatus,
}

enum CertStatus {
    Good,
    Revoked(GeneralizedTime),
    Unknown,
}

type ResponseBytes<'a> = (Oid<'a>, &'a [u8]);

fn parse_ocsp_response(i: &[u8]) -> ParseResult<'_, (ResponseStatus, Option<ResponseBytes<'_>>)> {
    in_sequence(i, |i| {
        let (i, status) = Enumerated::from_der(i)?;
        let status = u8::try_from(status.0)
            .map(ResponseStatus::from)
            .map_err(|_| Asn1Error::IntegerTooLarge)?;

        let (i, response_bytes) = optional_context(0, i)?;
        let response_bytes = match response_bytes {
            Some(explicit) => Some(parse_response_bytes(explicit.data)?.1),
            None => None,
        };
        Ok((i, (status, response_bytes)))
    })
}

fn parse_response_bytes(i: &[u8]) -> ParseResult<'_, ResponseBytes<'_>> {
    in_sequence(i, |i| {
        let (i, response_type) = Oid::from_der(i)?;
        let (i, response) = universal(Tag::OctetString, i)?;
        Ok((i, (response_type, response)))
    })
}

fn parse_basic_response(i: &[u8]) -> ParseResult<'_, BasicResponse<'_>> {
    in_sequence(i, |i| {
        let (i, tbs_response_data) = element(i)?;
        let (_, responses) = parse_response_data(tbs_response_data)?;
        let (i, signature_algorithm) = element(i)?;
        let (i, signature) = BitString::from_der(i)?;
        let (i, certs) = optional_context(0, i)?;
        let certs = match certs {
            Some(explicit) => sequence_of(explicit.data, element)?.1,
            None => Vec::new(),
        };

        Ok((
            i,
            BasicResponse {
                tbs_response_data,
                responses,
                signature_algorithm,
                signature,
                certs,
            },
        ))
    })
}

fn parse_response_data(i: &[u8]) -> ParseResult<'_, Vec<SingleResponse<'_>>> {
    in_sequence(i, |i| {
        let (i, _version) = optional_context(0, i)?;
        let (i, _responder_id) = Any::from_der(i)?;
        let (i, _produced_at) = GeneralizedTime::from_der(i)?;
        sequence_of(i, parse_single_response)
    })
}

fn parse_single_response(i: &[u8]) -> ParseResult<'_, SingleResponse<'_>> {
    in_sequence(i, |i| {
        let (i, (hash_algorithm, issuer_name_hash, issuer_key_hash, serial)) =
            in_sequence(i, |i| {
                let (i, hash_algorithm) = in_sequence(i, Oid::from_der)?;
                let (i, issuer_name_hash) = universal(Tag::OctetString, i)?;
                let (i, issuer_key_hash) = universal(Tag::OctetString, i)?;
                let (i, serial) = universal(Tag::Integer, i)?;
                Ok((i, (hash_algorithm, issuer_name_hash, issuer_key_hash, serial)))
            })?;

        let (i, status) = Any::from_der(i)?;
        status.header.assert_class(Class::ContextSpecific)?;
        let status = match status.tag() {
            Tag(0) => CertStatus::Good,
            Tag(1) => CertStatus::Revoked(GeneralizedTime::from_der(status.data)?.1),
            Tag(2) => CertStatus::Unknown,
            other => return Err(Asn1Error::UnknownTag(other.0).into()),
        };

        Ok((
            i,
            SingleResponse {
                hash_algorithm,
                issuer_name_hash,
                issuer_key_hash,
                serial,
                status,
            },
        ))
    })
}

/// Contents of the next element, which must carry the universal `tag`
fn universal(tag: Tag, i: &[u8]) -> ParseResult<'_, &[u8]> {
    let (rest, any) = Any::from_der(i)?;
    any.header.assert_class(Class::Universal)?;
    any.header.assert_tag(tag)?;
    Ok((rest, any.data))
}

/// The next element, header included
fn element(i: &[u8]) -> ParseResult<'_, &[u8]> {
    let (rest, _) = Any::from_der(i)?;
    Ok((rest, &i[..i.len() - rest.len()]))
}

fn optional_context(tag: u32, i: &[u8]) -> ParseResult<'_, Option<Any<'_>>> {
    if i.is_empty() {
        return Ok((i, None));
    }
    let (rest, any) = Any::from_der(i)?;
    if any.class() == Class::ContextSpecific && any.tag() == Tag(tag) {
        Ok((rest, Some(any)))
    } else {
        Ok((i, None))
    }
}

fn in_sequence<'a, T>(
    i: &'a [u8],
    parse: impl FnOnce(&'a [u8]) -> ParseResult<'a, T>,
) -> ParseResult<'a, T> {
    Sequence::from_der_and_then(i, parse)
}

fn sequence_of<'a, T>(
    i: &'a [u8],
    mut parse: impl FnMut(&'a [u8]) -> ParseResult<'a, T>,
) -> ParseResult<'a, Vec<T>> {
    in_sequence(i, |mut i| {
        let mut items = Vec::new();
        while !i.is_empty() {
            let (rest, item) = parse(i)?;
            items.push(item);
            i = rest;
        }
        Ok((i, items))
    })
}
