//! Test PKI and revocation responders
//!
//! [`TestPki`] generates a root, an intermediate and a client certificate
//! with rcgen, and can sign CRLs and OCSP responses for them.
//! [`TestResponder`] serves OCSP, CRL and issuer certificate endpoints over
//! HTTP on an ephemeral port and counts the requests it receives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CrlDistributionPoint,
    CustomExtension, DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair,
    KeyUsagePurpose, RevocationReason, RevokedCertParams, SerialNumber,
};
use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use time::OffsetDateTime;

use asn1_rs::{
    oid, Any, BitString, Class, Enumerated, FromDer, Header, Integer, Length, Null, OctetString,
    Sequence, Tag, ToDer,
};
use x509_parser::oid_registry::{
    OID_HASH_SHA1, OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS, OID_PKIX_ACCESS_DESCRIPTOR_OCSP,
    OID_SIG_ECDSA_WITH_SHA256,
};

use crate::certificate::PeerCertificate;

const OID_PE_AUTHORITY_INFO_ACCESS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];

/// Revocation time written into revoked OCSP responses
const REVOKED_AT: &str = "20240101000000Z";

/// Certificate status an OCSP response should carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OcspFixture {
    Good,
    Revoked,
    Unknown,
}

struct Entity {
    cert: rcgen::Certificate,
    key: KeyPair,
    peer: PeerCertificate,
}

impl Entity {
    fn new(cert: rcgen::Certificate, key: KeyPair) -> Self {
        let peer = PeerCertificate::from_der(cert.der()).unwrap();
        Self { cert, key, peer }
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        let rng = SystemRandom::new();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &self.key.serialize_der(), &rng)
                .unwrap();
        key_pair.sign(&rng, message).unwrap().as_ref().to_vec()
    }
}

struct Inner {
    root: Entity,
    intermediate: Entity,
    leaf: Entity,
    responder: Entity,
    server: Entity,
}

#[derive(Default)]
pub(crate) struct TestPkiBuilder {
    ocsp_url: Option<String>,
    ca_issuers_url: Option<String>,
    crl_url: Option<String>,
}

impl TestPkiBuilder {
    /// OCSP responder named in the client certificate's AIA
    pub fn ocsp_url(mut self, url: &str) -> Self {
        self.ocsp_url = Some(url.to_string());
        self
    }

    /// CA Issuers URL named in the client certificate's AIA
    pub fn ca_issuers_url(mut self, url: &str) -> Self {
        self.ca_issuers_url = Some(url.to_string());
        self
    }

    /// CRL distribution point named in the client certificate
    pub fn crl_url(mut self, url: &str) -> Self {
        self.crl_url = Some(url.to_string());
        self
    }

    pub fn build(self) -> TestPki {
        let root_key = KeyPair::generate().unwrap();
        let root_cert = ca_params("Test Root CA", 0x01)
            .self_signed(&root_key)
            .unwrap();
        let root = Entity::new(root_cert, root_key);

        let intermediate_key = KeyPair::generate().unwrap();
        let intermediate_cert = ca_params("Test Intermediate CA", 0x02)
            .signed_by(&intermediate_key, &root.cert, &root.key)
            .unwrap();
        let intermediate = Entity::new(intermediate_cert, intermediate_key);

        let mut leaf_params = end_entity_params("device-001", vec![0x10, 0x01]);
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        if let Some(url) = &self.crl_url {
            leaf_params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: vec![url.clone()],
            }];
        }
        if self.ocsp_url.is_some() || self.ca_issuers_url.is_some() {
            leaf_params.custom_extensions.push(authority_info_access(
                self.ocsp_url.as_deref(),
                self.ca_issuers_url.as_deref(),
            ));
        }
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &intermediate.cert, &intermediate.key)
            .unwrap();
        let leaf = Entity::new(leaf_cert, leaf_key);

        let mut responder_params = end_entity_params("Test OCSP Responder", vec![0x20, 0x01]);
        responder_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::OcspSigning];
        let responder_key = KeyPair::generate().unwrap();
        let responder_cert = responder_params
            .signed_by(&responder_key, &intermediate.cert, &intermediate.key)
            .unwrap();
        let responder = Entity::new(responder_cert, responder_key);

        let mut server_params = end_entity_params("localhost", vec![0x30, 0x01]);
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_key = KeyPair::generate().unwrap();
        let server_cert = server_params
            .signed_by(&server_key, &root.cert, &root.key)
            .unwrap();
        let server = Entity::new(server_cert, server_key);

        TestPki {
            inner: Arc::new(Inner {
                root,
                intermediate,
                leaf,
                responder,
                server,
            }),
        }
    }
}

fn ca_params(common_name: &str, serial: u8) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from(vec![serial]));
    params
}

fn end_entity_params(common_name: &str, serial: Vec<u8>) -> CertificateParams {
    let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.serial_number = Some(SerialNumber::from(serial));
    params
}

fn authority_info_access(ocsp_url: Option<&str>, ca_issuers_url: Option<&str>) -> CustomExtension {
    let descriptions: Vec<Vec<u8>> = [
        (OID_PKIX_ACCESS_DESCRIPTOR_OCSP, ocsp_url),
        (OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS, ca_issuers_url),
    ]
    .into_iter()
    .filter_map(|(method, url)| {
        // uniformResourceIdentifier [6] IA5String
        url.map(|url| der_sequence(&[method.to_der_vec().unwrap(), context_tagged(6, false, url.as_bytes())]))
    })
    .collect();
    CustomExtension::from_oid_content(OID_PE_AUTHORITY_INFO_ACCESS, der_sequence(&descriptions))
}

fn der_sequence(elements: &[Vec<u8>]) -> Vec<u8> {
    Sequence::new(elements.concat().into()).to_der_vec().unwrap()
}

fn context_tagged(tag: u32, constructed: bool, content: &[u8]) -> Vec<u8> {
    let header = Header::new(
        Class::ContextSpecific,
        constructed,
        Tag(tag),
        Length::Definite(content.len()),
    );
    Any::new(header, content).to_der_vec().unwrap()
}

fn der_generalized_time(value: &str) -> Vec<u8> {
    Any::from_tag_and_data(Tag::GeneralizedTime, value.as_bytes())
        .to_der_vec()
        .unwrap()
}

/// OCSPResponse carrying only a non-successful `responseStatus`
pub(crate) fn ocsp_error_response(status: u32) -> Vec<u8> {
    der_sequence(&[Enumerated(status).to_der_vec().unwrap()])
}

fn generalized_time(time: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}Z",
        time.year(),
        u8::from(time.month()),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// Root, intermediate and client certificates plus their keys
#[derive(Clone)]
pub(crate) struct TestPki {
    inner: Arc<Inner>,
}

impl TestPki {
    pub fn builder() -> TestPkiBuilder {
        TestPkiBuilder::default()
    }

    pub fn root(&self) -> &PeerCertificate {
        &self.inner.root.peer
    }

    pub fn intermediate(&self) -> &PeerCertificate {
        &self.inner.intermediate.peer
    }

    pub fn leaf(&self) -> &PeerCertificate {
        &self.inner.leaf.peer
    }

    /// Delegated OCSP signer issued by the intermediate
    pub fn responder(&self) -> &PeerCertificate {
        &self.inner.responder.peer
    }

    pub fn root_pem(&self) -> String {
        self.inner.root.cert.pem()
    }

    pub fn intermediate_pem(&self) -> String {
        self.inner.intermediate.cert.pem()
    }

    pub fn leaf_pem(&self) -> String {
        self.inner.leaf.cert.pem()
    }

    pub fn leaf_key_pem(&self) -> String {
        self.inner.leaf.key.serialize_pem()
    }

    /// Server certificate for `localhost`, issued by the root
    pub fn server_pem(&self) -> String {
        self.inner.server.cert.pem()
    }

    pub fn server_key_pem(&self) -> String {
        self.inner.server.key.serialize_pem()
    }

    /// Leaf, intermediate and root
    pub fn chain(&self) -> Vec<PeerCertificate> {
        vec![
            self.leaf().clone(),
            self.intermediate().clone(),
            self.root().clone(),
        ]
    }

    fn entity(&self, cert: &PeerCertificate) -> &Entity {
        let inner = &self.inner;
        [&inner.root, &inner.intermediate, &inner.leaf, &inner.responder, &inner.server]
            .into_iter()
            .find(|entity| entity.peer.der() == cert.der())
            .unwrap_or_else(|| panic!("Expected a test certificate, got {}", cert.subject()))
    }

    fn issuer_of(&self, cert: &PeerCertificate) -> &Entity {
        if cert.is_root_ca() {
            return &self.inner.root;
        }
        [&self.inner.root, &self.inner.intermediate]
            .into_iter()
            .find(|entity| entity.peer.der() != cert.der() && cert.is_issued_by(&entity.peer))
            .unwrap_or_else(|| panic!("Expected an issuer for {}", cert.subject()))
    }

    /// CRL signed by `issuer`, valid for a day
    pub fn crl(&self, issuer: &PeerCertificate, revoked: &[&PeerCertificate]) -> String {
        let now = OffsetDateTime::now_utc();
        self.build_crl(issuer, revoked, now, now + time::Duration::days(1))
    }

    /// CRL whose nextUpdate passed yesterday
    pub fn expired_crl(&self, issuer: &PeerCertificate, revoked: &[&PeerCertificate]) -> String {
        let now = OffsetDateTime::now_utc();
        self.build_crl(
            issuer,
            revoked,
            now - time::Duration::days(2),
            now - time::Duration::days(1),
        )
    }

    fn build_crl(
        &self,
        issuer: &PeerCertificate,
        revoked: &[&PeerCertificate],
        this_update: OffsetDateTime,
        next_update: OffsetDateTime,
    ) -> String {
        let issuer = self.entity(issuer);
        let params = CertificateRevocationListParams {
            this_update,
            next_update,
            crl_number: SerialNumber::from(vec![0x01]),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|cert| RevokedCertParams {
                    serial_number: SerialNumber::from(cert.serial().to_vec()),
                    revocation_time: this_update,
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        params
            .signed_by(&issuer.cert, &issuer.key)
            .unwrap()
            .pem()
            .unwrap()
    }

    /// OCSP response for `cert` signed directly by its issuer
    pub fn ocsp_response(&self, cert: &PeerCertificate, status: OcspFixture) -> Vec<u8> {
        let issuer = self.issuer_of(cert);
        self.sign_ocsp(issuer, issuer, cert.serial(), status)
    }

    /// OCSP response for `cert` signed by `signer`, which is embedded in the
    /// response
    pub fn ocsp_response_signed_by(
        &self,
        cert: &PeerCertificate,
        status: OcspFixture,
        signer: &PeerCertificate,
    ) -> Vec<u8> {
        self.sign_ocsp(self.issuer_of(cert), self.entity(signer), cert.serial(), status)
    }

    fn sign_ocsp(&self, issuer: &Entity, signer: &Entity, serial: &[u8], status: OcspFixture) -> Vec<u8> {
        let sha1 = |data: &[u8]| digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data);
        let now = der_generalized_time(&generalized_time(OffsetDateTime::now_utc()));
        let name_hash = sha1(issuer.peer.subject_raw());
        let key_hash = sha1(issuer.peer.public_key());

        let cert_id = der_sequence(&[
            der_sequence(&[
                OID_HASH_SHA1.to_der_vec().unwrap(),
                Null {}.to_der_vec().unwrap(),
            ]),
            OctetString::new(name_hash.as_ref()).to_der_vec().unwrap(),
            OctetString::new(key_hash.as_ref()).to_der_vec().unwrap(),
            Integer::new(serial).to_der_vec().unwrap(),
        ]);
        let cert_status = match status {
            OcspFixture::Good => context_tagged(0, false, &[]),
            OcspFixture::Revoked => context_tagged(1, true, &der_generalized_time(REVOKED_AT)),
            OcspFixture::Unknown => context_tagged(2, false, &[]),
        };
        let single = der_sequence(&[cert_id, cert_status, now.clone()]);

        // byKey [2] KeyHash
        let signer_key_hash = sha1(signer.peer.public_key());
        let responder_id = context_tagged(
            2,
            true,
            &OctetString::new(signer_key_hash.as_ref()).to_der_vec().unwrap(),
        );
        let tbs = der_sequence(&[responder_id, now, der_sequence(&[single])]);
        let signature = signer.sign(&tbs);

        let mut basic = vec![
            tbs,
            der_sequence(&[OID_SIG_ECDSA_WITH_SHA256.to_der_vec().unwrap()]),
            BitString::new(0, &signature).to_der_vec().unwrap(),
        ];
        if signer.peer.der() != issuer.peer.der() {
            basic.push(context_tagged(0, true, &der_sequence(&[signer.peer.der().to_vec()])));
        }
        let basic = der_sequence(&basic);

        let response_bytes = der_sequence(&[
            oid!(1.3.6.1.5.5.7.48.1.1).to_der_vec().unwrap(),
            OctetString::new(&basic).to_der_vec().unwrap(),
        ]);
        der_sequence(&[
            Enumerated(0).to_der_vec().unwrap(),
            context_tagged(0, true, &response_bytes),
        ])
    }
}

/// Extract `(serial, issuerNameHash, issuerKeyHash)` from a single-certificate
/// OCSP request
pub(crate) fn decode_request(request: &[u8]) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    fn contents(i: &[u8]) -> (&[u8], &[u8]) {
        let (rest, any) = Any::from_der(i).unwrap();
        (rest, any.data)
    }

    // OCSPRequest, TBSRequest, requestList, Request, CertID
    let (_, tbs_request) = contents(request);
    let (_, request_list) = contents(tbs_request);
    let (_, request) = contents(request_list);
    let (_, request) = contents(request);
    let (_, cert_id) = contents(request);

    let (rest, _hash_algorithm) = contents(cert_id);
    let (rest, name_hash) = contents(rest);
    let (rest, key_hash) = contents(rest);
    let (_, serial) = contents(rest);
    (serial.to_vec(), name_hash.to_vec(), key_hash.to_vec())
}

// ============================================================================
// HTTP responder
// ============================================================================

struct ResponderState {
    pki: TestPki,
    ocsp_hits: AtomicUsize,
    issuer_hits: AtomicUsize,
    crl_hits: AtomicUsize,
    ocsp_status: Mutex<HashMap<Vec<u8>, OcspFixture>>,
    crls: Mutex<HashMap<String, String>>,
}

/// A bound listener whose URL is known before the PKI is generated
pub(crate) struct PendingResponder {
    listener: tokio::net::TcpListener,
    addr: SocketAddr,
}

impl PendingResponder {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn serve(self, pki: TestPki) -> TestResponder {
        let state = Arc::new(ResponderState {
            pki,
            ocsp_hits: AtomicUsize::new(0),
            issuer_hits: AtomicUsize::new(0),
            crl_hits: AtomicUsize::new(0),
            ocsp_status: Mutex::new(HashMap::new()),
            crls: Mutex::new(HashMap::new()),
        });

        let router = Router::new()
            .route("/ocsp", post(ocsp))
            .route("/root.pem", get(root_certificate))
            .route("/intermediate.pem", get(intermediate_certificate))
            .route("/crl/:name", get(crl))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(self.listener, router).await;
        });

        TestResponder {
            addr: self.addr,
            state,
        }
    }
}

/// OCSP, CRL and CA Issuers endpoints for a [`TestPki`]
pub(crate) struct TestResponder {
    addr: SocketAddr,
    state: Arc<ResponderState>,
}

impl TestResponder {
    pub async fn bind() -> PendingResponder {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        PendingResponder { listener, addr }
    }

    pub async fn start(pki: TestPki) -> Self {
        Self::bind().await.serve(pki)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ocsp_hits(&self) -> usize {
        self.state.ocsp_hits.load(Ordering::SeqCst)
    }

    pub fn issuer_hits(&self) -> usize {
        self.state.issuer_hits.load(Ordering::SeqCst)
    }

    pub fn crl_hits(&self) -> usize {
        self.state.crl_hits.load(Ordering::SeqCst)
    }

    /// Status returned for `cert` from now on; unset certificates are good
    pub fn set_ocsp(&self, cert: &PeerCertificate, status: OcspFixture) {
        self.state
            .ocsp_status
            .lock()
            .insert(cert.serial().to_vec(), status);
    }

    /// Serve `pem` at `/crl/{name}`
    pub fn set_crl(&self, name: &str, pem: String) {
        self.state.crls.lock().insert(name.to_string(), pem);
    }
}

async fn ocsp(State(state): State<Arc<ResponderState>>, body: Bytes) -> Response {
    state.ocsp_hits.fetch_add(1, Ordering::SeqCst);

    let (serial, _, key_hash) = decode_request(&body);
    let pki = &state.pki;
    let issuer = [&pki.inner.root, &pki.inner.intermediate]
        .into_iter()
        .find(|entity| digest::digest(&digest::SHA256, entity.peer.public_key()).as_ref() == key_hash);
    let Some(issuer) = issuer else {
        // unauthorized
        return (
            [(header::CONTENT_TYPE, "application/ocsp-response")],
            ocsp_error_response(6),
        )
            .into_response();
    };

    let status = state
        .ocsp_status
        .lock()
        .get(&serial)
        .copied()
        .unwrap_or(OcspFixture::Good);
    let response = pki.sign_ocsp(issuer, issuer, &serial, status);
    ([(header::CONTENT_TYPE, "application/ocsp-response")], response).into_response()
}

async fn root_certificate(State(state): State<Arc<ResponderState>>) -> String {
    state.issuer_hits.fetch_add(1, Ordering::SeqCst);
    state.pki.root_pem()
}

async fn intermediate_certificate(State(state): State<Arc<ResponderState>>) -> String {
    state.issuer_hits.fetch_add(1, Ordering::SeqCst);
    state.pki.intermediate_pem()
}

async fn crl(State(state): State<Arc<ResponderState>>, Path(name): Path<String>) -> Response {
    state.crl_hits.fetch_add(1, Ordering::SeqCst);
    match state.crls.lock().get(&name) {
        Some(pem) => pem.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
