//! TLS termination for client connections
//!
//! The listener can accept plain TCP, TLS, or mutual TLS. With a client CA
//! configured, rustls verifies the client chain during the handshake and the
//! configured revocation methods run on the verified chain right after it.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::certificate::{find_issuer, CertificateError, PeerCertificate};
use crate::config::{ConfigError, TlsConfig};
use crate::revocation::{RevocationVerifier, VerifyError};

/// Transport security of the client listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    WithoutTls,
    WithTls,
    WithMtls,
    WithMtlsVerify,
}

impl Security {
    pub fn from_config(config: &TlsConfig, verifier: &RevocationVerifier) -> Self {
        match (&config.cert_file, &config.client_ca_file) {
            (None, _) => Self::WithoutTls,
            (Some(_), None) => Self::WithTls,
            (Some(_), Some(_)) if verifier.is_empty() => Self::WithMtls,
            (Some(_), Some(_)) => Self::WithMtlsVerify,
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WithoutTls => f.write_str("without TLS"),
            Self::WithTls => f.write_str("with TLS"),
            Self::WithMtls => f.write_str("with mTLS"),
            Self::WithMtlsVerify => {
                f.write_str("with mTLS and validation of client certificate revocation status")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("client certificate verification failed: {0}")]
    Verify(#[from] VerifyError),
}

/// Accepts TLS connections and gates them on client certificate revocation
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
    security: Security,
    trust_anchors: Vec<PeerCertificate>,
    verifier: RevocationVerifier,
}

impl TlsTerminator {
    /// Build the terminator, or `None` when TLS is not configured
    pub fn from_config(
        config: &TlsConfig,
        verifier: RevocationVerifier,
    ) -> Result<Option<Self>, ConfigError> {
        let security = Security::from_config(config, &verifier);
        let (Some(cert_file), Some(key_file)) = (&config.cert_file, &config.key_file) else {
            return Ok(None);
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigError::Tls(e.to_string()))?;

        let mut trust_anchors = Vec::new();
        let builder = match &config.client_ca_file {
            Some(ca_file) => {
                let mut roots = RootCertStore::empty();
                for ca in load_certs(ca_file)? {
                    trust_anchors.push(PeerCertificate::from_der(&ca).map_err(|source| {
                        ConfigError::Certificate {
                            what: "client CA certificate",
                            source,
                        }
                    })?);
                    roots
                        .add(ca)
                        .map_err(|e| ConfigError::Tls(format!("add client CA: {}", e)))?;
                }
                let client_verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| ConfigError::Tls(format!("build client verifier: {}", e)))?;
                builder.with_client_cert_verifier(client_verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let server_config = builder
            .with_single_cert(load_certs(cert_file)?, load_key(key_file)?)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;

        Ok(Some(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            security,
            trust_anchors,
            verifier,
        }))
    }

    pub fn security(&self) -> Security {
        self.security
    }

    /// Run the handshake and, with revocation methods configured, check the
    /// client chain. Returns the stream and the client's leaf certificate.
    pub async fn accept<IO>(
        &self,
        stream: IO,
    ) -> Result<(TlsStream<IO>, Option<Arc<PeerCertificate>>), TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.acceptor.accept(stream).await.map_err(TlsError::Handshake)?;

        let presented: Vec<Vec<u8>> = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
            .unwrap_or_default();
        let leaf = presented
            .first()
            .map(|der| PeerCertificate::from_der(der).map(Arc::new))
            .transpose()?;

        if self.security == Security::WithMtlsVerify {
            let chain = self.verified_chain(&presented)?;
            if let Err(e) = self.verifier.verify_peer_certificate(&presented, &[chain]).await {
                warn!(
                    subject = ?leaf.as_deref().map(PeerCertificate::subject),
                    error = %e,
                    "Client certificate rejected"
                );
                return Err(e.into());
            }
        }

        if let Some(leaf) = &leaf {
            debug!(subject = %leaf.subject(), serial = %leaf.serial_hex(), "Client certificate accepted");
        }
        Ok((stream, leaf))
    }

    /// Order the presented certificates from the leaf up and finish the chain
    /// with the trust anchor that issued it
    fn verified_chain(&self, presented: &[Vec<u8>]) -> Result<Vec<PeerCertificate>, TlsError> {
        let presented = presented
            .iter()
            .map(|der| PeerCertificate::from_der(der))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(leaf) = presented.first() else {
            return Ok(Vec::new());
        };

        let mut chain = vec![leaf.clone()];
        while chain.len() <= presented.len() + self.trust_anchors.len() {
            let Some(current) = chain.last() else { break };
            if current.is_root_ca() {
                break;
            }
            let issuer = find_issuer(current, &presented)
                .or_else(|| find_issuer(current, &self.trust_anchors));
            match issuer {
                Some(issuer) if !chain.contains(issuer) => chain.push(issuer.clone()),
                _ => break,
            }
        }
        Ok(chain)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::Tls(format!("open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("read certificates from {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::Tls(format!("open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ConfigError::Tls(format!("read private key from {}: {}", path.display(), e)))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in {}", path.display())))
}
