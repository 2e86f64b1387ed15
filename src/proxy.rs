//! Client listener
//!
//! Accepts client connections, dials the broker for each of them, terminates
//! TLS when configured and hands both streams to the [`Relay`]. Each
//! connection runs in its own task; a failing session is logged and does not
//! affect the others.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, GatewayConfig};
use crate::revocation::RevocationVerifier;
use crate::session::{Handler, Relay, RelayError, Session};
use crate::tls::{Security, TlsError, TlsTerminator};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("failed to connect to MQTT broker at {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// MQTT relay listener
#[derive(Clone)]
pub struct Proxy {
    address: String,
    target: String,
    relay: Relay,
    tls: Option<Arc<TlsTerminator>>,
}

impl Proxy {
    pub fn new(address: impl Into<String>, target: impl Into<String>, relay: Relay) -> Self {
        Self {
            address: address.into(),
            target: target.into(),
            relay,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsTerminator) -> Self {
        self.tls = Some(Arc::new(tls));
        self
    }

    /// Build the listener, TLS termination and revocation checks from the
    /// configuration
    pub fn from_config(config: &GatewayConfig, handler: Arc<dyn Handler>) -> Result<Self, ConfigError> {
        let verifier = RevocationVerifier::from_config(&config.revocation)?;
        let relay = Relay::new(handler).with_packet_logging(config.general.log_packets);

        let mut proxy = Self::new(&config.listener.address, &config.listener.target, relay);
        if let Some(tls) = TlsTerminator::from_config(&config.tls, verifier)? {
            proxy = proxy.with_tls(tls);
        }
        Ok(proxy)
    }

    pub fn security(&self) -> Security {
        self.tls
            .as_ref()
            .map(|tls| tls.security())
            .unwrap_or(Security::WithoutTls)
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(&self.address)
            .await
            .map_err(|source| ProxyError::Bind {
                address: self.address.clone(),
                source,
            })
    }

    /// Bind the configured address and serve until `shutdown` completes
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` completes. Sessions
    /// already running are left to finish on their own.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr().ok();
        info!(
            address = ?local_addr,
            target = %self.target,
            security = %self.security(),
            "MQTT relay listening"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((client, peer_addr)) => {
                            let proxy = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = proxy.handle(client, peer_addr).await {
                                    warn!(peer = %peer_addr, error = %e, "MQTT session ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("MQTT relay received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle(&self, client: TcpStream, peer_addr: SocketAddr) -> Result<(), ProxyError> {
        debug!(peer = %peer_addr, "Accepted client connection");

        let broker = TcpStream::connect(&self.target)
            .await
            .map_err(|source| ProxyError::Connect {
                target: self.target.clone(),
                source,
            })?;

        match &self.tls {
            Some(tls) => {
                let (client, certificate) = tls.accept(client).await?;
                let session = Session::new(certificate).with_peer_addr(peer_addr);
                self.relay.stream(client, broker, session).await?;
            }
            None => {
                let session = Session::new(None).with_peer_addr(peer_addr);
                self.relay.stream(client, broker, session).await?;
            }
        }

        debug!(peer = %peer_addr, "MQTT session closed");
        Ok(())
    }
}
