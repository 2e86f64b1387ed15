//! Relay sessions
//!
//! A [`Session`] is the identity of one client connection as seen by the
//! policy hooks. The [`Relay`] pumps control packets between the client and
//! the broker and calls the [`Handler`] and [`Interceptor`] for each of them.

mod handler;
mod stream;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::certificate::PeerCertificate;
use crate::mqtt::{ParsedConnect, ParsedPublish};

pub use handler::{Handler, Interceptor};
pub use stream::{stream, PumpError, Relay, RelayError};

/// Client id reported before a CONNECT has been seen
pub const UNKNOWN_CLIENT_ID: &str = "unknown";

/// Identity of a relayed connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Client identifier from CONNECT (hooks may rewrite it)
    pub id: String,
    /// Username from CONNECT, empty when absent
    pub username: String,
    /// Password from CONNECT, empty when absent
    pub password: Vec<u8>,
    /// Leaf certificate presented by the client over mTLS
    pub certificate: Option<Arc<PeerCertificate>>,
    /// Remote address of the client when known
    pub peer_addr: Option<SocketAddr>,
}

impl Session {
    pub fn new(certificate: Option<Arc<PeerCertificate>>) -> Self {
        Self {
            certificate,
            ..Default::default()
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    /// Client id for diagnostics
    pub fn client_id(&self) -> &str {
        if self.id.is_empty() {
            UNKNOWN_CLIENT_ID
        } else {
            &self.id
        }
    }

    /// Copy the identity fields of a CONNECT packet into this session
    pub(crate) fn with_connect(mut self, connect: &ParsedConnect) -> Self {
        self.id = connect.client_id.clone();
        self.username = connect.username.clone().unwrap_or_default();
        self.password = connect.password.clone().unwrap_or_default();
        self
    }

    pub(crate) fn same_identity(&self, other: &Session) -> bool {
        self.id == other.id && self.username == other.username && self.password == other.password
    }

    /// Write the identity fields back into a CONNECT packet
    pub(crate) fn write_connect(&self, connect: &mut ParsedConnect) {
        connect.client_id = self.id.clone();
        connect.username = (!self.username.is_empty()).then(|| self.username.clone());
        connect.password = (!self.password.is_empty()).then(|| self.password.clone());
    }
}

/// Direction a packet travels through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to broker
    Upstream,
    /// Broker to client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => f.write_str("upstream"),
            Self::Downstream => f.write_str("downstream"),
        }
    }
}

/// Topic and payload of a PUBLISH as presented to the hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl From<&ParsedPublish> for Publication {
    fn from(publish: &ParsedPublish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
        }
    }
}
