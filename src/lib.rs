//! MQTT relay gateway for Sentinel
//!
//! The relay sits between MQTT clients and an upstream broker and forwards
//! control packets in both directions while a policy layer decides what may
//! pass:
//!
//! - **Policy hooks**: a [`Handler`] authorizes CONNECT, PUBLISH and SUBSCRIBE
//!   and may rewrite identities and topics; an [`Interceptor`] sees every
//!   packet in both directions
//! - **Access Control**: identity and topic based ACLs with wildcard support
//! - **TLS termination**: optional TLS and mutual TLS on the client side
//! - **Revocation**: OCSP and CRL checks on client certificate chains
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "listener": { "address": "0.0.0.0:8883", "target": "broker:1883" },
//!   "tls": {
//!     "cert-file": "/etc/mqtt/server.pem",
//!     "key-file": "/etc/mqtt/server.key",
//!     "client-ca-file": "/etc/mqtt/clients-ca.pem"
//!   },
//!   "revocation": {
//!     "methods": ["ocsp", "crl"],
//!     "crl": { "offline-crl-file": "/etc/mqtt/clients.crl" }
//!   },
//!   "acl": {
//!     "enabled": true,
//!     "default-action": "deny",
//!     "rules": [
//!       {
//!         "name": "allow-sensors",
//!         "match": { "username-regex": "^sensor-" },
//!         "topics": ["sensors/+/data"],
//!         "actions": ["publish"],
//!         "decision": "allow"
//!       }
//!     ]
//!   }
//! }
//! ```

pub mod acl;
pub mod certificate;
pub mod config;
pub mod mqtt;
pub mod policy;
pub mod proxy;
pub mod revocation;
pub mod session;
pub mod tls;

#[cfg(test)]
mod testing;

// Re-export main types
pub use config::GatewayConfig;
pub use policy::AclHandler;
pub use proxy::Proxy;
pub use revocation::RevocationVerifier;
pub use session::{Handler, Interceptor, Relay, Session};
