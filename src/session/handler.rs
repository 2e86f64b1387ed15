//! Policy hooks called by the relay

use async_trait::async_trait;

use super::{Direction, Publication, Session};
use crate::mqtt::ControlPacket;

/// Authorization and notification hooks.
///
/// The `auth_*` hooks run on upstream traffic before it is forwarded. They
/// receive the values the client sent and return the values to forward, so a
/// handler can rewrite identities and topics. Returning an error rejects the
/// packet and ends the session.
///
/// `auth_subscribe` is also consulted for every PUBLISH the broker delivers,
/// with the single delivered topic; an error there disconnects the client.
///
/// Notifications run after an upstream packet has been written to the broker.
/// `disconnect` runs exactly once when the session ends.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn auth_connect(&self, session: Session) -> anyhow::Result<Session>;

    async fn auth_publish(
        &self,
        session: &Session,
        publication: Publication,
    ) -> anyhow::Result<Publication>;

    async fn auth_subscribe(
        &self,
        session: &Session,
        topics: Vec<String>,
    ) -> anyhow::Result<Vec<String>>;

    async fn connect(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish(&self, _session: &Session, _publication: &Publication) -> anyhow::Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _session: &Session, _topics: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _session: &Session, _topics: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _session: &Session) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Inspects every packet in both directions after authorization and before
/// it is written. It may return a different packet; an error drops the
/// packet and ends the session.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        session: &Session,
        packet: ControlPacket,
        direction: Direction,
    ) -> anyhow::Result<ControlPacket>;
}
