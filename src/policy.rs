//! Reference policy handler
//!
//! [`AclHandler`] authorizes sessions with the ACL rules from the
//! configuration, optionally moves every topic under a per-tenant prefix and
//! logs the notifications it receives.

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::acl::AclEvaluator;
use crate::config::{ConfigError, GatewayConfig};
use crate::mqtt::{TopicMatcher, TopicPrefix};
use crate::session::{Handler, Publication, Session};

/// ACL backed [`Handler`]
#[derive(Debug, Default)]
pub struct AclHandler {
    acl: AclEvaluator,
    prefix: Option<TopicPrefix>,
    topic_matcher: TopicMatcher,
}

impl AclHandler {
    pub fn new(acl: AclEvaluator, prefix: Option<TopicPrefix>) -> Self {
        Self {
            acl,
            prefix,
            topic_matcher: TopicMatcher::new(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let acl = AclEvaluator::new(&config.acl)?;
        let prefix = config
            .policy
            .topic_prefix
            .as_deref()
            .filter(|template| !template.is_empty())
            .map(TopicPrefix::new);

        info!(
            acl_enabled = acl.is_enabled(),
            acl_rules = acl.rule_count(),
            topic_prefix = ?prefix,
            "Policy handler configured"
        );
        Ok(Self::new(acl, prefix))
    }

    /// Split a topic into the name rules are evaluated against and the name
    /// forwarded to the broker. Topics that already carry the session prefix,
    /// such as deliveries from the broker, are not prefixed twice.
    fn localize(&self, session: &Session, topic: &str) -> (String, String) {
        let Some(prefix) = &self.prefix else {
            return (topic.to_string(), topic.to_string());
        };
        match prefix.strip(topic, &session.username, &session.id) {
            Some(local) => (local.to_string(), topic.to_string()),
            None => (
                topic.to_string(),
                prefix.apply(topic, &session.username, &session.id),
            ),
        }
    }
}

#[async_trait]
impl Handler for AclHandler {
    async fn auth_connect(&self, session: Session) -> Result<Session> {
        info!(
            client_id = %session.client_id(),
            username = %session.username,
            peer = ?session.peer_addr,
            common_name = ?session.certificate.as_deref().and_then(|c| c.common_name()),
            "MQTT CONNECT"
        );

        let decision = self.acl.can_connect(&session);
        if !decision.allowed {
            warn!(
                client_id = %session.client_id(),
                rule = ?decision.rule_name,
                "CONNECT denied by ACL"
            );
            bail!("{}", decision.reason);
        }

        debug!(client_id = %session.client_id(), "CONNECT allowed");
        Ok(session)
    }

    async fn auth_publish(&self, session: &Session, publication: Publication) -> Result<Publication> {
        if !self.topic_matcher.is_valid_topic(&publication.topic) {
            bail!("invalid topic name '{}'", publication.topic);
        }

        let (local, forwarded) = self.localize(session, &publication.topic);
        let decision = self.acl.can_publish(session, &local);
        if !decision.allowed {
            info!(
                client_id = %session.client_id(),
                topic = %local,
                rule = ?decision.rule_name,
                "PUBLISH denied by ACL"
            );
            bail!("{}", decision.reason);
        }

        debug!(client_id = %session.client_id(), topic = %forwarded, "PUBLISH allowed");
        Ok(Publication {
            topic: forwarded,
            payload: publication.payload,
        })
    }

    async fn auth_subscribe(&self, session: &Session, topics: Vec<String>) -> Result<Vec<String>> {
        let mut authorized = Vec::with_capacity(topics.len());

        for topic in &topics {
            if !self.topic_matcher.is_valid_filter(topic) {
                bail!("invalid topic filter '{}'", topic);
            }

            let (local, forwarded) = self.localize(session, topic);
            let decision = self.acl.can_subscribe(session, &local);
            if !decision.allowed {
                info!(
                    client_id = %session.client_id(),
                    topic = %local,
                    rule = ?decision.rule_name,
                    "SUBSCRIBE denied by ACL"
                );
                bail!("{}", decision.reason);
            }
            authorized.push(forwarded);
        }

        debug!(client_id = %session.client_id(), topics = ?authorized, "SUBSCRIBE allowed");
        Ok(authorized)
    }

    async fn connect(&self, session: &Session) -> Result<()> {
        info!(client_id = %session.client_id(), username = %session.username, "Client connected");
        Ok(())
    }

    async fn publish(&self, session: &Session, publication: &Publication) -> Result<()> {
        debug!(
            client_id = %session.client_id(),
            topic = %publication.topic,
            size = publication.payload.len(),
            "Published"
        );
        Ok(())
    }

    async fn subscribe(&self, session: &Session, topics: &[String]) -> Result<()> {
        debug!(client_id = %session.client_id(), topics = ?topics, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, session: &Session, topics: &[String]) -> Result<()> {
        debug!(client_id = %session.client_id(), topics = ?topics, "Unsubscribed");
        Ok(())
    }

    async fn disconnect(&self, session: &Session) -> Result<()> {
        info!(client_id = %session.client_id(), "Client disconnected");
        Ok(())
    }
}
