//! ACL rule evaluation engine

use crate::config::{AclAction, AclConfig, ConfigError, MqttAction};
use crate::mqtt::TopicMatcher;
use crate::session::Session;
use tracing::{debug, warn};

use super::rules::{AclDecision, AclRequest, CompiledRule};

/// ACL Evaluator - evaluates access control rules for MQTT operations
#[derive(Debug)]
pub struct AclEvaluator {
    /// Compiled rules sorted by priority (highest first)
    rules: Vec<CompiledRule>,
    /// Default action when no rule matches a topic operation
    default_action: AclAction,
    /// Topic matcher for wildcard patterns
    topic_matcher: TopicMatcher,
    /// Whether ACL is enabled
    enabled: bool,
}

impl AclEvaluator {
    /// Create a new ACL evaluator from configuration
    pub fn new(config: &AclConfig) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(config.rules.len());

        for rule in &config.rules {
            match CompiledRule::from_config(rule) {
                Ok(compiled) => rules.push(compiled),
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "Failed to compile ACL rule");
                    return Err(e);
                }
            }
        }

        // Stable sort keeps configuration order within a priority
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(Self {
            rules,
            default_action: config.default_action,
            topic_matcher: TopicMatcher::new(),
            enabled: config.enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Evaluate an ACL request
    pub fn evaluate(&self, request: &AclRequest<'_>) -> AclDecision {
        if !self.enabled {
            return AclDecision {
                allowed: true,
                rule_name: None,
                reason: "ACL disabled".to_string(),
            };
        }

        for rule in &self.rules {
            if !rule.matches_session(request.session) {
                continue;
            }

            if !rule.matches_action(request.action) {
                continue;
            }

            // Topics are ignored for connect
            if let Some(topic) = request.topic {
                let topic_matches = rule
                    .topic_patterns
                    .iter()
                    .any(|pattern| self.topic_matcher.matches(topic, pattern));
                if !topic_matches {
                    continue;
                }
            }

            debug!(
                rule = %rule.name,
                client_id = %request.session.client_id(),
                topic = ?request.topic,
                action = ?request.action,
                decision = ?rule.decision,
                "ACL rule matched"
            );

            return match rule.decision {
                AclAction::Allow => AclDecision::allow(&rule.name),
                AclAction::Deny => AclDecision::deny(&rule.name),
            };
        }

        // The default action only governs topic operations
        if request.action == MqttAction::Connect {
            return AclDecision::default_allow();
        }

        debug!(
            client_id = %request.session.client_id(),
            topic = ?request.topic,
            action = ?request.action,
            default = ?self.default_action,
            "No ACL rule matched, using default"
        );

        match self.default_action {
            AclAction::Allow => AclDecision::default_allow(),
            AclAction::Deny => AclDecision::default_deny(),
        }
    }

    /// Check if a session may connect
    pub fn can_connect(&self, session: &Session) -> AclDecision {
        self.evaluate(&AclRequest {
            session,
            topic: None,
            action: MqttAction::Connect,
        })
    }

    /// Check if a topic can be published to
    pub fn can_publish(&self, session: &Session, topic: &str) -> AclDecision {
        self.evaluate(&AclRequest {
            session,
            topic: Some(topic),
            action: MqttAction::Publish,
        })
    }

    /// Check if a topic filter can be subscribed to
    pub fn can_subscribe(&self, session: &Session, topic_filter: &str) -> AclDecision {
        self.evaluate(&AclRequest {
            session,
            topic: Some(topic_filter),
            action: MqttAction::Subscribe,
        })
    }

    /// Get the number of loaded rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for AclEvaluator {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_action: AclAction::Allow,
            topic_matcher: TopicMatcher::new(),
            enabled: false,
        }
    }
}
