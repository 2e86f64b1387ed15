//! ACL rule types and matching logic

use crate::config::{AclAction, AclRule, ConfigError, MqttAction};
use crate::session::Session;
use ipnet::IpNet;
use regex::Regex;
use std::net::IpAddr;
use std::str::FromStr;

/// ACL evaluation request
#[derive(Debug, Clone)]
pub struct AclRequest<'a> {
    /// Session identity (client id, username, peer address, certificate)
    pub session: &'a Session,
    /// Topic or topic filter being accessed, `None` for connect
    pub topic: Option<&'a str>,
    /// Action being performed
    pub action: MqttAction,
}

/// Result of ACL evaluation
#[derive(Debug, Clone)]
pub struct AclDecision {
    /// Whether access is allowed
    pub allowed: bool,
    /// Name of the matching rule (if any)
    pub rule_name: Option<String>,
    /// Reason for the decision
    pub reason: String,
}

impl AclDecision {
    pub fn allow(rule_name: &str) -> Self {
        Self {
            allowed: true,
            rule_name: Some(rule_name.to_string()),
            reason: format!("Allowed by rule: {}", rule_name),
        }
    }

    pub fn deny(rule_name: &str) -> Self {
        Self {
            allowed: false,
            rule_name: Some(rule_name.to_string()),
            reason: format!("Denied by rule: {}", rule_name),
        }
    }

    pub fn default_deny() -> Self {
        Self {
            allowed: false,
            rule_name: None,
            reason: "No matching rule, default deny".to_string(),
        }
    }

    pub fn default_allow() -> Self {
        Self {
            allowed: true,
            rule_name: None,
            reason: "No matching rule, default allow".to_string(),
        }
    }
}

/// Compiled ACL rule for efficient matching
#[derive(Debug)]
pub struct CompiledRule {
    pub name: String,
    pub priority: i32,
    pub username_regex: Option<Regex>,
    pub client_id_regex: Option<Regex>,
    pub client_ip_net: Option<IpNet>,
    pub common_name_regex: Option<Regex>,
    pub topic_patterns: Vec<String>,
    pub actions: Vec<MqttAction>,
    pub decision: AclAction,
}

impl CompiledRule {
    /// Compile a rule from configuration
    pub fn from_config(rule: &AclRule) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::AclRule {
            rule: rule.name.clone(),
            reason,
        };
        let conditions = &rule.match_conditions;

        let username_regex = exact_or_regex(&conditions.username, &conditions.username_regex)
            .map_err(|e| invalid(format!("Invalid username pattern: {}", e)))?;
        let client_id_regex = exact_or_regex(&conditions.client_id, &conditions.client_id_regex)
            .map_err(|e| invalid(format!("Invalid client_id pattern: {}", e)))?;
        let common_name_regex =
            exact_or_regex(&conditions.common_name, &conditions.common_name_regex)
                .map_err(|e| invalid(format!("Invalid common_name pattern: {}", e)))?;

        let client_ip_net = conditions
            .client_ip
            .as_deref()
            .map(|ip| {
                IpNet::from_str(ip)
                    .or_else(|_| IpAddr::from_str(ip).map(IpNet::from))
                    .map_err(|e| invalid(format!("Invalid IP/CIDR: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            name: rule.name.clone(),
            priority: rule.priority,
            username_regex,
            client_id_regex,
            client_ip_net,
            common_name_regex,
            topic_patterns: rule.topics.clone(),
            actions: rule.actions.clone(),
            decision: rule.decision,
        })
    }

    /// Check if this rule matches the session identity
    pub fn matches_session(&self, session: &Session) -> bool {
        if let Some(ref regex) = self.username_regex {
            if session.username.is_empty() || !regex.is_match(&session.username) {
                return false;
            }
        }

        if let Some(ref regex) = self.client_id_regex {
            if !regex.is_match(&session.id) {
                return false;
            }
        }

        if let Some(ref net) = self.client_ip_net {
            match session.peer_addr {
                Some(addr) if net.contains(&addr.ip()) => {}
                _ => return false,
            }
        }

        if let Some(ref regex) = self.common_name_regex {
            let common_name = session
                .certificate
                .as_deref()
                .and_then(|cert| cert.common_name());
            match common_name {
                Some(cn) if regex.is_match(cn) => {}
                _ => return false,
            }
        }

        true
    }

    /// Check if this rule matches the action.
    ///
    /// Connect rules must name the action explicitly; an empty action list
    /// covers the topic operations only.
    pub fn matches_action(&self, action: MqttAction) -> bool {
        match action {
            MqttAction::Connect => self.actions.contains(&MqttAction::Connect),
            _ => self.actions.is_empty() || self.actions.contains(&action),
        }
    }
}

fn exact_or_regex(
    exact: &Option<String>,
    pattern: &Option<String>,
) -> Result<Option<Regex>, regex::Error> {
    match (exact, pattern) {
        (Some(exact), _) => Regex::new(&format!("^{}$", regex::escape(exact))).map(Some),
        (_, Some(pattern)) => Regex::new(pattern).map(Some),
        (None, None) => Ok(None),
    }
}
