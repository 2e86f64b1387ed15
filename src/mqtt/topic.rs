//! MQTT topic matching and rewriting
//!
//! Topic filter matching per MQTT 3.1.1 with single-level (`+`) and
//! multi-level (`#`) wildcards, plus the tenant prefix used to move a
//! client's topics into its own namespace.

/// Topic matcher for MQTT topic filters
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicMatcher;

impl TopicMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if a topic matches a topic filter
    ///
    /// * `+` matches exactly one topic level
    /// * `#` matches zero or more topic levels (must be the last level)
    ///
    /// ```
    /// use sentinel_mqtt_relay::mqtt::TopicMatcher;
    ///
    /// let matcher = TopicMatcher::new();
    /// assert!(matcher.matches("sensors/temp/living-room", "sensors/+/living-room"));
    /// assert!(matcher.matches("sensors/temp/living-room", "sensors/#"));
    /// assert!(!matcher.matches("sensors/temp/bedroom", "sensors/+/living-room"));
    /// ```
    pub fn matches(&self, topic: &str, filter: &str) -> bool {
        let mut topic_levels = topic.split('/');
        let mut filter_levels = filter.split('/').peekable();

        while let Some(level) = filter_levels.next() {
            match level {
                "#" => return filter_levels.peek().is_none(),
                "+" => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                exact => {
                    if topic_levels.next() != Some(exact) {
                        return false;
                    }
                }
            }
        }

        topic_levels.next().is_none()
    }

    /// Check if a topic filter is well formed
    pub fn is_valid_filter(&self, filter: &str) -> bool {
        if filter.is_empty() {
            return false;
        }

        let levels: Vec<&str> = filter.split('/').collect();
        levels.iter().enumerate().all(|(i, level)| {
            !level.is_empty()
                && (!level.contains('#') || (*level == "#" && i == levels.len() - 1))
                && (!level.contains('+') || *level == "+")
        })
    }

    /// Check if a topic name is valid (no wildcards, no empty levels)
    pub fn is_valid_topic(&self, topic: &str) -> bool {
        !topic.is_empty()
            && !topic.contains(['+', '#'])
            && !topic.split('/').any(|level| level.is_empty())
    }
}

/// Topic namespace prepended to every topic a client uses.
///
/// The template may contain `{username}` and `{client_id}` placeholders which
/// are filled in from the session identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPrefix {
    template: String,
}

impl TopicPrefix {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, username: &str, client_id: &str) -> String {
        self.template
            .replace("{username}", username)
            .replace("{client_id}", client_id)
    }

    /// Prefix a topic name or filter
    pub fn apply(&self, topic: &str, username: &str, client_id: &str) -> String {
        let mut prefixed = self.render(username, client_id);
        if !prefixed.is_empty() && !prefixed.ends_with('/') {
            prefixed.push('/');
        }
        prefixed.push_str(topic);
        prefixed
    }

    /// The topic without this session's prefix, if it carries it
    pub fn strip<'a>(&self, topic: &'a str, username: &str, client_id: &str) -> Option<&'a str> {
        let prefixed = self.apply("", username, client_id);
        topic.strip_prefix(prefixed.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let matcher = TopicMatcher::new();
        assert!(matcher.matches("sensors/temp", "sensors/temp"));
        assert!(!matcher.matches("sensors/temp", "sensors/humidity"));
        assert!(!matcher.matches("sensors/temp", "sensors"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let matcher = TopicMatcher::new();

        assert!(matcher.matches("sensors/temp", "sensors/+"));
        assert!(matcher.matches("sensors/temp/living", "+/temp/living"));
        assert!(matcher.matches("a/b/c", "a/+/c"));

        assert!(!matcher.matches("sensors", "sensors/+"));
        assert!(!matcher.matches("sensors/temp/extra", "sensors/+"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let matcher = TopicMatcher::new();

        assert!(matcher.matches("sensors", "sensors/#"));
        assert!(matcher.matches("sensors/temp/living/zone1", "sensors/#"));
        assert!(matcher.matches("a/b/c/d", "#"));
        assert!(matcher.matches("a/b/c/d", "a/+/#"));

        // # in the middle never matches
        assert!(!matcher.matches("a/b/c", "a/#/c"));
    }

    #[test]
    fn test_valid_filters() {
        let matcher = TopicMatcher::new();

        assert!(matcher.is_valid_filter("sensors/+"));
        assert!(matcher.is_valid_filter("sensors/#"));
        assert!(matcher.is_valid_filter("#"));

        assert!(!matcher.is_valid_filter(""));
        assert!(!matcher.is_valid_filter("sensors//temp"));
        assert!(!matcher.is_valid_filter("sensors/temp+1"));
        assert!(!matcher.is_valid_filter("sensors/#/temp"));
        assert!(!matcher.is_valid_filter("sensors/temp#"));
    }

    #[test]
    fn test_valid_topics() {
        let matcher = TopicMatcher::new();

        assert!(matcher.is_valid_topic("sensors/temp"));
        assert!(matcher.is_valid_topic("$SYS/broker/clients"));
        assert!(!matcher.is_valid_topic("sensors/+"));
        assert!(!matcher.is_valid_topic("sensors//temp"));
    }

    #[test]
    fn test_topic_prefix_placeholders() {
        let prefix = TopicPrefix::new("tenants/{username}");
        assert_eq!(
            prefix.apply("sensors/#", "acme", "dev-1"),
            "tenants/acme/sensors/#"
        );

        let prefix = TopicPrefix::new("clients/{client_id}/");
        assert_eq!(prefix.apply("up", "acme", "dev-1"), "clients/dev-1/up");
        assert_eq!(prefix.strip("clients/dev-1/up", "acme", "dev-1"), Some("up"));
        assert_eq!(prefix.strip("clients/dev-2/up", "acme", "dev-1"), None);
    }
}
