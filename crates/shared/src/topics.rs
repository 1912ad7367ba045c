//! Broker destination naming.

use std::fmt;

/// A broker destination a client can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn new(destination: impl Into<String>) -> Self {
        Self(destination.into())
    }

    /// Per-conversation chat stream.
    pub fn conversation(conversation_id: i64) -> Self {
        Self(format!("/topic/conversations.{conversation_id}"))
    }

    /// Broadcast announcement events.
    pub fn announcements() -> Self {
        Self("/topic/announcements".to_string())
    }

    /// Per-user notification queue (resolved server-side from the principal).
    pub fn notifications() -> Self {
        Self("/user/queue/notifications".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Conversation id embedded in a conversation topic.
    pub fn conversation_id(&self) -> Option<i64> {
        self.0
            .strip_prefix("/topic/conversations.")
            .and_then(|id| id.parse().ok())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_topic() {
        let topic = Topic::conversation(42);
        assert_eq!(topic.as_str(), "/topic/conversations.42");
        assert_eq!(topic.conversation_id(), Some(42));
        assert_eq!(Topic::announcements().conversation_id(), None);
    }
}
