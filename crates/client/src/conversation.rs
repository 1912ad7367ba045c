//! Live view of one conversation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use platforma_shared::{MessageDto, Topic};

use crate::adapter::{attach_to, Attachment};
use crate::registry::ConnectionRegistry;
use crate::session::InboundFrame;

#[derive(Default)]
struct FeedState {
    seen: HashSet<i64>,
    messages: Vec<MessageDto>,
}

impl FeedState {
    fn insert(&mut self, message: MessageDto) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

/// Messages of a conversation: REST history merged with live broker
/// traffic, deduplicated by message id.
pub struct ConversationFeed {
    conversation_id: i64,
    state: Arc<Mutex<FeedState>>,
    attachment: Attachment,
}

impl ConversationFeed {
    /// Follow `/topic/conversations.<id>`. `on_message` runs for every new
    /// live message, never for duplicates.
    pub fn open<F>(registry: &Arc<ConnectionRegistry>, conversation_id: i64, on_message: F) -> Self
    where
        F: Fn(&MessageDto) + Send + Sync + 'static,
    {
        let state = Arc::new(Mutex::new(FeedState::default()));
        let feed_state = Arc::clone(&state);

        let attachment = attach_to(
            registry,
            Topic::conversation(conversation_id),
            move |frame: InboundFrame| {
                let message = match frame.json::<MessageDto>() {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(
                            conversation_id,
                            destination = %frame.destination,
                            error = %e,
                            "Ignoring undecodable message"
                        );
                        return;
                    }
                };

                let added = lock(&feed_state).insert(message.clone());
                if added {
                    on_message(&message);
                } else {
                    tracing::trace!(conversation_id, message_id = message.id, "Duplicate message dropped");
                }
            },
        );

        Self {
            conversation_id,
            state,
            attachment,
        }
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    /// Merge REST history (any order). Returns how many messages were new.
    /// Afterwards the feed is ordered by message id.
    pub fn seed(&self, history: impl IntoIterator<Item = MessageDto>) -> usize {
        let mut state = lock(&self.state);
        let added = history
            .into_iter()
            .filter(|message| state.insert(message.clone()))
            .count();
        state.messages.sort_by_key(|message| message.id);
        added
    }

    /// Snapshot of the messages held so far.
    pub fn messages(&self) -> Vec<MessageDto> {
        lock(&self.state).messages.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_live(&self) -> bool {
        self.attachment.is_subscribed()
    }

    /// Stop following the conversation.
    pub fn close(mut self) {
        self.attachment.detach();
    }
}

fn lock(state: &Mutex<FeedState>) -> MutexGuard<'_, FeedState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::credential::Credential;
    use crate::session::ReconnectPolicy;
    use crate::testing::{wait_until, FakeBroker};

    fn message(id: i64, content: &str) -> MessageDto {
        MessageDto {
            id,
            sender_id: 7,
            content: Some(content.to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, id as u32).unwrap(),
            attachments: None,
        }
    }

    fn registry(broker: &FakeBroker) -> Arc<ConnectionRegistry> {
        let config = RealtimeConfig {
            reconnect: ReconnectPolicy::Constant {
                delay: Duration::from_millis(20),
            },
            ..RealtimeConfig::default()
        };
        Arc::new(ConnectionRegistry::new(config, broker.connector()))
    }

    #[test]
    fn test_seed_dedupes_and_orders() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let feed = ConversationFeed::open(&registry, 42, |_| {});

        assert_eq!(feed.seed(vec![message(3, "c"), message(1, "a"), message(2, "b")]), 3);
        assert_eq!(feed.seed(vec![message(2, "b"), message(4, "d")]), 1);

        let ids: Vec<_> = feed.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_live_messages_deduplicated() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        registry.connect(Credential::new("t"));

        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        let feed = ConversationFeed::open(&registry, 42, move |m| {
            sink.lock().unwrap().push(m.id);
        });
        feed.seed(vec![message(1, "history")]);

        wait_until(|| broker.subscription_count("/topic/conversations.42") == 1).await;
        assert!(feed.is_live());

        let live = serde_json::to_string(&message(2, "live")).unwrap();
        let history_echo = serde_json::to_string(&message(1, "history")).unwrap();
        broker.publish("/topic/conversations.42", &live);
        broker.publish("/topic/conversations.42", &history_echo);
        broker.publish("/topic/conversations.42", "not json");
        broker.publish("/topic/conversations.42", &live);

        wait_until(|| feed.len() == 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*notified.lock().unwrap(), vec![2]);
        assert_eq!(feed.messages()[1].text(), "live");

        feed.close();
        wait_until(|| broker.subscription_count("/topic/conversations.42") == 0).await;
        registry.disconnect();
    }
}
