//! Reconnect-safe topic subscriptions.
//!
//! [`attach`] binds a callback to a topic for as long as the returned
//! [`Attachment`] lives, no matter when the session connects, drops or
//! comes back. It registers a connect-listener that subscribes whenever no
//! live subscription is held, and subscribes right away when the session is
//! already connected.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use platforma_shared::Topic;

use crate::registry::{self, ConnectionRegistry, ListenerDisposer};
use crate::session::{InboundFrame, Subscription};

type FrameCallback = Arc<dyn Fn(InboundFrame) + Send + Sync>;

struct Slot {
    topic: Topic,
    callback: FrameCallback,
    detached: AtomicBool,
    held: Mutex<Option<Subscription>>,
}

impl Slot {
    fn held(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe unless detached or already holding a live subscription.
    fn ensure_subscribed(self: &Arc<Self>, registry: &ConnectionRegistry) {
        let mut held = self.held();
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        if held.as_ref().is_some_and(Subscription::is_active) {
            return;
        }
        let Some(session) = registry.session() else {
            return;
        };
        if !session.is_connected() {
            return;
        }

        let slot = Arc::downgrade(self);
        match session.subscribe(self.topic.clone(), move |frame| deliver(&slot, frame)) {
            Ok(subscription) => {
                tracing::debug!(
                    destination = %self.topic,
                    subscription = subscription.id(),
                    generation = subscription.generation(),
                    "Topic attached"
                );
                *held = Some(subscription);
            }
            Err(e) => {
                tracing::debug!(destination = %self.topic, error = %e, "Subscribe deferred until connected");
            }
        }
    }
}

fn deliver(slot: &Weak<Slot>, frame: InboundFrame) {
    let Some(slot) = slot.upgrade() else {
        return;
    };
    if slot.detached.load(Ordering::SeqCst) {
        return;
    }
    (slot.callback)(frame);
}

/// A topic kept subscribed across reconnects. Detaches on drop.
#[must_use = "dropping the attachment unsubscribes immediately"]
pub struct Attachment {
    slot: Arc<Slot>,
    disposer: Option<ListenerDisposer>,
}

impl Attachment {
    pub fn topic(&self) -> &Topic {
        &self.slot.topic
    }

    /// Whether a live subscription is currently held.
    pub fn is_subscribed(&self) -> bool {
        self.slot.held().as_ref().is_some_and(Subscription::is_active)
    }

    /// The live subscription, if any.
    pub fn subscription(&self) -> Option<Subscription> {
        self.slot.held().clone().filter(Subscription::is_active)
    }

    /// Unsubscribe and stop resubscribing. Idempotent.
    pub fn detach(&mut self) {
        if self.slot.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(subscription) = self.slot.held().take() {
            subscription.unsubscribe();
        }
        if let Some(mut disposer) = self.disposer.take() {
            disposer.dispose();
        }
        tracing::debug!(destination = %self.slot.topic, "Topic detached");
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("topic", &self.slot.topic)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

/// Attach `callback` to `topic` on the process-wide registry.
pub fn attach<F>(topic: impl Into<Topic>, callback: F) -> Attachment
where
    F: Fn(InboundFrame) + Send + Sync + 'static,
{
    attach_to(&registry::global(), topic, callback)
}

/// Attach `callback` to `topic` on `registry`.
///
/// The connect-listener is registered before the immediate subscribe
/// attempt, so a connection completing in between is not missed.
pub fn attach_to<F>(registry: &Arc<ConnectionRegistry>, topic: impl Into<Topic>, callback: F) -> Attachment
where
    F: Fn(InboundFrame) + Send + Sync + 'static,
{
    let slot = Arc::new(Slot {
        topic: topic.into(),
        callback: Arc::new(callback),
        detached: AtomicBool::new(false),
        held: Mutex::new(None),
    });

    let weak_registry = Arc::downgrade(registry);
    let weak_slot = Arc::downgrade(&slot);
    let disposer = registry.on_connect(move || {
        if let (Some(registry), Some(slot)) = (weak_registry.upgrade(), weak_slot.upgrade()) {
            slot.ensure_subscribed(&registry);
        }
    });

    slot.ensure_subscribed(registry);

    Attachment {
        slot,
        disposer: Some(disposer),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::credential::Credential;
    use crate::session::ReconnectPolicy;
    use crate::testing::{wait_until, FakeBroker};
    use crate::transport::{MockConnector, TransportError};

    fn config(delay_ms: u64) -> RealtimeConfig {
        RealtimeConfig {
            reconnect: ReconnectPolicy::Constant {
                delay: Duration::from_millis(delay_ms),
            },
            ..RealtimeConfig::default()
        }
    }

    fn registry(broker: &FakeBroker) -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(config(20), broker.connector()))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(InboundFrame) + Send + Sync + 'static) {
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&bodies);
        (bodies, move |frame: InboundFrame| {
            sink.lock().unwrap().push(frame.body);
        })
    }

    #[tokio::test]
    async fn test_attach_while_connected_delivers_once() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let topic = "/topic/conversations.42";

        registry.connect(Credential::new("tok-1"));
        wait_until(|| registry.is_connected()).await;

        let (bodies, callback) = recorder();
        let attachment = attach_to(&registry, topic, callback);
        assert!(attachment.is_subscribed());
        wait_until(|| broker.subscription_count(topic) == 1).await;

        broker.publish(topic, r#"{"id":1,"content":"hi"}"#);
        wait_until(|| bodies.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            *bodies.lock().unwrap(),
            vec![r#"{"id":1,"content":"hi"}"#.to_string()]
        );

        drop(attachment);
        registry.disconnect();
    }

    #[tokio::test]
    async fn test_attach_before_connect_subscribes_later() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let topic = "/topic/conversations.7";

        let (bodies, callback) = recorder();
        let attachment = attach_to(&registry, topic, callback);
        assert!(!attachment.is_subscribed());

        registry.connect(Credential::new("tok-2"));
        wait_until(|| broker.subscription_count(topic) == 1).await;
        assert!(attachment.is_subscribed());

        broker.publish(topic, r#"{"id":5}"#);
        wait_until(|| bodies.lock().unwrap().len() == 1).await;

        drop(attachment);
        registry.disconnect();
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_each_topic_once() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let topics = ["/topic/conversations.1", "/topic/conversations.2", "/topic/announcements"];

        registry.connect(Credential::new("t"));
        wait_until(|| registry.is_connected()).await;

        let attachments: Vec<_> = topics
            .iter()
            .map(|topic| attach_to(&registry, *topic, |_| {}))
            .collect();
        for topic in topics {
            wait_until(|| broker.subscription_count(topic) == 1).await;
        }

        broker.drop_connections();
        wait_until(|| broker.connection_count() == 2).await;
        for topic in topics {
            wait_until(|| broker.subscription_count(topic) == 1).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for topic in topics {
            assert_eq!(broker.subscription_count(topic), 1, "{topic}");
        }
        assert!(attachments.iter().all(Attachment::is_subscribed));

        drop(attachments);
        registry.disconnect();
    }

    #[tokio::test]
    async fn test_frame_after_resubscribe_is_delivered() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let topic = "/topic/conversations.9";

        registry.connect(Credential::new("t"));
        let (bodies, callback) = recorder();
        let attachment = attach_to(&registry, topic, callback);
        wait_until(|| broker.subscription_count(topic) == 1).await;

        broker.drop_connections();
        assert_eq!(broker.publish(topic, r#"{"id":1}"#), 0);

        wait_until(|| broker.subscription_count(topic) == 1).await;
        assert_eq!(broker.publish(topic, r#"{"id":2}"#), 1);
        wait_until(|| bodies.lock().unwrap().len() == 1).await;
        assert_eq!(bodies.lock().unwrap()[0], r#"{"id":2}"#);

        drop(attachment);
        registry.disconnect();
    }

    #[tokio::test]
    async fn test_detach_is_complete() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let topic = "/topic/conversations.3";

        registry.connect(Credential::new("t"));
        let (bodies, callback) = recorder();
        let mut attachment = attach_to(&registry, topic, callback);
        wait_until(|| broker.subscription_count(topic) == 1).await;
        let held = attachment.subscription().expect("subscribed");

        attachment.detach();
        attachment.detach();
        assert!(!held.is_active());
        assert_eq!(registry.listener_count(), 0);
        wait_until(|| broker.subscription_count(topic) == 0).await;

        broker.drop_connections();
        wait_until(|| broker.connection_count() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.subscription_count(topic), 0);

        broker.publish(topic, "{}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(bodies.lock().unwrap().is_empty());

        registry.disconnect();
    }

    #[tokio::test]
    async fn test_dropping_attachment_detaches() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let topic = "/topic/announcements";

        registry.connect(Credential::new("t"));
        let attachment = attach_to(&registry, topic, |_| {});
        wait_until(|| broker.subscription_count(topic) == 1).await;

        drop(attachment);
        wait_until(|| broker.subscription_count(topic) == 0).await;
        assert_eq!(registry.listener_count(), 0);

        registry.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_during_reconnect_wait_stops_attempts() {
        let broker = FakeBroker::new();
        let registry = Arc::new(ConnectionRegistry::new(config(200), broker.connector()));
        let attachment = attach_to(&registry, "/topic/conversations.4", |_| {});

        registry.connect(Credential::new("t"));
        wait_until(|| registry.is_connected()).await;

        broker.set_accepting(false);
        broker.drop_connections();
        wait_until(|| {
            registry
                .session()
                .is_some_and(|s| s.state() == crate::session::SessionState::Reconnecting)
        })
        .await;

        let attempts = broker.connect_attempts();
        registry.disconnect();
        broker.set_accepting(true);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(broker.connect_attempts(), attempts);
        assert!(registry.session().is_none());
        assert!(!attachment.is_subscribed());
    }

    #[tokio::test]
    async fn test_failing_connector_keeps_retrying_at_fixed_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::ConnectFailed("server down".into()))
        });

        let registry = Arc::new(ConnectionRegistry::new(config(10), Arc::new(connector)));
        let attachment = attach_to(&registry, "/topic/conversations.5", |_| {});
        registry.connect(Credential::new("t"));

        wait_until(|| calls.load(Ordering::SeqCst) >= 4).await;
        assert!(!attachment.is_subscribed());
        assert!(!registry.is_connected());

        registry.disconnect();
    }
}
