//! STOMP protocol session with automatic reconnect.
//!
//! A [`StompSession`] is a cheap handle onto a driver task that owns the
//! transport. The driver connects, negotiates heart-beats, routes MESSAGE
//! frames to subscription callbacks and, when the connection drops,
//! reconnects according to the configured [`ReconnectPolicy`] until the
//! session is deactivated.
//!
//! Subscriptions do not survive a reconnect. Every successful CONNECTED
//! starts a new generation, and the connect hook passed to
//! [`StompSession::activate`] is where subscriptions get re-established.

mod backoff;
mod driver;
mod state;
mod subscriptions;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use platforma_shared::stomp::headers;
use platforma_shared::{Frame, Topic};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use backoff::{ReconnectBackoff, ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
pub use state::SessionState;
pub use subscriptions::Subscription;

use crate::config::RealtimeConfig;
use crate::credential::Credential;
use crate::transport::Connector;
use driver::{ConnectHook, SessionDriver};
use state::StateCell;
use subscriptions::{Route, RoutingTable};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Errors returned to callers of the session API.
///
/// Connection failures never show up here: they are handled by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Subscribing or publishing requires the Connected state.
    #[error("session is not connected (state: {0:?})")]
    NotConnected(SessionState),

    #[error("session has been deactivated")]
    Inactive,
}

/// A decoded MESSAGE frame, handed to subscription callbacks untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub destination: String,
    pub subscription: String,
    pub message_id: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl InboundFrame {
    pub(crate) fn from_message(frame: Frame) -> Option<Self> {
        let subscription = frame.header(headers::SUBSCRIPTION)?.to_string();
        let destination = frame
            .header(headers::DESTINATION)
            .unwrap_or_default()
            .to_string();
        let message_id = frame.header(headers::MESSAGE_ID).map(str::to_string);
        Some(Self {
            destination,
            subscription,
            message_id,
            headers: frame.headers,
            body: frame.body,
        })
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Frame queued for the driver, tagged with the generation it was issued in.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) generation: u64,
    pub(crate) frame: Frame,
}

pub(crate) struct SessionInner {
    id: u64,
    state: StateCell,
    cancel: CancellationToken,
    routing: Mutex<RoutingTable>,
    outbound: mpsc::UnboundedSender<Outbound>,
    next_subscription: AtomicU64,
}

impl SessionInner {
    fn routing(&self) -> MutexGuard<'_, RoutingTable> {
        self.routing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Update the state unless the session was deactivated, which pins it
    /// to `Disconnected`.
    pub(crate) fn set_state(&self, state: SessionState) {
        if self.cancel.is_cancelled() && state != SessionState::Disconnected {
            return;
        }
        self.state.set(state);
    }

    /// CONNECTED received: open a new generation and accept subscriptions.
    pub(crate) fn connection_established(&self) -> u64 {
        let mut routing = self.routing();
        let generation = routing.open_generation();
        self.set_state(SessionState::Connected);
        generation
    }

    /// Connection gone: drop every route of the current generation.
    pub(crate) fn connection_lost(&self) -> usize {
        self.routing().close_generation()
    }

    pub(crate) fn has_route(&self, id: &str) -> bool {
        self.routing().contains(id)
    }

    pub(crate) fn unsubscribe(&self, id: &str) {
        let mut routing = self.routing();
        let Some(route) = routing.remove(id) else {
            return;
        };
        tracing::debug!(
            session = self.id,
            subscription = id,
            destination = %route.destination,
            "Unsubscribing"
        );
        if let Some(generation) = routing.live_generation() {
            let _ = self.outbound.send(Outbound {
                generation,
                frame: Frame::unsubscribe(id),
            });
        }
    }

    /// Route a MESSAGE to its subscription callback. The callback runs with
    /// the table unlocked.
    pub(crate) fn dispatch(&self, frame: InboundFrame) {
        let Some(callback) = self.routing().callback(&frame.subscription) else {
            tracing::debug!(
                session = self.id,
                subscription = %frame.subscription,
                destination = %frame.destination,
                "Dropping message for unknown subscription"
            );
            return;
        };

        let subscription = frame.subscription.clone();
        if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
            tracing::error!(
                session = self.id,
                subscription = %subscription,
                "Subscription callback panicked"
            );
        }
    }
}

/// Handle onto a running STOMP session.
///
/// Clones share the same session. The session keeps running until
/// [`StompSession::deactivate`] is called; dropping handles does not stop it.
#[derive(Clone)]
pub struct StompSession {
    inner: Arc<SessionInner>,
}

impl StompSession {
    /// Start a session: spawn the driver, which connects right away and
    /// keeps reconnecting until deactivated.
    ///
    /// `on_connected` runs on the driver task after every CONNECTED, before
    /// the next inbound frame is read. It is the place to (re)subscribe.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn activate<F>(
        config: &RealtimeConfig,
        connector: Arc<dyn Connector>,
        credential: Credential,
        on_connected: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: StateCell::new(SessionState::Connecting),
            cancel: CancellationToken::new(),
            routing: Mutex::new(RoutingTable::default()),
            outbound: outbound_tx,
            next_subscription: AtomicU64::new(0),
        });

        tracing::info!(session = inner.id, endpoint = %config.endpoint, "Activating STOMP session");

        let hook: ConnectHook = Arc::new(on_connected);
        let driver = SessionDriver::new(
            Arc::clone(&inner),
            connector,
            credential,
            config,
            hook,
            outbound_rx,
        );
        let task = tokio::spawn(driver.run());
        tokio::spawn(supervise(task, Arc::clone(&inner)));

        Self { inner }
    }

    /// Process-unique session number (used in logs).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// False once [`deactivate`](Self::deactivate) was called.
    pub fn is_active(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Subscribe `callback` to `topic` for the current connection.
    ///
    /// Fails with [`SessionError::NotConnected`] outside the Connected state.
    /// The returned handle goes stale when the connection drops.
    pub fn subscribe<F>(
        &self,
        topic: impl Into<Topic>,
        callback: F,
    ) -> Result<Subscription, SessionError>
    where
        F: Fn(InboundFrame) + Send + Sync + 'static,
    {
        let topic = topic.into();
        if !self.is_active() {
            return Err(SessionError::Inactive);
        }

        let mut routing = self.inner.routing();
        let Some(generation) = routing.live_generation() else {
            return Err(SessionError::NotConnected(self.state()));
        };

        let id = format!(
            "sub-{}",
            self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        routing.insert(
            id.clone(),
            Route {
                destination: topic.clone(),
                callback: Arc::new(callback),
            },
        );
        let _ = self.inner.outbound.send(Outbound {
            generation,
            frame: Frame::subscribe(&id, topic.as_str()),
        });
        drop(routing);

        tracing::debug!(
            session = self.inner.id,
            subscription = %id,
            destination = %topic,
            generation,
            "Subscribed"
        );
        Ok(Subscription::new(
            id,
            topic,
            generation,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Send a JSON body to `destination`.
    pub fn publish(&self, destination: &str, body: impl Into<String>) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive);
        }
        let routing = self.inner.routing();
        let Some(generation) = routing.live_generation() else {
            return Err(SessionError::NotConnected(self.state()));
        };
        let frame = Frame::send(destination, body)
            .with_header(headers::CONTENT_TYPE, "application/json");
        let _ = self.inner.outbound.send(Outbound { generation, frame });
        Ok(())
    }

    /// Destinations with a live route in the current generation.
    pub fn subscribed_destinations(&self) -> Vec<Topic> {
        self.inner.routing().destinations()
    }

    /// Stop the session for good: cancel a pending reconnect, send
    /// DISCONNECT when connected and close the transport. No callback runs
    /// after this returns. Idempotent.
    pub fn deactivate(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        tracing::info!(session = self.inner.id, "Deactivating STOMP session");
        self.inner.cancel.cancel();
        self.inner.connection_lost();
        self.inner.set_state(SessionState::Disconnected);
    }
}

impl std::fmt::Debug for StompSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// A driver that died by panicking leaves the session `Failed` rather than
/// stuck in whatever state it last reported.
async fn supervise(task: tokio::task::JoinHandle<()>, inner: Arc<SessionInner>) {
    let Err(e) = task.await else {
        return;
    };
    if e.is_panic() {
        tracing::error!(session = inner.id, "Session driver panicked");
        inner.connection_lost();
        inner.set_state(SessionState::Failed);
    }
}

/// Run a hook, logging instead of unwinding into the caller.
pub(crate) fn run_guarded(what: &str, session: u64, hook: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        tracing::error!(session, "{what} panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use platforma_shared::MAX_FRAME_SIZE;

    use super::*;
    use crate::testing::{wait_until, FakeBroker};
    use crate::transport::{MockConnector, TransportConnection, TransportError};

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            reconnect: ReconnectPolicy::Constant {
                delay: Duration::from_millis(20),
            },
            ..RealtimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_sends_bearer_and_heartbeat() {
        let broker = FakeBroker::new();
        let session = StompSession::activate(
            &config(),
            broker.connector(),
            Credential::new("tok-1"),
            || {},
        );

        wait_until(|| session.is_connected()).await;
        let headers = broker.last_connect_headers().expect("CONNECT seen");
        assert!(headers.contains(&("Authorization".into(), "Bearer tok-1".into())));
        assert!(headers.contains(&("heart-beat".into(), "10000,10000".into())));
        assert!(headers.contains(&("accept-version".into(), "1.2,1.1,1.0".into())));

        session.deactivate();
    }

    #[tokio::test]
    async fn test_subscribe_requires_connected() {
        let broker = FakeBroker::new();
        broker.set_accepting(false);
        let session =
            StompSession::activate(&config(), broker.connector(), Credential::new("t"), || {});

        let err = session.subscribe("/topic/x", |_| {}).unwrap_err();
        assert!(matches!(err, SessionError::NotConnected(_)));

        session.deactivate();
        assert_eq!(
            session.subscribe("/topic/x", |_| {}).unwrap_err(),
            SessionError::Inactive
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_messages_routed_by_subscription() {
        let broker = FakeBroker::new();
        let session =
            StompSession::activate(&config(), broker.connector(), Credential::new("t"), || {});
        wait_until(|| session.is_connected()).await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let sub = session
            .subscribe("/topic/conversations.42", move |frame| {
                sink.lock().unwrap().push(frame.body);
            })
            .unwrap();
        wait_until(|| broker.subscription_count("/topic/conversations.42") == 1).await;

        broker.publish("/topic/conversations.42", r#"{"id":1}"#);
        broker.publish("/topic/other", r#"{"id":2}"#);
        wait_until(|| received.lock().unwrap().len() == 1).await;
        assert_eq!(received.lock().unwrap()[0], r#"{"id":1}"#);

        assert!(sub.is_active());
        sub.unsubscribe();
        assert!(!sub.is_active());
        wait_until(|| broker.subscription_count("/topic/conversations.42") == 0).await;

        session.deactivate();
    }

    #[tokio::test]
    async fn test_drop_invalidates_handles_and_reconnects() {
        let broker = FakeBroker::new();
        let connects = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&connects);
        let session = StompSession::activate(
            &config(),
            broker.connector(),
            Credential::new("t"),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        wait_until(|| connects.load(Ordering::SeqCst) == 1).await;

        let sub = session.subscribe("/topic/a", |_| {}).unwrap();
        assert_eq!(sub.generation(), 1);

        broker.drop_connections();
        wait_until(|| connects.load(Ordering::SeqCst) == 2).await;
        assert!(!sub.is_active());
        assert!(session.subscribed_destinations().is_empty());

        let again = session.subscribe("/topic/a", |_| {}).unwrap();
        assert_eq!(again.generation(), 2);
        assert_ne!(again.id(), sub.id());

        session.deactivate();
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_session() {
        let broker = FakeBroker::new();
        let session =
            StompSession::activate(&config(), broker.connector(), Credential::new("t"), || {});
        wait_until(|| session.is_connected()).await;

        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        session
            .subscribe("/topic/a", |_| panic!("boom"))
            .unwrap();
        session
            .subscribe("/topic/b", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        wait_until(|| broker.subscription_count("/topic/b") == 1).await;

        broker.publish("/topic/a", "{}");
        broker.publish("/topic/b", "{}");
        wait_until(|| hits.load(Ordering::SeqCst) == 1).await;
        assert!(session.is_connected());

        session.deactivate();
    }

    #[tokio::test]
    async fn test_deactivate_cancels_pending_reconnect() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::ConnectFailed("refused".into()))
        });

        let config = RealtimeConfig {
            reconnect: ReconnectPolicy::Constant {
                delay: Duration::from_millis(200),
            },
            ..RealtimeConfig::default()
        };
        let session =
            StompSession::activate(&config, Arc::new(connector), Credential::new("t"), || {});

        wait_until(|| session.state() == SessionState::Reconnecting).await;
        session.deactivate();
        let seen = attempts.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), seen);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_capped_policy_ends_in_failed() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(3)
            .returning(|| Err(TransportError::ConnectFailed("refused".into())));

        let config = RealtimeConfig {
            reconnect: ReconnectPolicy::Exponential {
                initial: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
                multiplier: 2.0,
                max_attempts: Some(2),
            },
            ..RealtimeConfig::default()
        };
        let session =
            StompSession::activate(&config, Arc::new(connector), Credential::new("t"), || {});

        wait_until(|| session.state() == SessionState::Failed).await;
        assert!(session.is_active());
        session.deactivate();
    }

    #[tokio::test]
    async fn test_error_frame_is_logged_not_fatal() {
        let broker = FakeBroker::new();
        let session =
            StompSession::activate(&config(), broker.connector(), Credential::new("t"), || {});
        wait_until(|| session.is_connected()).await;

        broker.send_error("bad destination");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.is_connected());
        assert_eq!(broker.connection_count(), 1);

        session.deactivate();
    }

    #[tokio::test]
    async fn test_connect_timeout_schedules_reconnect() {
        let broker = FakeBroker::new();
        broker.set_withhold_connected(true);
        let config = RealtimeConfig {
            connect_timeout: Some(Duration::from_millis(30)),
            ..config()
        };
        let session =
            StompSession::activate(&config, broker.connector(), Credential::new("t"), || {});

        wait_until(|| broker.connect_attempts() >= 2).await;
        assert!(!session.is_connected());

        broker.set_withhold_connected(false);
        wait_until(|| session.is_connected()).await;
        session.deactivate();
    }

    #[tokio::test]
    async fn test_oversized_content_length_is_skipped() {
        let broker = FakeBroker::new();
        let session =
            StompSession::activate(&config(), broker.connector(), Credential::new("t"), || {});
        wait_until(|| session.is_connected()).await;

        let received = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&received);
        session
            .subscribe("/topic/a", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        wait_until(|| broker.subscription_count("/topic/a") == 1).await;

        broker.send_raw("MESSAGE\ncontent-length:18446744073709551615\n\nx\0");
        broker.publish("/topic/a", "{}");
        wait_until(|| received.load(Ordering::SeqCst) == 1).await;
        assert!(session.is_connected());
        assert_eq!(broker.connection_count(), 1);

        broker.drop_connections();
        wait_until(|| broker.connection_count() == 2).await;
        wait_until(|| session.is_connected()).await;

        session.deactivate();
    }

    #[tokio::test]
    async fn test_unterminated_frame_forces_reconnect() {
        let broker = FakeBroker::new();
        let session =
            StompSession::activate(&config(), broker.connector(), Credential::new("t"), || {});
        wait_until(|| session.is_connected()).await;

        broker.send_raw("MESSAGE\ndestination:/topic/a\nsubscription:sub-0\n\n");
        broker.send_raw(&"x".repeat(MAX_FRAME_SIZE));
        wait_until(|| broker.connection_count() == 2).await;
        wait_until(|| session.is_connected()).await;

        session.deactivate();
    }

    #[tokio::test]
    async fn test_driver_panic_leaves_session_failed() {
        struct PanickingConnector;

        #[async_trait::async_trait]
        impl Connector for PanickingConnector {
            async fn connect(&self) -> Result<TransportConnection, TransportError> {
                panic!("connector bug")
            }
        }

        let session = StompSession::activate(
            &config(),
            Arc::new(PanickingConnector),
            Credential::new("t"),
            || {},
        );

        wait_until(|| session.state() == SessionState::Failed).await;
        assert!(session.subscribed_destinations().is_empty());
        session.deactivate();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_deactivate_waits_for_disconnect_receipt() {
        let broker = FakeBroker::new();
        let session =
            StompSession::activate(&config(), broker.connector(), Credential::new("t"), || {});
        wait_until(|| session.is_connected()).await;

        session.deactivate();
        wait_until(|| broker.open_connections() == 0).await;
        assert_eq!(
            broker.disconnect_receipts(),
            vec![format!("disconnect-{}", session.id())]
        );
    }

    #[test]
    fn test_inbound_frame_requires_subscription_header() {
        let frame = Frame::new(platforma_shared::Command::Message)
            .with_header("destination", "/topic/a")
            .with_body("{}");
        assert!(InboundFrame::from_message(frame.clone()).is_none());

        let inbound =
            InboundFrame::from_message(frame.with_header("subscription", "sub-0")).unwrap();
        assert_eq!(inbound.subscription, "sub-0");
        assert_eq!(inbound.destination, "/topic/a");
        let value: serde_json::Value = inbound.json().unwrap();
        assert!(value.is_object());
    }
}
