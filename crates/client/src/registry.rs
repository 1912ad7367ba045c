//! Connection lifecycle registry.
//!
//! Owns the single shared [`StompSession`] and the set of connect-listeners
//! that run every time that session (re)connects. Feature code normally goes
//! through the process-wide registry ([`global`] and the free functions in
//! this module); tests and embedders build their own with
//! [`ConnectionRegistry::new`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use once_cell::sync::Lazy;

use crate::config::RealtimeConfig;
use crate::credential::Credential;
use crate::session::{SessionState, StompSession};
use crate::transport::{Connector, WebSocketConnector};

/// Callback run on every successful (re)connection.
pub type ConnectListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    /// Bumped on every connect/disconnect so hooks of a replaced session
    /// cannot reach listeners registered for its successor.
    epoch: u64,
    entries: Vec<(u64, ConnectListener)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle registry for the shared realtime session.
pub struct ConnectionRegistry {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    session: Mutex<Option<StompSession>>,
    listeners: Arc<Mutex<Listeners>>,
}

impl ConnectionRegistry {
    pub fn new(config: RealtimeConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            session: Mutex::new(None),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// Registry connecting over WebSocket/SockJS to `config.endpoint`.
    pub fn from_config(config: RealtimeConfig) -> Self {
        let connector = Arc::new(WebSocketConnector::from_config(&config));
        Self::new(config, connector)
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Start the shared session with `credential`.
    ///
    /// A no-op returning the existing session when one is already active.
    /// A session whose capped reconnect policy gave up (`Failed`) is
    /// replaced. Must be called from within a Tokio runtime.
    pub fn connect(&self, credential: Credential) -> StompSession {
        let mut slot = lock(&self.session);

        if let Some(existing) = slot.as_ref() {
            if existing.is_active() && existing.state() != SessionState::Failed {
                tracing::debug!(session = existing.id(), "Session already active, connect ignored");
                return existing.clone();
            }
            existing.deactivate();
        }

        let epoch = {
            let mut listeners = lock(&self.listeners);
            listeners.epoch += 1;
            listeners.epoch
        };
        let listeners = Arc::downgrade(&self.listeners);
        let session = StompSession::activate(
            &self.config,
            Arc::clone(&self.connector),
            credential,
            move || notify_listeners(&listeners, epoch),
        );

        *slot = Some(session.clone());
        session
    }

    /// Tear down: drop every connect-listener, deactivate the session and
    /// forget it. Safe to call repeatedly and with no session.
    pub fn disconnect(&self) {
        // Dropped after the lock is released: a listener may own disposers.
        let removed = {
            let mut listeners = lock(&self.listeners);
            listeners.epoch += 1;
            std::mem::take(&mut listeners.entries)
        };
        let cleared = removed.len();
        drop(removed);

        let session = lock(&self.session).take();
        match session {
            Some(session) => {
                session.deactivate();
                tracing::info!(session = session.id(), listeners = cleared, "Realtime session disconnected");
            }
            None => tracing::debug!(listeners = cleared, "Disconnect with no active session"),
        }
    }

    /// The current session, connected or not. `None` when no session exists.
    pub fn session(&self) -> Option<StompSession> {
        lock(&self.session).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|session| session.is_connected())
    }

    /// Register `listener` to run on every (re)connect of the current
    /// session. Dropping the returned disposer removes it again.
    pub fn on_connect<F>(&self, listener: F) -> ListenerDisposer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        tracing::trace!(listener = id, total = listeners.entries.len(), "Connect listener added");

        ListenerDisposer {
            id,
            listeners: Arc::downgrade(&self.listeners),
            disposed: false,
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).entries.len()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("endpoint", &self.config.endpoint.as_str())
            .field("session", &self.session())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Run every listener registered under `epoch`. Works on a snapshot so
/// listeners may add or dispose listeners; one that was disposed meanwhile
/// is skipped.
fn notify_listeners(listeners: &Weak<Mutex<Listeners>>, epoch: u64) {
    let Some(listeners) = listeners.upgrade() else {
        return;
    };

    let snapshot = {
        let guard = lock(&listeners);
        if guard.epoch != epoch {
            return;
        }
        guard.entries.clone()
    };

    tracing::debug!(listeners = snapshot.len(), "Dispatching connect event");
    for (id, listener) in snapshot {
        let registered = {
            let guard = lock(&listeners);
            guard.epoch == epoch && guard.entries.iter().any(|(other, _)| *other == id)
        };
        if !registered {
            continue;
        }
        if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
            tracing::error!(listener = id, "Connect listener panicked");
        }
    }
}

/// Removes one connect-listener. Runs on drop unless [`forget`](Self::forget)
/// was called.
#[must_use = "dropping the disposer removes the listener immediately"]
pub struct ListenerDisposer {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
    disposed: bool,
}

impl ListenerDisposer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(listeners) = self.listeners.upgrade() {
            let removed = {
                let mut guard = lock(&listeners);
                let position = guard.entries.iter().position(|(id, _)| *id == self.id);
                position.map(|index| guard.entries.remove(index))
            };
            if removed.is_some() {
                tracing::trace!(listener = self.id, "Connect listener removed");
            }
        }
    }

    /// Keep the listener registered until the next `disconnect()`.
    pub fn forget(mut self) {
        self.disposed = true;
    }
}

impl Drop for ListenerDisposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ListenerDisposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerDisposer")
            .field("id", &self.id)
            .field("disposed", &self.disposed)
            .finish()
    }
}

// =============================================================================
// Process-wide registry
// =============================================================================

static GLOBAL: Lazy<Arc<ConnectionRegistry>> =
    Lazy::new(|| Arc::new(ConnectionRegistry::from_config(RealtimeConfig::from_env())));

/// The process-wide registry, configured from the environment on first use.
pub fn global() -> Arc<ConnectionRegistry> {
    Arc::clone(&GLOBAL)
}

pub fn connect(credential: Credential) -> StompSession {
    GLOBAL.connect(credential)
}

pub fn disconnect() {
    GLOBAL.disconnect();
}

pub fn session() -> Option<StompSession> {
    GLOBAL.session()
}

pub fn on_connect<F>(listener: F) -> ListenerDisposer
where
    F: Fn() + Send + Sync + 'static,
{
    GLOBAL.on_connect(listener)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::session::ReconnectPolicy;
    use crate::testing::{wait_until, FakeBroker};

    fn registry(broker: &FakeBroker) -> ConnectionRegistry {
        let config = RealtimeConfig {
            reconnect: ReconnectPolicy::Constant {
                delay: Duration::from_millis(20),
            },
            ..RealtimeConfig::default()
        };
        ConnectionRegistry::new(config, broker.connector())
    }

    fn counter() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_connect_twice_opens_one_session() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);

        let first = registry.connect(Credential::new("tok-1"));
        let second = registry.connect(Credential::new("tok-1"));
        assert_eq!(first.id(), second.id());

        wait_until(|| registry.is_connected()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.open_connections(), 1);

        registry.disconnect();
    }

    #[tokio::test]
    async fn test_session_none_vs_not_connected() {
        let broker = FakeBroker::new();
        broker.set_accepting(false);
        let registry = registry(&broker);
        assert!(registry.session().is_none());

        registry.connect(Credential::new("t"));
        let session = registry.session().expect("session exists");
        assert!(!session.is_connected());

        registry.disconnect();
        assert!(registry.session().is_none());
    }

    #[tokio::test]
    async fn test_listener_fires_on_every_reconnect() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let (count, listener) = counter();
        let _disposer = registry.on_connect(listener);

        registry.connect(Credential::new("t"));
        wait_until(|| count.load(Ordering::SeqCst) == 1).await;

        broker.drop_connections();
        wait_until(|| count.load(Ordering::SeqCst) == 2).await;

        registry.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_clears_listeners() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let (count, listener) = counter();
        registry.on_connect(listener).forget();

        registry.connect(Credential::new("t"));
        wait_until(|| count.load(Ordering::SeqCst) == 1).await;

        registry.disconnect();
        assert_eq!(registry.listener_count(), 0);

        registry.connect(Credential::new("t"));
        wait_until(|| broker.connection_count() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        registry.disconnect();
    }

    #[tokio::test]
    async fn test_disposer_removes_only_its_listener() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let (first_count, first) = counter();
        let (second_count, second) = counter();

        let mut first_disposer = registry.on_connect(first);
        let _second_disposer = registry.on_connect(second);
        first_disposer.dispose();
        first_disposer.dispose();
        assert_eq!(registry.listener_count(), 1);

        registry.connect(Credential::new("t"));
        wait_until(|| second_count.load(Ordering::SeqCst) == 1).await;
        assert_eq!(first_count.load(Ordering::SeqCst), 0);

        registry.disconnect();
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let (count, listener) = counter();
        let _bad = registry.on_connect(|| panic!("listener failure"));
        let _good = registry.on_connect(listener);

        registry.connect(Credential::new("t"));
        wait_until(|| count.load(Ordering::SeqCst) == 1).await;
        assert!(registry.is_connected());

        registry.disconnect();
    }

    #[tokio::test]
    async fn test_listener_disposed_mid_dispatch_is_skipped() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);

        let pending: Arc<Mutex<Option<ListenerDisposer>>> = Arc::default();
        let slot = Arc::clone(&pending);
        let _first = registry.on_connect(move || {
            if let Some(mut disposer) = slot.lock().unwrap().take() {
                disposer.dispose();
            }
        });
        let (disposed_count, disposed) = counter();
        *pending.lock().unwrap() = Some(registry.on_connect(disposed));
        let (last_count, last) = counter();
        let _last = registry.on_connect(last);

        registry.connect(Credential::new("t"));
        wait_until(|| last_count.load(Ordering::SeqCst) == 1).await;
        assert_eq!(disposed_count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.listener_count(), 2);

        broker.drop_connections();
        wait_until(|| last_count.load(Ordering::SeqCst) == 2).await;
        assert_eq!(disposed_count.load(Ordering::SeqCst), 0);

        registry.disconnect();
    }

    #[tokio::test]
    async fn test_listener_added_mid_dispatch_waits_for_next_connect() {
        let broker = FakeBroker::new();
        let registry = Arc::new(registry(&broker));

        let late_count = Arc::new(AtomicU32::new(0));
        let added: Arc<Mutex<Option<ListenerDisposer>>> = Arc::default();
        let weak = Arc::downgrade(&registry);
        let hits = Arc::clone(&late_count);
        let slot = Arc::clone(&added);
        let _adder = registry.on_connect(move || {
            let mut slot = slot.lock().unwrap();
            if slot.is_some() {
                return;
            }
            if let Some(registry) = weak.upgrade() {
                let hits = Arc::clone(&hits);
                *slot = Some(registry.on_connect(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }));
            }
        });

        registry.connect(Credential::new("t"));
        wait_until(|| registry.listener_count() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(late_count.load(Ordering::SeqCst), 0);

        broker.drop_connections();
        wait_until(|| late_count.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count(), 2);

        drop(added);
        registry.disconnect();
        assert_eq!(registry.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_with_listener_owning_disposer() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        let (_, inner) = counter();
        let owned = registry.on_connect(inner);
        registry
            .on_connect(move || {
                let _ = owned.id();
            })
            .forget();

        registry.disconnect();
        assert_eq!(registry.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let broker = FakeBroker::new();
        let registry = registry(&broker);
        registry.disconnect();
        registry.disconnect();
        assert!(registry.session().is_none());
        assert_eq!(broker.connect_attempts(), 0);
    }
}
