//! Subscription routing for one session.
//!
//! Routes live for a single connection generation. When the connection
//! drops the table is cleared and every handle issued before becomes
//! inactive; subscribing again is the caller's (the adapter's) job.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use platforma_shared::Topic;

use super::{InboundFrame, SessionInner};

pub(crate) type MessageCallback = Arc<dyn Fn(InboundFrame) + Send + Sync>;

pub(crate) struct Route {
    pub(crate) destination: Topic,
    pub(crate) callback: MessageCallback,
}

/// Subscription id -> route, plus the generation currently accepting routes.
#[derive(Default)]
pub(crate) struct RoutingTable {
    generation: u64,
    live: bool,
    routes: HashMap<String, Route>,
}

impl RoutingTable {
    /// Start a new connection generation. Returns its number.
    pub(crate) fn open_generation(&mut self) -> u64 {
        self.generation += 1;
        self.live = true;
        self.generation
    }

    /// End the current generation, dropping every route. Returns how many
    /// routes were dropped.
    pub(crate) fn close_generation(&mut self) -> usize {
        self.live = false;
        let dropped = self.routes.len();
        self.routes.clear();
        dropped
    }

    /// Generation accepting new routes, if connected.
    pub(crate) fn live_generation(&self) -> Option<u64> {
        self.live.then_some(self.generation)
    }

    pub(crate) fn insert(&mut self, id: String, route: Route) {
        self.routes.insert(id, route);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Route> {
        self.routes.remove(id)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.routes.contains_key(id)
    }

    pub(crate) fn callback(&self, id: &str) -> Option<MessageCallback> {
        self.routes.get(id).map(|route| Arc::clone(&route.callback))
    }

    pub(crate) fn destinations(&self) -> Vec<Topic> {
        self.routes
            .values()
            .map(|route| route.destination.clone())
            .collect()
    }
}

/// Handle to one topic subscription, valid for the connection generation it
/// was created in.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    destination: Topic,
    generation: u64,
    session: Weak<SessionInner>,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        destination: Topic,
        generation: u64,
        session: Weak<SessionInner>,
    ) -> Self {
        Self {
            id,
            destination,
            generation,
            session,
        }
    }

    /// STOMP subscription id (`sub-<n>`).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &Topic {
        &self.destination
    }

    /// Connection generation this subscription belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether frames are still routed to this subscription. False after
    /// `unsubscribe`, after the connection dropped and after the session was
    /// deactivated.
    pub fn is_active(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| session.has_route(&self.id))
    }

    /// Stop routing frames to this subscription and tell the broker.
    /// Idempotent; a no-op for a stale handle.
    pub fn unsubscribe(&self) {
        if let Some(session) = self.session.upgrade() {
            session.unsubscribe(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("generation", &self.generation)
            .finish()
    }
}
