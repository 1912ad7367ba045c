//! Session lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a [`StompSession`](super::StompSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet activated, or deactivated (terminal).
    Disconnected,
    /// Transport opening or waiting for CONNECTED
    Connecting,
    /// CONNECTED received; subscriptions are accepted
    Connected,
    /// Connection lost, reconnect timer pending
    Reconnecting,
    /// Capped reconnect policy gave up
    Failed,
}

impl SessionState {
    /// Convert to u8 for atomic storage.
    pub fn to_u8(self) -> u8 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Reconnecting => 3,
            SessionState::Failed => 4,
        }
    }

    /// Convert from u8 (atomic storage).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Reconnecting,
            4 => SessionState::Failed,
            _ => SessionState::Disconnected,
        }
    }
}

/// Atomic cell holding a [`SessionState`], shared between the session
/// handle and its driver task.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state.to_u8(), Ordering::SeqCst);
    }
}
