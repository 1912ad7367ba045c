//! Reconnect delay policy.
//!
//! Runtime-agnostic: the session driver asks for the next delay and does the
//! sleeping itself.

use std::time::Duration;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3_000);

/// How long to wait before each reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectPolicy {
    /// Same delay every time, retried forever.
    Constant { delay: Duration },
    /// Delay grows by `multiplier` up to `max_delay`. With `max_attempts`
    /// set, the session gives up (state `Failed`) once they are used.
    Exponential {
        initial: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Constant {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Backoff state for one session. Reset after every successful CONNECTED.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    policy: ReconnectPolicy,
    attempts: u32,
    delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            delay: Self::initial_delay(&policy),
        }
    }

    fn initial_delay(policy: &ReconnectPolicy) -> Duration {
        match *policy {
            ReconnectPolicy::Constant { delay } => delay,
            ReconnectPolicy::Exponential { initial, .. } => initial,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        match self.policy {
            ReconnectPolicy::Constant { .. } => false,
            ReconnectPolicy::Exponential { max_attempts, .. } => {
                max_attempts.is_some_and(|max| self.attempts >= max)
            }
        }
    }

    /// Advance to the next attempt.
    ///
    /// Returns the delay to wait *before* performing this attempt, or `None`
    /// once a capped policy is exhausted.
    pub fn next_delay_and_advance(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let current = self.delay;
        self.attempts = self.attempts.saturating_add(1);
        if let ReconnectPolicy::Exponential {
            max_delay,
            multiplier,
            ..
        } = self.policy
        {
            self.delay = self.delay.mul_f64(multiplier).min(max_delay);
        }
        Some(current)
    }
}
