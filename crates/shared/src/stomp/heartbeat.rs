//! Heart-beat header parsing and negotiation (STOMP 1.1+).

use std::time::Duration;

use super::FrameError;

/// One side's heart-beat declaration: `outgoing` is the smallest interval at
/// which it can send beats, `incoming` the interval it would like to receive
/// them at. Zero means "cannot" / "does not want".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl HeartBeat {
    pub const DISABLED: HeartBeat = HeartBeat {
        outgoing: Duration::ZERO,
        incoming: Duration::ZERO,
    };

    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    /// Header value, e.g. `10000,10000`.
    pub fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    pub fn parse(value: &str) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidHeartBeat(value.to_string());
        let (out, inc) = value.split_once(',').ok_or_else(invalid)?;
        let out: u64 = out.trim().parse().map_err(|_| invalid())?;
        let inc: u64 = inc.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(
            Duration::from_millis(out),
            Duration::from_millis(inc),
        ))
    }

    /// Negotiate the effective intervals from the client's point of view.
    ///
    /// `self` is what the client asked for, `server` what came back in
    /// CONNECTED. Returns `(send_every, expect_within)`; `None` disables that
    /// direction.
    pub fn negotiate(&self, server: &HeartBeat) -> (Option<Duration>, Option<Duration>) {
        let send = if self.outgoing.is_zero() || server.incoming.is_zero() {
            None
        } else {
            Some(self.outgoing.max(server.incoming))
        };
        let expect = if self.incoming.is_zero() || server.outgoing.is_zero() {
            None
        } else {
            Some(self.incoming.max(server.outgoing))
        };
        (send, expect)
    }
}

impl Default for HeartBeat {
    fn default() -> Self {
        Self::new(Duration::from_millis(10_000), Duration::from_millis(10_000))
    }
}
