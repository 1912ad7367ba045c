//! Test support: an in-memory broker plus polling helpers.
//!
//! Compiled for this crate's tests and for dependents enabling the
//! `testing` feature.

mod broker;

use std::time::Duration;

pub use broker::FakeBroker;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds. Panics after five seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {WAIT_TIMEOUT:?}");
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
}
