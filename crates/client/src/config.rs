//! Client configuration loaded from environment variables.
//!
//! Every value has a default suitable for local development; an unparseable
//! value is logged and replaced by its default.

use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use platforma_shared::HeartBeat;
use url::Url;

use crate::session::{ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
use crate::transport::TransportKind;

/// Default broker endpoint (SockJS base URL).
pub const DEFAULT_WS_URL: &str = "http://localhost:8080/ws";

/// Default REST API base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Realtime connection settings.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// HTTP(S) endpoint used to bootstrap the transport.
    pub endpoint: Url,
    /// Transports to try, in order.
    pub transports: Vec<TransportKind>,
    pub reconnect: ReconnectPolicy,
    /// Heart-beat intervals offered in CONNECT.
    pub heartbeat: HeartBeat,
    /// Give up on an attempt when CONNECTED does not arrive in time.
    pub connect_timeout: Option<Duration>,
}

impl RealtimeConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    /// Load from `PLATFORMA_WS_*` environment variables.
    pub fn from_env() -> Self {
        let endpoint = env_parsed::<Url>("PLATFORMA_WS_URL").unwrap_or_else(default_ws_url);

        let transports = std::env::var("PLATFORMA_WS_TRANSPORTS")
            .ok()
            .map(|raw| parse_transports(&raw))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(TransportKind::default_order);

        let delay = env_millis("PLATFORMA_WS_RECONNECT_DELAY_MS").unwrap_or(DEFAULT_RECONNECT_DELAY);
        let max_delay = env_millis("PLATFORMA_WS_RECONNECT_MAX_DELAY_MS");
        let max_attempts = env_parsed::<u32>("PLATFORMA_WS_RECONNECT_MAX_ATTEMPTS");
        let reconnect = match (max_delay, max_attempts) {
            (None, None) => ReconnectPolicy::Constant { delay },
            (max_delay, max_attempts) => ReconnectPolicy::Exponential {
                initial: delay,
                max_delay: max_delay.unwrap_or(delay).max(delay),
                multiplier: 2.0,
                max_attempts,
            },
        };

        let defaults = HeartBeat::default();
        let heartbeat = HeartBeat::new(
            env_millis("PLATFORMA_WS_HEARTBEAT_OUT_MS").unwrap_or(defaults.outgoing),
            env_millis("PLATFORMA_WS_HEARTBEAT_IN_MS").unwrap_or(defaults.incoming),
        );

        let connect_timeout =
            env_millis("PLATFORMA_WS_CONNECT_TIMEOUT_MS").filter(|timeout| !timeout.is_zero());

        Self {
            endpoint,
            transports,
            reconnect,
            heartbeat,
            connect_timeout,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ws_url(),
            transports: TransportKind::default_order(),
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartBeat::default(),
            connect_timeout: None,
        }
    }
}

/// REST API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: Url,
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let base_url = env_parsed::<Url>("PLATFORMA_API_URL").unwrap_or_else(default_api_url);
        Self {
            base_url,
            ..Self::default()
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            timeout: Duration::from_secs(30),
        }
    }
}

static DEFAULT_WS: Lazy<Url> =
    Lazy::new(|| Url::parse(DEFAULT_WS_URL).expect("DEFAULT_WS_URL is a valid URL"));

static DEFAULT_API: Lazy<Url> =
    Lazy::new(|| Url::parse(DEFAULT_API_URL).expect("DEFAULT_API_URL is a valid URL"));

fn default_ws_url() -> Url {
    DEFAULT_WS.clone()
}

fn default_api_url() -> Url {
    DEFAULT_API.clone()
}

fn parse_transports(raw: &str) -> Vec<TransportKind> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(kind) => Some(kind),
            Err(e) => {
                tracing::warn!(transport = %s, error = %e, "Ignoring unknown transport");
                None
            }
        })
        .collect()
}

fn env_parsed<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(variable = name, value = %raw, error = %e, "Invalid value, using default");
            None
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parsed::<u64>(name).map(Duration::from_millis)
}
