//! Transport layer underneath the STOMP session.
//!
//! A transport is a duplex stream of text payloads. Each payload carries one
//! or more STOMP frames (or heart-beats); transport-level framing such as
//! SockJS is stripped here so the session only ever sees STOMP text.
//!
//! Transports have no retry logic of their own. Reconnecting is the session's
//! job.

mod websocket;

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use thiserror::Error;

pub use websocket::WebSocketConnector;

/// Outbound half: accepts STOMP text payloads.
pub type TextSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half: yields STOMP text payloads. An `Err` item or the end of the
/// stream means the connection is gone.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open transport connection.
pub struct TransportConnection {
    /// Where the connection went, for logs.
    pub url: String,
    pub sink: TextSink,
    pub stream: TextStream,
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConnection")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Available transports, tried in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// SockJS session over a WebSocket (`<endpoint>/<server>/<session>/websocket`).
    SockJs,
    /// Plain WebSocket (`<endpoint>/websocket`).
    WebSocket,
}

impl TransportKind {
    pub fn default_order() -> Vec<TransportKind> {
        vec![TransportKind::SockJs, TransportKind::WebSocket]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::SockJs => "sockjs",
            TransportKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sockjs" => Ok(TransportKind::SockJs),
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            other => Err(TransportError::UnknownTransport(other.to_string())),
        }
    }
}

/// Transport failures. All of them are transient from the session's point of
/// view: they end the current connection and trigger a reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("SockJS handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// Opens transport connections for a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportConnection, TransportError>;
}
