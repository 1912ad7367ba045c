//! Platforma realtime client.
//!
//! One shared, auto-reconnecting STOMP session per process, plus the pieces
//! feature code builds on:
//!
//! - [`registry`]: connect/disconnect lifecycle and connect-listeners
//! - [`adapter`]: topic subscriptions that survive reconnects
//! - [`auth`]: drive the lifecycle from the login state
//! - [`conversation`]: deduplicated live view of a chat conversation
//! - [`api`]: the messages REST endpoints
//!
//! ```no_run
//! use platforma_client::{adapter, registry, Credential, Topic};
//!
//! # async fn run() {
//! registry::connect(Credential::new("token"));
//! let _chat = adapter::attach(Topic::conversation(42), |frame| {
//!     println!("{}", frame.body());
//! });
//! # }
//! ```

pub mod adapter;
pub mod api;
pub mod auth;
pub mod config;
pub mod conversation;
pub mod credential;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::{attach, attach_to, Attachment};
pub use api::{ApiError, MessagesApi, OutgoingAttachment};
pub use auth::{bind_credentials, CredentialBinding};
pub use config::{ApiConfig, RealtimeConfig};
pub use conversation::ConversationFeed;
pub use credential::Credential;
pub use registry::{ConnectionRegistry, ListenerDisposer};
pub use session::{
    InboundFrame, ReconnectPolicy, SessionError, SessionState, StompSession, Subscription,
};
pub use transport::{Connector, TransportError, TransportKind, WebSocketConnector};

pub use platforma_shared::{MessageDto, Topic};
