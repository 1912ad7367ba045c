//! STOMP 1.2 wire protocol.
//!
//! Frames are text: a command line, `name:value` header lines, a blank line,
//! the body and a terminating NUL. A lone end-of-line between frames is a
//! heart-beat.

mod decoder;
mod frame;
mod heartbeat;

pub use decoder::{FrameDecoder, Incoming, MAX_FRAME_SIZE};
pub use frame::{Command, Frame};
pub use heartbeat::HeartBeat;

use thiserror::Error;

/// Protocol versions offered in the CONNECT frame, most preferred first.
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// Well-known header names.
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const VERSION: &str = "version";
}

/// Errors produced while decoding STOMP frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid content-length header: {0}")]
    InvalidContentLength(String),

    #[error("frame body is not terminated by NUL")]
    MissingTerminator,

    #[error("invalid heart-beat header: {0}")]
    InvalidHeartBeat(String),
}
