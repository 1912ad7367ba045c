//! Platforma Shared - wire types for the realtime messaging client
//!
//! This crate contains everything that crosses the wire between the client and
//! the messaging backend:
//! - STOMP 1.2 frame encoding/decoding and heart-beat negotiation
//! - SockJS WebSocket framing
//! - Topic naming conventions
//! - Chat and notification DTOs carried in message bodies
//!
//! # Design Principles
//!
//! 1. **No I/O** - pure data types and codecs, usable from any runtime
//! 2. **No business logic** - interpretation of payloads belongs to the client
//! 3. **Text only** - frames travel as UTF-8 text (SockJS cannot carry binary)

pub mod messages;
pub mod sockjs;
pub mod stomp;
pub mod topics;

pub use messages::{
    AttachmentDto, ConnectionNotification, ConversationListItem, DirectConversation, MessageDto,
    WsEvent,
};
pub use sockjs::{SockJsError, SockJsFrame};
pub use stomp::{Command, Frame, FrameDecoder, FrameError, HeartBeat, Incoming, MAX_FRAME_SIZE};
pub use topics::Topic;
