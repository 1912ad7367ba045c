//! SockJS framing for the WebSocket transport.
//!
//! A SockJS server wraps every payload: `o` opens the session, `h` is a
//! heartbeat, `a[...]` carries a JSON array of messages and `c[code,"reason"]`
//! closes the session. Clients send a JSON array of strings.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SockJsError {
    #[error("empty SockJS frame")]
    Empty,

    #[error("unknown SockJS frame type: {0}")]
    UnknownFrame(char),

    #[error("malformed SockJS payload: {0}")]
    MalformedPayload(String),
}

/// A frame received from a SockJS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockJsFrame {
    Open,
    HeartBeat,
    Messages(Vec<String>),
    Close { code: u16, reason: String },
}

impl SockJsFrame {
    pub fn parse(text: &str) -> Result<Self, SockJsError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(SockJsError::Empty)?;
        let payload = chars.as_str();

        match kind {
            'o' => Ok(SockJsFrame::Open),
            'h' => Ok(SockJsFrame::HeartBeat),
            'a' => serde_json::from_str::<Vec<String>>(payload)
                .map(SockJsFrame::Messages)
                .map_err(|e| SockJsError::MalformedPayload(e.to_string())),
            'm' => serde_json::from_str::<String>(payload)
                .map(|m| SockJsFrame::Messages(vec![m]))
                .map_err(|e| SockJsError::MalformedPayload(e.to_string())),
            'c' => {
                let (code, reason): (u16, String) = serde_json::from_str(payload)
                    .map_err(|e| SockJsError::MalformedPayload(e.to_string()))?;
                Ok(SockJsFrame::Close { code, reason })
            }
            other => Err(SockJsError::UnknownFrame(other)),
        }
    }

    /// Server-side encoding, used by test brokers.
    pub fn encode(&self) -> String {
        match self {
            SockJsFrame::Open => "o".to_string(),
            SockJsFrame::HeartBeat => "h".to_string(),
            SockJsFrame::Messages(messages) => format!("a{}", encode_messages(messages)),
            SockJsFrame::Close { code, reason } => {
                format!("c[{},{}]", code, serde_json::Value::from(reason.as_str()))
            }
        }
    }
}

/// Client-to-server payload: a JSON array of strings.
pub fn encode_messages<S: AsRef<str>>(messages: &[S]) -> String {
    let values: Vec<&str> = messages.iter().map(AsRef::as_ref).collect();
    serde_json::Value::from(values).to_string()
}

/// Parse a client-to-server payload (the inverse of [`encode_messages`]).
pub fn decode_messages(text: &str) -> Result<Vec<String>, SockJsError> {
    serde_json::from_str(text).map_err(|e| SockJsError::MalformedPayload(e.to_string()))
}

/// Relative path of the SockJS WebSocket transport for one session:
/// `<server>/<session>/websocket`, where server is a three-digit shard id.
pub fn websocket_path(server_id: u16, session_id: &str) -> String {
    format!("{:03}/{}/websocket", server_id % 1000, session_id)
}
