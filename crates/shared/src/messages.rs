//! Message body DTOs.
//!
//! These mirror what the backend publishes on the broker and returns from the
//! messages REST endpoints. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single chat message, published on `/topic/conversations.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: i64,
    pub sender_id: i64,
    #[serde(default)]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<AttachmentDto>>,
}

impl MessageDto {
    /// Text content, empty for attachment-only messages.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    pub fn has_attachments(&self) -> bool {
        self.attachments.as_ref().is_some_and(|a| !a.is_empty())
    }
}

/// Metadata of a file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDto {
    pub id: i64,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
}

/// Row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationListItem {
    pub conversation_id: i64,
    pub other_user_id: i64,
    pub other_name: String,
    pub other_role: String,
    #[serde(default)]
    pub other_avatar_url: Option<String>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
}

/// Response of the "open direct conversation" endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectConversation {
    pub conversation_id: i64,
}

/// Envelope used on the announcement and notification destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsEvent<T = serde_json::Value> {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: T,
}

/// Payload of a `CONNECTION` event on `/user/queue/notifications`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionNotification {
    /// `CONNECTION_REQUEST`, `CONNECTION_ACCEPTED` or `CONNECTION_REJECTED`.
    pub kind: String,
    pub request_id: i64,
    pub from_user_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_from_backend_json() {
        let json = r#"{
            "id": 1,
            "senderId": 5,
            "content": "salut",
            "createdAt": "2026-01-12T10:15:30Z",
            "attachments": [
                {"id": 9, "originalName": "cv.pdf", "mimeType": "application/pdf", "sizeBytes": 2048}
            ]
        }"#;
        let msg: MessageDto = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, 1);
        assert_eq!(msg.sender_id, 5);
        assert_eq!(msg.text(), "salut");
        assert!(msg.has_attachments());
        assert_eq!(msg.attachments.unwrap()[0].original_name, "cv.pdf");
    }

    #[test]
    fn test_attachment_only_message() {
        let json = r#"{"id":2,"senderId":5,"content":null,"createdAt":"2026-01-12T10:15:30.123Z"}"#;
        let msg: MessageDto = serde_json::from_str(json).unwrap();
        assert_eq!(msg.text(), "");
        assert!(!msg.has_attachments());
    }

    #[test]
    fn test_ws_event_with_notification() {
        let json = r#"{"type":"CONNECTION","payload":{"kind":"CONNECTION_REQUEST","requestId":3,"fromUserId":8}}"#;
        let event: WsEvent<ConnectionNotification> = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, "CONNECTION");
        assert_eq!(event.payload.from_user_id, 8);
    }
}
