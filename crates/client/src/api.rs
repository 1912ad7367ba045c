//! Messages REST client.
//!
//! The realtime feed only carries new messages; history, sending and
//! conversation management go through these endpoints.

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

use platforma_shared::{ConversationListItem, DirectConversation, MessageDto};

use crate::config::ApiConfig;
use crate::credential::Credential;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A file to send with a message.
#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Client for `/api/messages`, authenticated with a bearer credential.
#[derive(Clone)]
pub struct MessagesApi {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl MessagesApi {
    pub fn new(config: &ApiConfig, credential: Credential) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.base_url.as_str().trim_end_matches('/').to_string(),
            credential,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/messages{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = request
            .bearer_auth(self.credential.token())
            .send()
            .await
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| ApiError::RequestFailed(e.to_string()))?;
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        self.execute(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationListItem>, ApiError> {
        self.json(self.client.get(self.url("/conversations"))).await
    }

    /// Most recent messages, newest first.
    pub async fn latest_messages(
        &self,
        conversation_id: i64,
        limit: u32,
    ) -> Result<Vec<MessageDto>, ApiError> {
        let request = self
            .client
            .get(self.url(&format!("/conversations/{conversation_id}/messages")))
            .query(&[("limit", limit)]);
        self.json(request).await
    }

    /// Send a message. Content is trimmed and left out when blank; a
    /// message needs content or an attachment.
    pub async fn send_message(
        &self,
        conversation_id: i64,
        content: &str,
        attachment: Option<OutgoingAttachment>,
    ) -> Result<MessageDto, ApiError> {
        let mut form = Form::new();
        let content = content.trim();
        if !content.is_empty() {
            form = form.text("content", content.to_string());
        }
        if let Some(file) = attachment {
            let part = Part::bytes(file.bytes)
                .file_name(file.file_name)
                .mime_str(&file.mime_type)
                .map_err(|e| ApiError::RequestFailed(e.to_string()))?;
            form = form.part("file", part);
        }

        let request = self
            .client
            .post(self.url(&format!("/conversations/{conversation_id}/messages")))
            .multipart(form);
        self.json(request).await
    }

    pub async fn download_attachment(&self, attachment_id: i64) -> Result<Vec<u8>, ApiError> {
        let response = self
            .execute(self.client.get(self.url(&format!("/attachments/{attachment_id}"))))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Hide a conversation for the current user.
    pub async fn delete_conversation(&self, conversation_id: i64) -> Result<(), ApiError> {
        self.execute(
            self.client
                .delete(self.url(&format!("/conversations/{conversation_id}"))),
        )
        .await?;
        Ok(())
    }

    /// Get or create the direct conversation with `other_user_id`.
    pub async fn direct_conversation(&self, other_user_id: i64) -> Result<i64, ApiError> {
        let direct: DirectConversation = self
            .json(
                self.client
                    .post(self.url(&format!("/conversations/direct/{other_user_id}"))),
            )
            .await?;
        Ok(direct.conversation_id)
    }
}
