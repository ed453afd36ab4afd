//! HTTP page sources backed by the marketplace chat API
//!
//! Endpoints follow the usual cursor envelope: `{ "next": ..., "results":
//! [...] }`. The conversation list is reverse-chronological by activity;
//! messages page from newest to oldest within a conversation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{FetchError, Page, PageSource};
use crate::config::ApiConfig;
use crate::model::{Conversation, Message, MessageKind, Sender};

const USER_AGENT: &str = concat!("corral/", env!("CARGO_PKG_VERSION"));

/// Authenticated transport handed to the page sources. Session acquisition
/// happens elsewhere; this only carries the resulting token.
#[derive(Clone)]
pub struct ApiTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ApiTransport {
    pub fn from_config(config: &ApiConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.base_url.is_empty(), "api.base_url is not configured");

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.session_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))?,
            );
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_page<T>(&self, path: &str, cursor: Option<&str>) -> Result<Envelope<T>, FetchError>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        debug!(%url, cursor = cursor.unwrap_or("-"), "fetching page");

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Retryable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(FetchError::Retryable(format!("{status} from {url}")));
        }
        if !status.is_success() {
            return Err(FetchError::Fatal(format!("{status} from {url}")));
        }

        response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| FetchError::Fatal(format!("decoding {url}: {e}")))
    }
}

/// Wire envelope shared by the list and message endpoints.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    next: Option<String>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

/// Pages through the account's conversation list.
pub struct ConversationListSource {
    transport: ApiTransport,
}

impl ConversationListSource {
    pub fn new(transport: ApiTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl PageSource for ConversationListSource {
    type Record = Conversation;

    async fn next_page(&mut self, cursor: Option<&str>) -> Result<Page<Conversation>, FetchError> {
        let envelope = self.transport.get_page::<Conversation>("/chats", cursor).await?;
        Ok(Page {
            records: envelope.results,
            next_cursor: envelope.next,
        })
    }
}

/// Pages through one conversation's messages.
pub struct MessageSource {
    transport: ApiTransport,
    conversation_id: i64,
}

impl MessageSource {
    pub fn new(transport: ApiTransport, conversation_id: i64) -> Self {
        Self {
            transport,
            conversation_id,
        }
    }
}

#[async_trait]
impl PageSource for MessageSource {
    type Record = Message;

    async fn next_page(&mut self, cursor: Option<&str>) -> Result<Page<Message>, FetchError> {
        let path = format!("/chats/{}/messages", self.conversation_id);
        let envelope = self.transport.get_page::<WireMessage>(&path, cursor).await?;
        let records = envelope
            .results
            .into_iter()
            .map(|raw| raw.into_message(self.conversation_id))
            .collect();
        Ok(Page {
            records,
            next_cursor: envelope.next,
        })
    }
}

/// Message as the API ships it; the owning conversation is implied by the
/// request path, so it is stamped on here.
#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    #[serde(default)]
    sender: Sender,
    #[serde(default)]
    kind: MessageKind,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    receiver_read: bool,
}

impl WireMessage {
    fn into_message(self, conversation_id: i64) -> Message {
        Message {
            id: self.id,
            conversation_id,
            sender: self.sender,
            kind: self.kind,
            body: self.body,
            created_at: self.created_at,
            receiver_read: self.receiver_read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_requires_base_url() {
        let config = ApiConfig::default();
        assert!(ApiTransport::from_config(&config).is_err());
    }

    #[test]
    fn test_envelope_decoding() {
        let raw = r#"{"next": "abc", "results": [{"id": 7, "body": "hi", "kind": "text"}]}"#;
        let envelope: Envelope<WireMessage> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.next.as_deref(), Some("abc"));
        assert_eq!(envelope.results.len(), 1);

        let message = envelope.results.into_iter().next().unwrap().into_message(99);
        assert_eq!(message.conversation_id, 99);
        assert_eq!(message.id, 7);
    }

    #[test]
    fn test_envelope_terminal_page() {
        let envelope: Envelope<WireMessage> = serde_json::from_str(r#"{"results": []}"#).unwrap();
        assert!(envelope.next.is_none());
        assert!(envelope.results.is_empty());
    }
}
