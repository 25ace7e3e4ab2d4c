//! The message envelope exchanged between containers and agents.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::{ContentType, MessageType};
use crate::error::{Error, Result};

/// Message envelope. Field names on the wire are fixed for interoperability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Type")]
    pub message_type: MessageType,
    /// Originating container address, or agent id for agent messages.
    #[serde(rename = "Sender")]
    pub sender: String,
    #[serde(rename = "ContentType")]
    pub content_type: ContentType,
    /// Serialized payload, or plain text for agent messages.
    #[serde(rename = "Content")]
    pub content: String,
    /// Assigned by the sending transport. Only meaningful to match a reply to
    /// its request.
    #[serde(rename = "CorrelationID", default)]
    pub correlation_id: i64,
    #[serde(rename = "ExpectResponse", alias = "expectResponse", default)]
    pub expect_response: bool,
}

impl Message {
    /// Create a message with the default content type for `message_type`.
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            sender: sender.into(),
            content_type: message_type.content_type(),
            content: content.into(),
            correlation_id: 0,
            expect_response: false,
        }
    }

    /// Mailbox message carrying plain text.
    pub fn mail(content: impl Into<String>) -> Self {
        Self::new(MessageType::InterAgentAsyncMessage, String::new(), content)
    }

    /// Sync-channel message carrying plain text.
    pub fn sync(content: impl Into<String>) -> Self {
        Self::new(MessageType::InterAgentSyncMessage, String::new(), content)
    }

    /// Lifecycle teardown notice for an agent's mailbox.
    pub fn death() -> Self {
        Self::new(MessageType::Death, String::new(), String::new())
    }

    /// Control request with a serialized payload. Requests with an answer
    /// type expect a response.
    pub fn request<P: Serialize>(
        message_type: MessageType,
        sender: impl Into<String>,
        payload: &P,
    ) -> Result<Self> {
        let mut message = Self::new(message_type, sender, serde_json::to_string(payload)?);
        message.expect_response = message_type.answer().is_some();
        Ok(message)
    }

    /// Build the answer to this request. The correlation id is carried over
    /// unchanged so the requester can match it.
    pub fn answer<P: Serialize>(&self, sender: impl Into<String>, payload: &P) -> Result<Self> {
        let answer_type = self.message_type.answer().ok_or_else(|| {
            Error::Protocol(format!("{:?} does not take an answer", self.message_type))
        })?;
        let mut message = Self::new(answer_type, sender, serde_json::to_string(payload)?);
        message.correlation_id = self.correlation_id;
        message.expect_response = false;
        Ok(message)
    }

    /// Deserialize `Content` into a payload struct.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_str(&self.content).map_err(|e| {
            Error::Protocol(format!(
                "malformed {:?} payload: {}",
                self.message_type, e
            ))
        })
    }

    /// Deserialize the payload of a reply, checking it has the expected type.
    pub fn expect_payload<P: DeserializeOwned>(&self, expected: MessageType) -> Result<P> {
        if self.message_type != expected {
            return Err(Error::Protocol(format!(
                "expected {:?}, got {:?}",
                expected, self.message_type
            )));
        }
        self.payload()
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn is_death(&self) -> bool {
        self.message_type == MessageType::Death
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?} from {}] {}", self.message_type, self.sender, self.content)
    }
}
