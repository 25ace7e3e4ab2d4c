//! Wire-level message and payload types.
//!
//! Enumerations travel as integers in the order the protocol has always used,
//! payload structs use PascalCase field names.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Agent identifier issued by the address directory.
pub type AgentId = u64;

/// Container identifier issued by the address directory.
pub type ContainerId = u64;

/// Identifies one bridged sync channel across both of its ends.
pub type SessionId = u64;

/// Operation or event carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MessageType {
    RegisterContainer = 0,
    RegisterContainerAnswer = 1,
    RegisterAgent = 2,
    RegisterAgentAnswer = 3,
    InterAgentAsyncMessage = 4,
    GetAgentAddress = 5,
    GetAgentAddressAnswer = 6,
    /// Reserved for lifecycle teardown.
    Death = 7,
    SetSyncCommunication = 8,
    SetSyncCommunicationAnswer = 9,
    InterAgentSyncMessage = 10,
    CloseSyncCommunication = 11,
}

impl MessageType {
    /// Answers are the only messages matched against pending requests.
    pub fn is_answer(self) -> bool {
        matches!(
            self,
            MessageType::RegisterContainerAnswer
                | MessageType::RegisterAgentAnswer
                | MessageType::GetAgentAddressAnswer
                | MessageType::SetSyncCommunicationAnswer
        )
    }

    /// The answer type a request of this type expects, if any.
    pub fn answer(self) -> Option<MessageType> {
        match self {
            MessageType::RegisterContainer => Some(MessageType::RegisterContainerAnswer),
            MessageType::RegisterAgent => Some(MessageType::RegisterAgentAnswer),
            MessageType::GetAgentAddress => Some(MessageType::GetAgentAddressAnswer),
            MessageType::SetSyncCommunication => Some(MessageType::SetSyncCommunicationAnswer),
            _ => None,
        }
    }

    /// Default payload shape for this message type.
    pub fn content_type(self) -> ContentType {
        match self {
            MessageType::RegisterContainer => ContentType::RegisterContainerContent,
            MessageType::RegisterContainerAnswer => ContentType::RegisterContainerAnswerContent,
            MessageType::RegisterAgent => ContentType::RegisterAgentContent,
            MessageType::RegisterAgentAnswer => ContentType::RegisterAgentAnswerContent,
            MessageType::InterAgentAsyncMessage | MessageType::Death => {
                ContentType::InterAgentAsyncMessageContent
            }
            MessageType::GetAgentAddress => ContentType::GetAgentAddressContent,
            MessageType::GetAgentAddressAnswer => ContentType::GetAgentAddressAnswerContent,
            MessageType::SetSyncCommunication => ContentType::SetSyncCommunicationContent,
            MessageType::SetSyncCommunicationAnswer => {
                ContentType::SetSyncCommunicationAnswerContent
            }
            MessageType::InterAgentSyncMessage => ContentType::InterAgentSyncMessageContent,
            MessageType::CloseSyncCommunication => ContentType::CloseSyncCommunicationContent,
        }
    }
}

/// Shape of the serialized payload in `Content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ContentType {
    RegisterContainerContent = 0,
    RegisterContainerAnswerContent = 1,
    RegisterAgentContent = 2,
    RegisterAgentAnswerContent = 3,
    InterAgentAsyncMessageContent = 4,
    GetAgentAddressContent = 5,
    GetAgentAddressAnswerContent = 6,
    SetSyncCommunicationContent = 7,
    SetSyncCommunicationAnswerContent = 8,
    InterAgentSyncMessageContent = 9,
    CloseSyncCommunicationContent = 10,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterContainerPayload {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterContainerAnswerPayload {
    #[serde(rename = "ContainerID")]
    pub container_id: ContainerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAgentPayload {
    #[serde(rename = "ContainerID")]
    pub container_id: ContainerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAgentAnswerPayload {
    #[serde(rename = "ID")]
    pub id: AgentId,
}

/// Agent message wrapped for a network hop, used by both async and sync
/// deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterAgentPayload {
    #[serde(rename = "ReceiverID")]
    pub receiver_id: AgentId,
    #[serde(rename = "Content")]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAgentAddressPayload {
    #[serde(rename = "AgentID")]
    pub agent_id: AgentId,
}

/// `Address` is null when the directory does not know the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetAgentAddressAnswerPayload {
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSyncCommunicationPayload {
    /// Agent the channel is requested with.
    #[serde(rename = "AgentID")]
    pub agent_id: AgentId,
    /// Agent that asked for the channel.
    #[serde(rename = "RequesterID")]
    pub requester_id: AgentId,
    /// Chosen by the requester; both ends of the channel carry it.
    #[serde(rename = "SessionID", default)]
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetSyncCommunicationAnswerPayload {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSyncCommunicationPayload {
    #[serde(rename = "AgentID")]
    pub agent_id: AgentId,
    /// Session being closed. Zero closes whatever the agent is bound to.
    #[serde(rename = "SessionID", default)]
    pub session_id: SessionId,
}

/// First frame on a freshly dialed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "Identifier", alias = "identifier")]
    pub identifier: String,
}
