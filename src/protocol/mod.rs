//! Wire protocol for agentmesh.
//!
//! - Message envelopes with correlation ids
//! - Typed control payloads (registration, lookup, sync handshake)
//! - Newline-delimited JSON framing

pub mod codec;
pub mod envelope;
pub mod types;

pub use envelope::Message;
pub use types::{AgentId, ContainerId, ContentType, Handshake, MessageType, SessionId};
