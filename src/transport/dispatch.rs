//! Per-connection read loop and inbound dispatch.

use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;

use super::{Connection, ContainerOps, MessageTransport};
use crate::error::{Error, Result};
use crate::protocol::codec::{decode_frame, FrameReader};
use crate::protocol::types::{
    CloseSyncCommunicationPayload, GetAgentAddressAnswerPayload, GetAgentAddressPayload, InterAgentPayload,
    RegisterAgentAnswerPayload, RegisterAgentPayload, RegisterContainerAnswerPayload,
    RegisterContainerPayload, SetSyncCommunicationAnswerPayload, SetSyncCommunicationPayload,
};
use crate::protocol::{Message, MessageType};

impl MessageTransport {
    /// Read frames from `peer` until the stream ends or fails. Malformed and
    /// oversized frames are dropped and the loop carries on.
    pub(super) async fn read_loop(
        self: Arc<Self>,
        peer: String,
        connection: Arc<Connection>,
        mut reader: FrameReader<OwnedReadHalf>,
    ) {
        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::debug!(peer = %peer, "Peer closed connection");
                    break;
                }
                Err(Error::Protocol(reason)) => {
                    tracing::warn!(peer = %peer, "Dropping frame: {}", reason);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, "Read failed: {}", e);
                    break;
                }
            };

            match decode_frame::<Message>(&line) {
                Ok(message) => self.dispatch(message, &peer).await,
                Err(e) => tracing::warn!(peer = %peer, "Dropping malformed frame: {}", e),
            }
        }

        self.evict(&peer, &connection).await;
    }

    async fn dispatch(self: &Arc<Self>, message: Message, peer: &str) {
        if message.message_type.is_answer() {
            let waiter = self.pending.lock().remove(&message.correlation_id);
            match waiter {
                Some(waiter) => {
                    if waiter.send(message).is_err() {
                        tracing::debug!(peer, "Reply arrived after its waiter gave up");
                    }
                }
                None => tracing::warn!(
                    peer,
                    correlation_id = message.correlation_id,
                    "Dropping unmatched {:?}",
                    message.message_type
                ),
            }
            return;
        }

        let Some(ops) = self.container() else {
            tracing::warn!(peer, "No container attached, dropping {:?}", message.message_type);
            return;
        };

        match message.message_type {
            MessageType::RegisterContainer
            | MessageType::RegisterAgent
            | MessageType::GetAgentAddress
            | MessageType::SetSyncCommunication => {
                // Answering may itself need this connection, so never block
                // the read loop on it.
                let transport = Arc::clone(self);
                let peer = peer.to_string();
                self.spawn_tracked(async move {
                    let message_type = message.message_type;
                    if let Err(e) = transport.answer(ops, message, &peer).await {
                        tracing::warn!(peer = %peer, "Could not answer {:?}: {}", message_type, e);
                    }
                });
            }
            MessageType::InterAgentAsyncMessage => {
                if let Err(e) = deliver_mail(ops.as_ref(), message) {
                    tracing::warn!(peer, "Dropping mail: {}", e);
                }
            }
            MessageType::InterAgentSyncMessage => {
                if let Err(e) = self.deliver_sync(message).await {
                    tracing::warn!(peer, "Dropping sync message: {}", e);
                }
            }
            MessageType::CloseSyncCommunication => match message.payload::<CloseSyncCommunicationPayload>() {
                Ok(payload) => self.close_from_peer(payload.agent_id, payload.session_id),
                Err(e) => tracing::warn!(peer, "{}", e),
            },
            other => tracing::debug!(peer, "Ignoring {:?}", other),
        }
    }

    async fn answer(self: &Arc<Self>, ops: Arc<dyn ContainerOps>, request: Message, peer: &str) -> Result<()> {
        let local = self.local_address.as_str();
        let reply = match request.message_type {
            MessageType::RegisterContainer => {
                let payload: RegisterContainerPayload = request.payload()?;
                let container_id = ops.register_container(&payload.address).await?;
                request.answer(local, &RegisterContainerAnswerPayload { container_id })?
            }
            MessageType::RegisterAgent => {
                let payload: RegisterAgentPayload = request.payload()?;
                let id = ops.register_agent(payload.container_id).await?;
                request.answer(local, &RegisterAgentAnswerPayload { id })?
            }
            MessageType::GetAgentAddress => {
                let payload: GetAgentAddressPayload = request.payload()?;
                let address = match ops.resolve_agent_address(payload.agent_id).await {
                    Ok(address) => Some(address),
                    Err(Error::NotFound(_)) => None,
                    Err(e) => return Err(e),
                };
                request.answer(local, &GetAgentAddressAnswerPayload { address })?
            }
            MessageType::SetSyncCommunication => {
                let payload: SetSyncCommunicationPayload = request.payload()?;
                let success = self.accept_sync(ops.as_ref(), &payload, peer);
                request.answer(local, &SetSyncCommunicationAnswerPayload { success })?
            }
            other => return Err(Error::Protocol(format!("{:?} is not a request", other))),
        };

        self.write_to(&reply, peer).await
    }
}

/// Unwrap a network mail and hand it to the local mailbox.
fn deliver_mail(ops: &dyn ContainerOps, message: Message) -> Result<()> {
    let payload: InterAgentPayload = message.payload()?;
    let mail = Message::mail(payload.content).with_sender(message.sender);
    ops.put_message_in_mailbox(mail, payload.receiver_id);
    Ok(())
}
