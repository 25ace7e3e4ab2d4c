//! Sync channels bridged across a network hop.
//!
//! Each side keeps a binding per local agent: the remote agent and address,
//! and the sender feeding the local endpoint. A relay task per binding turns
//! every message the local agent writes into one fire-and-forget send.
//!
//! The requester picks a session id and both bindings record it. A close only
//! tears down the binding of the session it names.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ContainerOps, MessageTransport};
use crate::agent::SyncChannel;
use crate::error::{Error, Result};
use crate::protocol::types::{
    CloseSyncCommunicationPayload, InterAgentPayload, SetSyncCommunicationAnswerPayload,
    SetSyncCommunicationPayload,
};
use crate::protocol::{AgentId, Message, MessageType, SessionId};

#[derive(Debug)]
pub(super) struct SyncBinding {
    binding_id: u64,
    session_id: SessionId,
    remote_agent: AgentId,
    remote_address: String,
    inbound: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
}

/// A binding registered but not yet relaying.
struct Reserved {
    binding_id: u64,
    endpoint: SyncChannel,
    outbound: mpsc::Receiver<Message>,
}

impl MessageTransport {
    /// Ask the container at `address` for a channel between local agent
    /// `source` and its agent `target`.
    pub async fn open_sync_channel(
        self: &Arc<Self>,
        source: AgentId,
        target: AgentId,
        address: &str,
    ) -> Result<SyncChannel> {
        if self.has_sync_binding(source) {
            return Err(Error::SyncChannel(format!(
                "agent {} already has a synchronous communication",
                source
            )));
        }

        let session_id = self.next_binding_id.fetch_add(1, Ordering::Relaxed);
        let request = Message::request(
            MessageType::SetSyncCommunication,
            self.local_address.as_str(),
            &SetSyncCommunicationPayload {
                agent_id: target,
                requester_id: source,
                session_id,
            },
        )?;
        let reply = match self.request(request, address).await {
            Ok(reply) => reply,
            Err(e @ (Error::Timeout { .. } | Error::ConnectionClosed(_))) => {
                // The peer may still accept after we stopped waiting.
                self.send_close(target, session_id, address).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let answer: SetSyncCommunicationAnswerPayload =
            reply.expect_payload(MessageType::SetSyncCommunicationAnswer)?;
        if !answer.success {
            return Err(Error::Rejected(format!("agent {} at {} is busy", target, address)));
        }

        match self.reserve(source, target, address, session_id) {
            Ok(reserved) => {
                tracing::info!(agent_id = source, peer = target, address, "Sync channel bridged");
                let Reserved {
                    binding_id,
                    endpoint,
                    outbound,
                } = reserved;
                self.start_relay(source, target, session_id, address.to_string(), binding_id, outbound);
                Ok(endpoint)
            }
            Err(e) => {
                // The peer already bound its side.
                self.send_close(target, session_id, address).await;
                Err(e)
            }
        }
    }

    /// Accepting side of the handshake. Answers false while the agent is
    /// bound, busy or unknown.
    pub(super) fn accept_sync(
        self: &Arc<Self>,
        ops: &dyn ContainerOps,
        request: &SetSyncCommunicationPayload,
        peer: &str,
    ) -> bool {
        let local = request.agent_id;
        let remote = request.requester_id;
        let session_id = request.session_id;

        let reserved = match self.reserve(local, remote, peer, session_id) {
            Ok(reserved) => reserved,
            Err(e) => {
                tracing::info!(agent_id = local, peer, "Refusing sync communication: {}", e);
                return false;
            }
        };

        let Reserved {
            binding_id,
            endpoint,
            outbound,
        } = reserved;
        if let Err(e) = ops.attach_sync_channel(local, endpoint) {
            self.unbind(local, binding_id);
            tracing::info!(agent_id = local, peer, "Refusing sync communication: {}", e);
            return false;
        }

        tracing::info!(agent_id = local, remote_agent = remote, peer, "Sync channel accepted");
        self.start_relay(local, remote, session_id, peer.to_string(), binding_id, outbound);
        true
    }

    pub fn has_sync_binding(&self, agent_id: AgentId) -> bool {
        self.bindings.lock().contains_key(&agent_id)
    }

    fn reserve(&self, local: AgentId, remote: AgentId, address: &str, session_id: SessionId) -> Result<Reserved> {
        let mut bindings = self.bindings.lock();
        if let Some(existing) = bindings.get(&local) {
            return Err(Error::SyncChannel(format!(
                "agent {} is already bound to agent {} at {}",
                local, existing.remote_agent, existing.remote_address
            )));
        }

        let (endpoint, ends) = SyncChannel::bridged(remote, self.sync_capacity);
        let binding_id = self.next_binding_id.fetch_add(1, Ordering::Relaxed);
        bindings.insert(
            local,
            SyncBinding {
                binding_id,
                session_id,
                remote_agent: remote,
                remote_address: address.to_string(),
                inbound: ends.inbound,
                closed: ends.closed,
            },
        );
        Ok(Reserved {
            binding_id,
            endpoint,
            outbound: ends.outbound,
        })
    }

    /// Remove the binding of `local` if it is still the one identified by
    /// `binding_id`.
    fn unbind(&self, local: AgentId, binding_id: u64) -> Option<SyncBinding> {
        let mut bindings = self.bindings.lock();
        match bindings.get(&local) {
            Some(binding) if binding.binding_id == binding_id => bindings.remove(&local),
            _ => None,
        }
    }

    fn start_relay(
        self: &Arc<Self>,
        local: AgentId,
        remote: AgentId,
        session_id: SessionId,
        address: String,
        binding_id: u64,
        mut outbound: mpsc::Receiver<Message>,
    ) {
        let transport = Arc::clone(self);
        self.spawn_tracked(async move {
            while let Some(message) = outbound.recv().await {
                let payload = InterAgentPayload {
                    receiver_id: remote,
                    content: message.content,
                };
                let content = match serde_json::to_string(&payload) {
                    Ok(content) => content,
                    Err(e) => {
                        tracing::warn!(agent_id = local, "Could not encode sync message: {}", e);
                        continue;
                    }
                };
                let wrapped = Message::new(MessageType::InterAgentSyncMessage, message.sender, content);
                if let Err(e) = transport.send_message(wrapped, &address).await {
                    tracing::warn!(agent_id = local, address = %address, "Sync relay send failed: {}", e);
                }
            }

            // The local endpoint is gone. If the binding is still ours the
            // close started here and the peer must be told.
            if let Some(binding) = transport.unbind(local, binding_id) {
                binding.closed.store(true, Ordering::Release);
                transport.send_close(remote, session_id, &address).await;
            }
            tracing::debug!(agent_id = local, peer = remote, "Sync relay stopped");
        });
    }

    async fn send_close(self: &Arc<Self>, remote: AgentId, session_id: SessionId, address: &str) {
        let close = match Message::request(
            MessageType::CloseSyncCommunication,
            self.local_address.as_str(),
            &CloseSyncCommunicationPayload {
                agent_id: remote,
                session_id,
            },
        ) {
            Ok(close) => close,
            Err(e) => {
                tracing::warn!("Could not encode sync close: {}", e);
                return;
            }
        };
        if let Err(e) = self.send_message(close, address).await {
            tracing::warn!(address, "Could not notify peer of sync close: {}", e);
        }
    }

    /// Feed a relayed message into the bound local endpoint.
    pub(super) async fn deliver_sync(&self, message: Message) -> Result<()> {
        let payload: InterAgentPayload = message.payload()?;
        let inbound = self
            .bindings
            .lock()
            .get(&payload.receiver_id)
            .map(|binding| binding.inbound.clone())
            .ok_or_else(|| Error::NotFound(format!("sync binding for agent {}", payload.receiver_id)))?;

        let sync = Message::sync(payload.content).with_sender(message.sender);
        inbound
            .send(sync)
            .await
            .map_err(|_| Error::SyncChannel(format!("agent {} dropped its endpoint", payload.receiver_id)))
    }

    /// Drop every binding and mark its endpoint closed.
    pub(super) fn close_all_bindings(&self) -> usize {
        let bindings: Vec<SyncBinding> = self.bindings.lock().drain().map(|(_, binding)| binding).collect();
        for binding in &bindings {
            binding.closed.store(true, Ordering::Release);
        }
        bindings.len()
    }

    /// The peer closed its side of session `session_id`. Zero matches any
    /// session.
    pub(super) fn close_from_peer(&self, local: AgentId, session_id: SessionId) {
        let removed = {
            let mut bindings = self.bindings.lock();
            match bindings.get(&local) {
                Some(binding) if session_id == 0 || binding.session_id == session_id => bindings.remove(&local),
                _ => None,
            }
        };
        match removed {
            Some(binding) => {
                binding.closed.store(true, Ordering::Release);
                tracing::info!(
                    agent_id = local,
                    peer = binding.remote_agent,
                    session_id = binding.session_id,
                    "Peer closed sync channel"
                );
            }
            None => tracing::debug!(agent_id = local, session_id, "Close for unknown sync session"),
        }
    }
}
