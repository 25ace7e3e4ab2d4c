//! Containers host agents and route their traffic.
//!
//! A main container owns the address directory and answers registration and
//! lookups itself. A regular container proxies those to the main container.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::agent::{Agent, AgentHandle, AgentRouter, SyncChannel};
use crate::config::{validate_settings, AgentRuntimeConfig, NodeConfig, Settings};
use crate::directory::AddressDirectory;
use crate::error::{Error, Result};
use crate::protocol::types::{
    GetAgentAddressAnswerPayload, GetAgentAddressPayload, InterAgentPayload, RegisterAgentAnswerPayload,
    RegisterAgentPayload, RegisterContainerAnswerPayload, RegisterContainerPayload,
};
use crate::protocol::{AgentId, ContainerId, Message, MessageType};
use crate::transport::{ContainerOps, MessageTransport};

pub struct Container {
    id: ContainerId,
    main_address: String,
    /// Present only on the main container.
    directory: Option<Arc<AddressDirectory>>,
    transport: Arc<MessageTransport>,
    agents: Mutex<HashMap<AgentId, AgentHandle>>,
    agent_config: AgentRuntimeConfig,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Address announced to peers: the configured one, or the listen host with
/// the port actually bound.
fn advertised_address(node: &NodeConfig, bound: SocketAddr) -> Result<String> {
    if let Some(address) = &node.advertise_address {
        return Ok(address.clone());
    }
    let (host, _) = node.listen_address.rsplit_once(':').ok_or_else(|| {
        Error::Config(format!("listen address '{}' has no port", node.listen_address))
    })?;
    Ok(format!("{}:{}", host, bound.port()))
}

impl Container {
    /// Bind, register and start serving according to `settings.node.is_main`.
    pub async fn start(settings: Settings) -> Result<Arc<Container>> {
        validate_settings(&settings)?;

        let listener = TcpListener::bind(&settings.node.listen_address).await?;
        let local_address = advertised_address(&settings.node, listener.local_addr()?)?;
        let transport = Arc::new(MessageTransport::new(
            local_address.clone(),
            &settings.transport,
            settings.agents.sync_channel_capacity,
        ));

        let (id, directory, main_address) = if settings.node.is_main {
            let directory = Arc::new(AddressDirectory::new());
            let id = directory.register_container(&local_address);
            (id, Some(directory), local_address.clone())
        } else {
            let main_address = settings.node.main_address.clone();
            let id = register_with_main(&transport, &main_address).await?;
            (id, None, main_address)
        };

        let container = Arc::new(Container {
            id,
            main_address,
            directory,
            transport: Arc::clone(&transport),
            agents: Mutex::new(HashMap::new()),
            agent_config: settings.agents.clone(),
            listener: Mutex::new(None),
        });

        let ops: Arc<dyn ContainerOps> = container.clone();
        transport.set_container_ops(Arc::downgrade(&ops));
        *container.listener.lock() = Some(tokio::spawn(transport.listen(listener)));

        tracing::info!(
            container_id = id,
            address = %local_address,
            main = container.is_main(),
            "Container started"
        );
        Ok(container)
    }

    /// Start a container that hosts the directory.
    pub async fn start_main(mut settings: Settings) -> Result<Arc<Container>> {
        settings.node.is_main = true;
        Self::start(settings).await
    }

    /// Start a container that registers with `settings.node.main_address`.
    pub async fn start_regular(mut settings: Settings) -> Result<Arc<Container>> {
        settings.node.is_main = false;
        Self::start(settings).await
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn is_main(&self) -> bool {
        self.directory.is_some()
    }

    pub fn local_address(&self) -> &str {
        self.transport.local_address()
    }

    pub fn main_address(&self) -> &str {
        &self.main_address
    }

    pub fn transport(&self) -> &Arc<MessageTransport> {
        &self.transport
    }

    pub fn directory(&self) -> Option<&Arc<AddressDirectory>> {
        self.directory.as_ref()
    }

    fn require_directory(&self) -> Result<&AddressDirectory> {
        self.directory
            .as_deref()
            .ok_or_else(|| Error::NotMain(self.local_address().to_string()))
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self.agents.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn agent(&self, id: AgentId) -> Option<AgentHandle> {
        self.agents.lock().get(&id).cloned()
    }

    /// Obtain an id from the directory and create the agent. The caller sets
    /// its behaviours and then runs it, usually through [`Container::spawn`].
    pub async fn add_agent(self: &Arc<Self>) -> Result<Agent> {
        let id = match &self.directory {
            Some(directory) => directory.register_agent(self.id)?,
            None => {
                let request = Message::request(
                    MessageType::RegisterAgent,
                    self.local_address(),
                    &RegisterAgentPayload { container_id: self.id },
                )?;
                let reply = self
                    .transport
                    .request(request, &self.main_address)
                    .await
                    .map_err(|e| Error::Registration(format!("agent registration with {} failed: {}", self.main_address, e)))?;
                let answer: RegisterAgentAnswerPayload = reply.expect_payload(MessageType::RegisterAgentAnswer)?;
                answer.id
            }
        };

        let router: Arc<dyn AgentRouter> = self.clone();
        let (agent, handle) = Agent::new(id, router, &self.agent_config);
        self.agents.lock().insert(id, handle);
        tracing::info!(agent_id = id, container_id = self.id, "Agent added");
        Ok(agent)
    }

    /// Run an agent on its own task.
    pub fn spawn(&self, agent: Agent) -> JoinHandle<()> {
        tokio::spawn(agent.run())
    }

    /// Stop a local agent and forget it. On the main container its id goes
    /// back to the directory for reuse.
    pub fn remove_agent(&self, id: AgentId) -> Result<()> {
        let handle = self
            .agents
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", id)))?;
        handle.deliver(Message::death());

        match &self.directory {
            Some(directory) => directory.release_agent(id)?,
            None => tracing::debug!(agent_id = id, "Agent id stays registered with the main container"),
        }
        tracing::info!(agent_id = id, "Agent removed");
        Ok(())
    }

    /// Address of the container owning `agent_id`.
    pub async fn resolve_agent_address(&self, agent_id: AgentId) -> Result<String> {
        if let Some(directory) = &self.directory {
            return directory.resolve_agent_address(agent_id);
        }

        let request = Message::request(
            MessageType::GetAgentAddress,
            self.local_address(),
            &GetAgentAddressPayload { agent_id },
        )?;
        let reply = self.transport.request(request, &self.main_address).await?;
        let answer: GetAgentAddressAnswerPayload = reply.expect_payload(MessageType::GetAgentAddressAnswer)?;
        answer
            .address
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))
    }

    /// This agent's end of a sync channel with `target`. Local targets get a
    /// direct pair, remote ones go through the transport handshake.
    pub async fn get_sync_channel_with_agent(&self, source: AgentId, target: AgentId) -> Result<SyncChannel> {
        if let Some(handle) = self.agent(target) {
            let (mine, theirs) = SyncChannel::local_pair(source, target, self.agent_config.sync_channel_capacity);
            handle
                .install_sync_channel(theirs)
                .map_err(|e| Error::Rejected(e.to_string()))?;
            return Ok(mine);
        }

        let address = self.resolve_agent_address(target).await?;
        self.transport.open_sync_channel(source, target, &address).await
    }

    /// Send a Death message to every local agent, stop accepting peers and
    /// close every connection.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.agents.lock().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.deliver(Message::death());
        }
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.abort();
        }
        self.transport.shutdown().await;
        tracing::info!(container_id = self.id, "Container shut down");
    }
}

async fn register_with_main(transport: &Arc<MessageTransport>, main_address: &str) -> Result<ContainerId> {
    let request = Message::request(
        MessageType::RegisterContainer,
        transport.local_address(),
        &RegisterContainerPayload {
            address: transport.local_address().to_string(),
        },
    )?;
    let reply = transport
        .request(request, main_address)
        .await
        .map_err(|e| Error::Registration(format!("container registration with {} failed: {}", main_address, e)))?;
    let answer: RegisterContainerAnswerPayload = reply.expect_payload(MessageType::RegisterContainerAnswer)?;
    Ok(answer.container_id)
}

#[async_trait]
impl AgentRouter for Container {
    async fn route(&self, message: Message, receiver: AgentId, sender: AgentId) -> Result<()> {
        if let Some(handle) = self.agent(receiver) {
            handle.deliver(message);
            return Ok(());
        }

        let address = self.resolve_agent_address(receiver).await?;
        let payload = InterAgentPayload {
            receiver_id: receiver,
            content: message.content,
        };
        let wrapped = Message::new(
            MessageType::InterAgentAsyncMessage,
            sender.to_string(),
            serde_json::to_string(&payload)?,
        );
        self.transport.send_message(wrapped, &address).await?;
        Ok(())
    }

    async fn sync_channel_with(&self, source: AgentId, target: AgentId) -> Result<SyncChannel> {
        self.get_sync_channel_with_agent(source, target).await
    }
}

#[async_trait]
impl ContainerOps for Container {
    async fn register_container(&self, address: &str) -> Result<ContainerId> {
        Ok(self.require_directory()?.register_container(address))
    }

    async fn register_agent(&self, container_id: ContainerId) -> Result<AgentId> {
        self.require_directory()?.register_agent(container_id)
    }

    async fn resolve_agent_address(&self, agent_id: AgentId) -> Result<String> {
        self.require_directory()?.resolve_agent_address(agent_id)
    }

    fn put_message_in_mailbox(&self, message: Message, receiver: AgentId) {
        match self.agent(receiver) {
            Some(handle) => {
                handle.deliver(message);
            }
            None => tracing::debug!(agent_id = receiver, "No such local agent, dropping mail"),
        }
    }

    fn attach_sync_channel(&self, agent_id: AgentId, channel: SyncChannel) -> Result<()> {
        self.agent(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?
            .install_sync_channel(channel)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("address", &self.local_address())
            .field("main", &self.is_main())
            .field("agents", &self.agent_ids())
            .finish()
    }
}
