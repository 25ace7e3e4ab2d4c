//! Message transport between containers.
//!
//! One persistent TCP connection per remote address, reused for all traffic
//! in both directions. Requests that expect a reply are tagged with a
//! correlation id and parked in a pending table until the matching answer
//! arrives or the configured timeout fires.

mod bridge;
mod connection;
mod dispatch;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::agent::SyncChannel;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::protocol::codec::FrameReader;
use crate::protocol::{AgentId, ContainerId, Message};

pub use connection::Connection;

use bridge::SyncBinding;

/// Operations the transport invokes on its container for inbound traffic.
#[async_trait]
pub trait ContainerOps: Send + Sync {
    async fn register_container(&self, address: &str) -> Result<ContainerId>;

    async fn register_agent(&self, container_id: ContainerId) -> Result<AgentId>;

    async fn resolve_agent_address(&self, agent_id: AgentId) -> Result<String>;

    /// Fire-and-forget delivery into a local agent's mailbox.
    fn put_message_in_mailbox(&self, message: Message, receiver: AgentId);

    /// Hand a bridged sync endpoint to an idle local agent.
    fn attach_sync_channel(&self, agent_id: AgentId, channel: SyncChannel) -> Result<()>;
}

pub struct MessageTransport {
    local_address: String,
    config: TransportConfig,
    sync_capacity: usize,
    next_correlation_id: AtomicI64,
    next_binding_id: AtomicU64,
    /// Keyed by remote address. Dialing happens under this lock.
    connections: tokio::sync::Mutex<HashMap<String, Arc<Connection>>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Message>>>,
    bindings: Mutex<HashMap<AgentId, SyncBinding>>,
    /// Accept handlers, read loops and sync relays.
    tasks: Mutex<JoinSet<()>>,
    container: OnceLock<Weak<dyn ContainerOps>>,
}

/// Removes a pending entry however the wait ends.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<i64, oneshot::Sender<Message>>>,
    correlation_id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

impl MessageTransport {
    pub fn new(local_address: impl Into<String>, config: &TransportConfig, sync_capacity: usize) -> Self {
        Self {
            local_address: local_address.into(),
            config: config.clone(),
            sync_capacity,
            next_correlation_id: AtomicI64::new(1),
            next_binding_id: AtomicU64::new(1),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            container: OnceLock::new(),
        }
    }

    /// Address announced to peers in the handshake.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Wire the container that handles inbound requests. Only the first call
    /// has an effect.
    pub fn set_container_ops(&self, ops: Weak<dyn ContainerOps>) {
        if self.container.set(ops).is_err() {
            tracing::warn!("Container operations already set for transport");
        }
    }

    fn container(&self) -> Option<Arc<dyn ContainerOps>> {
        self.container.get().and_then(Weak::upgrade)
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        tracing::info!(address = %self.local_address, "Listening for peers");
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    break;
                }
            };

            let transport = Arc::clone(&self);
            self.spawn_tracked(async move {
                match Connection::accept(stream, transport.config.connect_timeout()).await {
                    Ok((connection, reader)) => transport.adopt(connection, reader).await,
                    Err(e) => tracing::warn!(%remote, "Rejected incoming connection: {}", e),
                }
            });
        }
    }

    /// Pool an accepted connection under its handshake identifier, unless one
    /// to that address already exists, and start its read loop.
    async fn adopt(self: Arc<Self>, connection: Connection, reader: FrameReader<OwnedReadHalf>) {
        let connection = Arc::new(connection);
        let peer = connection.peer().to_string();
        tracing::debug!(peer = %peer, "Accepted connection");
        {
            let mut pool = self.connections.lock().await;
            pool.entry(peer.clone()).or_insert_with(|| Arc::clone(&connection));
        }
        self.read_loop(peer, connection, reader).await;
    }

    /// Pooled connection to `address`, dialing it on first use.
    async fn connection(self: &Arc<Self>, address: &str) -> Result<Arc<Connection>> {
        let mut pool = self.connections.lock().await;
        if let Some(connection) = pool.get(address) {
            return Ok(Arc::clone(connection));
        }

        let (connection, reader) =
            Connection::dial(address, &self.local_address, self.config.connect_timeout()).await?;
        let connection = Arc::new(connection);
        pool.insert(address.to_string(), Arc::clone(&connection));

        Arc::clone(self).spawn_read_loop(address.to_string(), Arc::clone(&connection), reader);
        Ok(connection)
    }

    /// Boxed so the dial path does not depend on the read loop's future type.
    fn spawn_read_loop(self: Arc<Self>, peer: String, connection: Arc<Connection>, reader: FrameReader<OwnedReadHalf>) {
        let task: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(Arc::clone(&self).read_loop(peer, connection, reader));
        self.spawn_tracked(task);
    }

    /// Spawn a task owned by this transport. Finished tasks are reaped here.
    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Drop `connection` from the pool if it is still the one pooled for `peer`.
    async fn evict(&self, peer: &str, connection: &Arc<Connection>) {
        let mut pool = self.connections.lock().await;
        if pool.get(peer).is_some_and(|pooled| Arc::ptr_eq(pooled, connection)) {
            pool.remove(peer);
            tracing::debug!(peer, "Evicted connection");
        }
    }

    /// Write one frame as is. Replies go through here so their correlation id
    /// is preserved.
    async fn write_to(self: &Arc<Self>, message: &Message, address: &str) -> Result<()> {
        let connection = self.connection(address).await?;
        if let Err(e) = connection.send(message).await {
            self.evict(address, &connection).await;
            return Err(Error::Transport(format!("write to {} failed: {}", address, e)));
        }
        Ok(())
    }

    /// Send `message` to `address` under a fresh correlation id. When the
    /// message expects a response, waits for the correlated reply up to the
    /// request timeout.
    pub async fn send_message(self: &Arc<Self>, mut message: Message, address: &str) -> Result<Option<Message>> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        message.correlation_id = correlation_id;

        if !message.expect_response {
            self.write_to(&message, address).await?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        self.write_to(&message, address).await?;

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(Error::ConnectionClosed(address.to_string())),
            Err(_) => {
                tracing::warn!(correlation_id, address, "Request timed out");
                Err(Error::Timeout { correlation_id })
            }
        }
    }

    /// Send a request and return its reply.
    pub async fn request(self: &Arc<Self>, message: Message, address: &str) -> Result<Message> {
        let message_type = message.message_type;
        let mut message = message;
        message.expect_response = true;
        self.send_message(message, address).await?.ok_or_else(|| {
            Error::Protocol(format!("no reply to {:?} from {}", message_type, address))
        })
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Abort every connection task, drop the pool and close all sync
    /// bindings. Peers see their connections end; local waiters get
    /// `ConnectionClosed`.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.abort_all();
        let connections = {
            let mut pool = self.connections.lock().await;
            let count = pool.len();
            pool.clear();
            count
        };
        self.pending.lock().clear();
        let bindings = self.close_all_bindings();
        tracing::info!(
            address = %self.local_address,
            connections,
            bindings,
            "Transport shut down"
        );
    }
}

impl std::fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransport")
            .field("local_address", &self.local_address)
            .field("pending", &self.pending_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{encode_frame, FrameWriter};
    use crate::protocol::types::{GetAgentAddressAnswerPayload, GetAgentAddressPayload, InterAgentPayload};
    use crate::protocol::{Handshake, MessageType};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            request_timeout_ms: 200,
            connect_timeout_ms: 500,
        }
    }

    /// Container stand-in resolving agent 1 to a fixed address, recording
    /// mailbox deliveries and accepting sync channels for agent 1.
    #[derive(Default)]
    struct StubOps {
        mail: Mutex<Vec<(Message, AgentId)>>,
        endpoints: Mutex<Vec<SyncChannel>>,
        attach_delay_ms: AtomicU64,
    }

    #[async_trait]
    impl ContainerOps for StubOps {
        async fn register_container(&self, _address: &str) -> Result<ContainerId> {
            Ok(1)
        }

        async fn register_agent(&self, _container_id: ContainerId) -> Result<AgentId> {
            Ok(1)
        }

        async fn resolve_agent_address(&self, agent_id: AgentId) -> Result<String> {
            if agent_id == 1 {
                Ok("stub:1".to_string())
            } else {
                Err(Error::NotFound(format!("agent {}", agent_id)))
            }
        }

        fn put_message_in_mailbox(&self, message: Message, receiver: AgentId) {
            self.mail.lock().push((message, receiver));
        }

        fn attach_sync_channel(&self, agent_id: AgentId, channel: SyncChannel) -> Result<()> {
            let delay = self.attach_delay_ms.load(Ordering::Relaxed);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }
            if agent_id != 1 {
                return Err(Error::NotFound(format!("agent {}", agent_id)));
            }
            self.endpoints.lock().push(channel);
            Ok(())
        }
    }

    async fn serve(ops: &Arc<StubOps>) -> Arc<MessageTransport> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let transport = Arc::new(MessageTransport::new(address, &fast_config(), 4));
        let ops: Arc<dyn ContainerOps> = ops.clone();
        transport.set_container_ops(Arc::downgrade(&ops));
        tokio::spawn(Arc::clone(&transport).listen(listener));
        transport
    }

    fn client() -> Arc<MessageTransport> {
        Arc::new(MessageTransport::new("127.0.0.1:1", &fast_config(), 4))
    }

    #[tokio::test]
    async fn test_reply_carries_request_correlation_id() {
        crate::logging::init_test();
        let ops = Arc::new(StubOps::default());
        let server = serve(&ops).await;
        let client = client();

        for agent_id in [1, 2] {
            let request = Message::request(
                MessageType::GetAgentAddress,
                client.local_address(),
                &GetAgentAddressPayload { agent_id },
            )
            .unwrap();
            let reply = client.request(request, server.local_address()).await.unwrap();
            let answer: GetAgentAddressAnswerPayload =
                reply.expect_payload(MessageType::GetAgentAddressAnswer).unwrap();
            if agent_id == 1 {
                assert_eq!(answer.address.as_deref(), Some("stub:1"));
            } else {
                assert_eq!(answer.address, None);
            }
            assert!(reply.correlation_id > 0);
        }

        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_replies() {
        let ops = Arc::new(StubOps::default());
        let server = serve(&ops).await;
        let client = client();
        let address = server.local_address().to_string();

        let tasks: Vec<_> = (0..16u64)
            .map(|i| {
                let client = Arc::clone(&client);
                let address = address.clone();
                tokio::spawn(async move {
                    let agent_id = if i % 2 == 0 { 1 } else { 100 + i };
                    let request = Message::request(
                        MessageType::GetAgentAddress,
                        client.local_address(),
                        &GetAgentAddressPayload { agent_id },
                    )
                    .unwrap();
                    let reply = client.request(request, &address).await.unwrap();
                    let answer: GetAgentAddressAnswerPayload = reply.payload().unwrap();
                    (agent_id, answer.address)
                })
            })
            .collect();

        for task in tasks {
            let (agent_id, address) = task.await.unwrap();
            assert_eq!(address.is_some(), agent_id == 1);
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out_and_cleans_up() {
        // A peer that accepts the connection but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = FrameReader::new(stream);
            while let Ok(Some(_)) = reader.next_line().await {}
        });

        let client = client();
        let request = Message::request(
            MessageType::GetAgentAddress,
            client.local_address(),
            &GetAgentAddressPayload { agent_id: 1 },
        )
        .unwrap();
        let result = client.request(request, &address).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = client();
        let result = client.send_message(Message::mail("x"), &address).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_mail_delivery_survives_bad_frames() {
        let ops = Arc::new(StubOps::default());
        let server = serve(&ops).await;

        let stream = TcpStream::connect(server.local_address()).await.unwrap();
        let mut writer = FrameWriter::new(stream);
        writer
            .write_frame(&Handshake {
                identifier: "127.0.0.1:9".to_string(),
            })
            .await
            .unwrap();
        writer.write_frame(&serde_json::json!({"Type": 99})).await.unwrap();
        writer.write_frame(&serde_json::json!({"garbage": true})).await.unwrap();

        let payload = InterAgentPayload {
            receiver_id: 5,
            content: "Start !".to_string(),
        };
        let mail = Message::new(
            MessageType::InterAgentAsyncMessage,
            "1",
            serde_json::to_string(&payload).unwrap(),
        );
        writer.write_frame(&mail).await.unwrap();

        let mut delivered = None;
        for _ in 0..50 {
            if let Some(entry) = ops.mail.lock().first().cloned() {
                delivered = Some(entry);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (message, receiver) = delivered.expect("mail was not delivered");
        assert_eq!(receiver, 5);
        assert_eq!(message.content, "Start !");
        assert_eq!(message.sender, "1");
    }

    #[tokio::test]
    async fn test_read_loop_survives_invalid_utf8() {
        let ops = Arc::new(StubOps::default());
        let server = serve(&ops).await;

        let mut stream = TcpStream::connect(server.local_address()).await.unwrap();
        let handshake = encode_frame(&Handshake {
            identifier: "127.0.0.1:9".to_string(),
        })
        .unwrap();
        stream.write_all(handshake.as_bytes()).await.unwrap();
        stream.write_all(b"\xff\xfe\xfd\n").await.unwrap();
        stream.write_all(b"{\"Content\":\"\xc3\x28\"}\n").await.unwrap();

        let payload = InterAgentPayload {
            receiver_id: 5,
            content: "still here".to_string(),
        };
        let mail = Message::new(
            MessageType::InterAgentAsyncMessage,
            "1",
            serde_json::to_string(&payload).unwrap(),
        );
        stream.write_all(encode_frame(&mail).unwrap().as_bytes()).await.unwrap();

        let mut delivered = None;
        for _ in 0..50 {
            if let Some(entry) = ops.mail.lock().first().cloned() {
                delivered = Some(entry);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (message, receiver) = delivered.expect("mail after invalid UTF-8 was not delivered");
        assert_eq!(receiver, 5);
        assert_eq!(message.content, "still here");
        assert_eq!(server.connection_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_sync_request_is_closed_on_the_peer() {
        let ops = Arc::new(StubOps::default());
        // The peer accepts only after the requester's 200ms timeout.
        ops.attach_delay_ms.store(500, Ordering::Relaxed);
        let server = serve(&ops).await;
        let client = client();

        let result = client.open_sync_channel(20, 1, server.local_address()).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(!client.has_sync_binding(20));

        let mut attached = false;
        for _ in 0..100 {
            if !ops.endpoints.lock().is_empty() {
                attached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(attached, "late accept never completed");
        assert!(!server.has_sync_binding(1));
        assert!(ops.endpoints.lock()[0].is_closed());

        // The agent is free again, so a retry binds both ends.
        ops.attach_delay_ms.store(0, Ordering::Relaxed);
        let endpoint = client.open_sync_channel(20, 1, server.local_address()).await.unwrap();
        assert_eq!(endpoint.peer_id(), 1);
        assert!(client.has_sync_binding(20));
        assert!(server.has_sync_binding(1));
    }

    #[tokio::test]
    async fn test_shutdown_drops_pool_and_ends_peer_connections() {
        let ops = Arc::new(StubOps::default());
        let server = serve(&ops).await;
        let client = client();

        let request = Message::request(
            MessageType::GetAgentAddress,
            client.local_address(),
            &GetAgentAddressPayload { agent_id: 1 },
        )
        .unwrap();
        client.request(request, server.local_address()).await.unwrap();
        assert_eq!(client.connection_count().await, 1);
        assert_eq!(server.connection_count().await, 1);

        let endpoint = client.open_sync_channel(20, 1, server.local_address()).await.unwrap();
        assert_eq!(ops.endpoints.lock().len(), 1);

        server.shutdown().await;
        assert_eq!(server.connection_count().await, 0);
        assert!(!server.has_sync_binding(1));
        assert!(ops.endpoints.lock()[0].is_closed());

        // The client's read loop sees the stream end and evicts it.
        let mut evicted = false;
        for _ in 0..100 {
            if client.connection_count().await == 0 {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(evicted, "peer connection outlived shutdown");
        drop(endpoint);
    }

    #[tokio::test]
    async fn test_unsolicited_answer_is_dropped() {
        let ops = Arc::new(StubOps::default());
        let server = serve(&ops).await;

        // An unsolicited answer must be dropped, not dispatched.
        let stream = TcpStream::connect(server.local_address()).await.unwrap();
        let mut writer = FrameWriter::new(stream);
        writer
            .write_frame(&Handshake {
                identifier: "127.0.0.1:9".to_string(),
            })
            .await
            .unwrap();
        let mut stray = Message::new(MessageType::GetAgentAddressAnswer, "x", "{\"Address\":null}");
        stray.correlation_id = 1;
        writer.write_frame(&stray).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.pending_requests(), 0);
        assert!(ops.mail.lock().is_empty());
    }
}
