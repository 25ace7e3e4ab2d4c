//! Agents: identity, mailbox, optional sync channel and a pluggable behaviour.

pub mod behaviour;
pub mod sync;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::config::AgentRuntimeConfig;
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Message};

pub use behaviour::{Behaviour, SharedBehaviour};
pub use sync::{SyncChannel, SyncSender};

/// What an agent needs from its container.
#[async_trait]
pub trait AgentRouter: Send + Sync {
    /// Deliver `message` to `receiver`, locally or over the network.
    async fn route(&self, message: Message, receiver: AgentId, sender: AgentId) -> Result<()>;

    /// Obtain this agent's end of a sync channel with `target`.
    async fn sync_channel_with(&self, source: AgentId, target: AgentId) -> Result<SyncChannel>;
}

/// State of an agent's synchronous communication.
#[derive(Debug)]
pub(crate) enum SyncState {
    Idle,
    Requesting,
    Established(SyncChannel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Requesting,
    Established,
}

impl SyncState {
    fn status(&self) -> SyncStatus {
        match self {
            SyncState::Idle => SyncStatus::Idle,
            SyncState::Requesting => SyncStatus::Requesting,
            SyncState::Established(_) => SyncStatus::Established,
        }
    }
}

/// Container-side reference to an agent: its mailbox and its sync slot.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    id: AgentId,
    mailbox: mpsc::Sender<Message>,
    sync: Arc<Mutex<SyncState>>,
}

impl AgentHandle {
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Non-blocking mailbox write. A full or closed mailbox drops the message.
    pub fn deliver(&self, message: Message) -> bool {
        match self.mailbox.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                tracing::warn!(agent_id = self.id, "Mailbox full, dropping message: {}", message);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(agent_id = self.id, "Mailbox closed, dropping message");
                false
            }
        }
    }

    /// Hand a channel to an idle agent.
    pub fn install_sync_channel(&self, channel: SyncChannel) -> Result<()> {
        let mut slot = self.sync.lock();
        match *slot {
            SyncState::Idle => {
                tracing::debug!(agent_id = self.id, peer = channel.peer_id(), "Sync channel installed");
                *slot = SyncState::Established(channel);
                Ok(())
            }
            _ => Err(Error::SyncChannel(format!(
                "agent {} already has a synchronous communication",
                self.id
            ))),
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.lock().status()
    }
}

/// Outcome of one run-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Mailbox,
    Sync,
    Cycle,
    Stopped,
}

pub struct Agent {
    id: AgentId,
    current: Option<(String, SharedBehaviour)>,
    behaviours: HashMap<String, SharedBehaviour>,
    mailbox: mpsc::Receiver<Message>,
    sync: Arc<Mutex<SyncState>>,
    router: Arc<dyn AgentRouter>,
    tick_interval: Duration,
}

impl Agent {
    /// Create an agent and the handle its container keeps.
    pub fn new(
        id: AgentId,
        router: Arc<dyn AgentRouter>,
        config: &AgentRuntimeConfig,
    ) -> (Agent, AgentHandle) {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity);
        let sync = Arc::new(Mutex::new(SyncState::Idle));

        let agent = Agent {
            id,
            current: None,
            behaviours: HashMap::new(),
            mailbox: mailbox_rx,
            sync: Arc::clone(&sync),
            router,
            tick_interval: config.tick_interval(),
        };
        let handle = AgentHandle {
            id,
            mailbox: mailbox_tx,
            sync,
        };
        (agent, handle)
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn register_behaviour<B: Behaviour + 'static>(&mut self, name: impl Into<String>, behaviour: B) {
        self.behaviours.insert(name.into(), behaviour::shared(behaviour));
    }

    /// Make a registered behaviour the active one.
    pub fn set_behaviour(&mut self, name: &str) -> Result<()> {
        let behaviour = self
            .behaviours
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("behaviour '{}'", name)))?;
        self.current = Some((name.to_string(), behaviour));
        Ok(())
    }

    /// Unregister a behaviour. The active behaviour stays active until
    /// another one is set.
    pub fn remove_behaviour(&mut self, name: &str) -> bool {
        self.behaviours.remove(name).is_some()
    }

    pub fn current_behaviour(&self) -> Option<&str> {
        self.current.as_ref().map(|(name, _)| name.as_str())
    }

    fn active(&self) -> Option<SharedBehaviour> {
        self.current.as_ref().map(|(_, behaviour)| Arc::clone(behaviour))
    }

    pub async fn perceive(&mut self) {
        let Some(behaviour) = self.active() else {
            tracing::warn!(agent_id = self.id, "No behaviour set for agent");
            return;
        };
        let mut behaviour = behaviour.lock().await;
        behaviour.perceive(self).await;
    }

    pub async fn decide(&mut self) {
        let Some(behaviour) = self.active() else {
            tracing::warn!(agent_id = self.id, "No behaviour set for agent");
            return;
        };
        let mut behaviour = behaviour.lock().await;
        behaviour.decide(self).await;
    }

    pub async fn act(&mut self) {
        let Some(behaviour) = self.active() else {
            tracing::warn!(agent_id = self.id, "No behaviour set for agent");
            return;
        };
        let mut behaviour = behaviour.lock().await;
        behaviour.act(self).await;
    }

    async fn handle_mailbox_message(&mut self, message: Message) {
        let Some(behaviour) = self.active() else {
            tracing::warn!(agent_id = self.id, "No behaviour set, dropping mail: {}", message);
            return;
        };
        let mut behaviour = behaviour.lock().await;
        behaviour.handle_mailbox_message(self, message).await;
    }

    async fn handle_sync_communication(&mut self, message: Message) {
        let Some(behaviour) = self.active() else {
            tracing::warn!(agent_id = self.id, "No behaviour set, dropping sync message: {}", message);
            return;
        };
        let mut behaviour = behaviour.lock().await;
        behaviour.handle_sync_communication(self, message).await;
    }

    /// Send a mailbox message, tagged with this agent as sender.
    pub async fn send_mail(&self, message: Message, receiver: AgentId) -> Result<()> {
        let message = message.with_sender(self.id.to_string());
        self.router.route(message, receiver, self.id).await
    }

    /// Open a sync channel with `peer`. Fails while a channel exists or is
    /// being requested.
    pub async fn start_sync_communication(&self, peer: AgentId) -> Result<()> {
        {
            let mut slot = self.sync.lock();
            match *slot {
                SyncState::Idle => *slot = SyncState::Requesting,
                SyncState::Requesting => {
                    return Err(Error::SyncChannel(format!(
                        "agent {} is already requesting a synchronous communication",
                        self.id
                    )))
                }
                SyncState::Established(_) => {
                    return Err(Error::SyncChannel(format!(
                        "agent {} already has a synchronous communication",
                        self.id
                    )))
                }
            }
        }

        let result = self.router.sync_channel_with(self.id, peer).await;

        let mut slot = self.sync.lock();
        match result {
            Ok(channel) => {
                tracing::info!(agent_id = self.id, peer, "Synchronous communication established");
                *slot = SyncState::Established(channel);
                Ok(())
            }
            Err(e) => {
                *slot = SyncState::Idle;
                Err(e)
            }
        }
    }

    /// Write into the established sync channel.
    pub async fn send_sync_message(&self, message: Message) -> Result<()> {
        let sender = {
            let slot = self.sync.lock();
            match &*slot {
                SyncState::Established(channel) => channel.sender(),
                _ => {
                    return Err(Error::SyncChannel(format!(
                        "agent {} does not have a synchronous communication",
                        self.id
                    )))
                }
            }
        };

        let message = message.with_sender(self.id.to_string());
        let result = sender.send(message).await;
        if result.is_err() {
            self.clear_closed_channel();
        }
        result
    }

    /// Close the sync channel for good. A later session needs a new start.
    pub fn stop_synchronous_communication(&self) -> Result<()> {
        let mut slot = self.sync.lock();
        match std::mem::replace(&mut *slot, SyncState::Idle) {
            SyncState::Established(channel) => {
                tracing::info!(agent_id = self.id, peer = channel.peer_id(), "Synchronous communication stopped");
                channel.close();
                Ok(())
            }
            SyncState::Requesting => {
                *slot = SyncState::Requesting;
                Err(Error::SyncChannel(format!(
                    "agent {} is still requesting its synchronous communication",
                    self.id
                )))
            }
            SyncState::Idle => Err(Error::SyncChannel(format!(
                "agent {} does not have a synchronous communication",
                self.id
            ))),
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.lock().status()
    }

    fn clear_closed_channel(&self) {
        let mut slot = self.sync.lock();
        if matches!(&*slot, SyncState::Established(channel) if channel.is_closed()) {
            *slot = SyncState::Idle;
        }
    }

    fn poll_sync(&self) -> Option<Message> {
        let mut slot = self.sync.lock();
        let SyncState::Established(channel) = &mut *slot else {
            return None;
        };
        match channel.try_recv() {
            Ok(message) => message,
            Err(e) => {
                tracing::info!(agent_id = self.id, "{}", e);
                *slot = SyncState::Idle;
                None
            }
        }
    }

    fn shutdown_sync(&self) {
        if let SyncState::Established(channel) = std::mem::replace(&mut *self.sync.lock(), SyncState::Idle) {
            channel.close();
        }
    }

    /// One run-loop iteration: mailbox first, then the sync channel, otherwise
    /// a perceive/decide/act cycle.
    pub async fn step(&mut self) -> Step {
        match self.mailbox.try_recv() {
            Ok(message) if message.is_death() => {
                tracing::info!(agent_id = self.id, "Death message received");
                self.shutdown_sync();
                return Step::Stopped;
            }
            Ok(message) => {
                self.handle_mailbox_message(message).await;
                return Step::Mailbox;
            }
            Err(TryRecvError::Disconnected) => {
                self.shutdown_sync();
                return Step::Stopped;
            }
            Err(TryRecvError::Empty) => {}
        }

        if let Some(message) = self.poll_sync() {
            self.handle_sync_communication(message).await;
            return Step::Sync;
        }

        if self.current.is_none() {
            tracing::trace!(agent_id = self.id, "Idle without behaviour");
            return Step::Cycle;
        }
        self.perceive().await;
        self.decide().await;
        self.act().await;
        Step::Cycle
    }

    /// Run until a Death message arrives or the container drops the agent.
    pub async fn run(mut self) {
        tracing::info!(agent_id = self.id, "Agent started");
        loop {
            match self.step().await {
                Step::Stopped => break,
                Step::Cycle => tokio::time::sleep(self.tick_interval).await,
                Step::Mailbox | Step::Sync => tokio::task::yield_now().await,
            }
        }
        tracing::info!(agent_id = self.id, "Agent stopped");
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("current", &self.current_behaviour())
            .field("behaviours", &self.behaviours.keys().collect::<Vec<_>>())
            .field("sync", &self.sync_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Router keeping everything in memory.
    #[derive(Default)]
    struct LoopbackRouter {
        routed: Mutex<Vec<(Message, AgentId, AgentId)>>,
        peers: Mutex<HashMap<AgentId, AgentHandle>>,
    }

    #[async_trait]
    impl AgentRouter for LoopbackRouter {
        async fn route(&self, message: Message, receiver: AgentId, sender: AgentId) -> Result<()> {
            self.routed.lock().push((message, receiver, sender));
            Ok(())
        }

        async fn sync_channel_with(&self, source: AgentId, target: AgentId) -> Result<SyncChannel> {
            let peer = self
                .peers
                .lock()
                .get(&target)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("agent {}", target)))?;
            let (mine, theirs) = SyncChannel::local_pair(source, target, 4);
            peer.install_sync_channel(theirs)?;
            Ok(mine)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Behaviour for Recorder {
        async fn act(&mut self, _agent: &mut Agent) {
            self.events.lock().push("act".to_string());
        }

        async fn handle_mailbox_message(&mut self, _agent: &mut Agent, message: Message) {
            self.events.lock().push(format!("mail:{}", message.content));
        }

        async fn handle_sync_communication(&mut self, _agent: &mut Agent, message: Message) {
            self.events.lock().push(format!("sync:{}", message.content));
        }
    }

    fn config() -> AgentRuntimeConfig {
        AgentRuntimeConfig {
            mailbox_capacity: 2,
            sync_channel_capacity: 4,
            tick_interval_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_mail_before_sync_before_cycle() {
        let router = Arc::new(LoopbackRouter::default());
        let (mut agent, handle) = Agent::new(1, router.clone(), &config());
        let (_peer, peer_handle) = Agent::new(2, router.clone(), &config());
        router.peers.lock().insert(2, peer_handle.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        agent.register_behaviour("rec", Recorder { events: Arc::clone(&events) });
        agent.set_behaviour("rec").unwrap();

        // Peer 2 opens a channel towards 1 and writes into it.
        let (peer_end, agent_end) = SyncChannel::local_pair(2, 1, 4);
        handle.install_sync_channel(agent_end).unwrap();
        peer_end.sender().send(Message::sync("s1")).await.unwrap();
        assert!(handle.deliver(Message::mail("m1")));

        assert_eq!(agent.step().await, Step::Mailbox);
        assert_eq!(agent.step().await, Step::Sync);
        assert_eq!(agent.step().await, Step::Cycle);
        assert_eq!(*events.lock(), vec!["mail:m1", "sync:s1", "act"]);
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_without_blocking() {
        let router = Arc::new(LoopbackRouter::default());
        let (_agent, handle) = Agent::new(1, router, &config());
        assert!(handle.deliver(Message::mail("a")));
        assert!(handle.deliver(Message::mail("b")));
        assert!(!handle.deliver(Message::mail("c")));
    }

    #[tokio::test]
    async fn test_behaviour_registry() {
        let router = Arc::new(LoopbackRouter::default());
        let (mut agent, _handle) = Agent::new(1, router, &config());

        assert!(agent.set_behaviour("missing").is_err());
        assert_eq!(agent.current_behaviour(), None);

        agent.register_behaviour("a", Recorder::default());
        agent.register_behaviour("b", Recorder::default());
        agent.set_behaviour("a").unwrap();
        agent.set_behaviour("b").unwrap();
        assert_eq!(agent.current_behaviour(), Some("b"));

        assert!(agent.remove_behaviour("b"));
        assert!(!agent.remove_behaviour("b"));
        assert_eq!(agent.current_behaviour(), Some("b"));
        assert!(agent.set_behaviour("b").is_err());
    }

    #[tokio::test]
    async fn test_send_mail_tags_sender() {
        let router = Arc::new(LoopbackRouter::default());
        let (agent, _handle) = Agent::new(7, router.clone(), &config());
        agent.send_mail(Message::mail("hello"), 3).await.unwrap();

        let routed = router.routed.lock();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0.sender, "7");
        assert_eq!(routed[0].1, 3);
        assert_eq!(routed[0].2, 7);
    }

    #[tokio::test]
    async fn test_sync_state_machine() {
        let router = Arc::new(LoopbackRouter::default());
        let (agent, _handle) = Agent::new(1, router.clone(), &config());
        let (mut peer, peer_handle) = Agent::new(2, router.clone(), &config());
        router.peers.lock().insert(2, peer_handle.clone());

        assert!(agent.send_sync_message(Message::sync("early")).await.is_err());
        assert!(agent.stop_synchronous_communication().is_err());

        agent.start_sync_communication(2).await.unwrap();
        assert_eq!(agent.sync_status(), SyncStatus::Established);
        assert_eq!(peer_handle.sync_status(), SyncStatus::Established);

        // A second start fails and leaves the channel intact.
        assert!(agent.start_sync_communication(2).await.is_err());
        assert_eq!(agent.sync_status(), SyncStatus::Established);

        agent.send_sync_message(Message::sync("Let's start !")).await.unwrap();
        assert_eq!(peer.poll_sync().unwrap().content, "Let's start !");

        agent.stop_synchronous_communication().unwrap();
        assert_eq!(agent.sync_status(), SyncStatus::Idle);
        assert!(agent.send_sync_message(Message::sync("after")).await.is_err());

        // The peer notices on its next poll and goes back to idle.
        assert!(peer.poll_sync().is_none());
        assert_eq!(peer.sync_status(), SyncStatus::Idle);
        assert!(peer.send_sync_message(Message::sync("after")).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_start_returns_to_idle() {
        let router = Arc::new(LoopbackRouter::default());
        let (agent, _handle) = Agent::new(1, router, &config());
        assert!(matches!(
            agent.start_sync_communication(99).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(agent.sync_status(), SyncStatus::Idle);
    }

    /// Router whose sync requests wait until the test opens the gate.
    #[derive(Default)]
    struct GatedRouter {
        entered: tokio::sync::Notify,
        gate: tokio::sync::Notify,
        requests: AtomicUsize,
        far_ends: Mutex<Vec<SyncChannel>>,
    }

    #[async_trait]
    impl AgentRouter for GatedRouter {
        async fn route(&self, _message: Message, _receiver: AgentId, _sender: AgentId) -> Result<()> {
            Ok(())
        }

        async fn sync_channel_with(&self, source: AgentId, target: AgentId) -> Result<SyncChannel> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.gate.notified().await;
            let (mine, theirs) = SyncChannel::local_pair(source, target, 4);
            self.far_ends.lock().push(theirs);
            Ok(mine)
        }
    }

    #[tokio::test]
    async fn test_requesting_refuses_second_start_and_stop() {
        let router = Arc::new(GatedRouter::default());
        let (agent, handle) = Agent::new(1, router.clone(), &config());

        let (first, ()) = tokio::join!(agent.start_sync_communication(2), async {
            router.entered.notified().await;
            assert_eq!(agent.sync_status(), SyncStatus::Requesting);
            assert_eq!(handle.sync_status(), SyncStatus::Requesting);

            let second = agent.start_sync_communication(3).await;
            assert!(
                matches!(&second, Err(Error::SyncChannel(reason)) if reason.contains("already requesting")),
                "{:?}",
                second
            );
            assert!(matches!(
                agent.stop_synchronous_communication(),
                Err(Error::SyncChannel(_))
            ));
            assert_eq!(agent.sync_status(), SyncStatus::Requesting);

            // No inbound channel can take the slot while the request is out.
            let (_other, theirs) = SyncChannel::local_pair(4, 1, 4);
            assert!(handle.install_sync_channel(theirs).is_err());
            assert_eq!(agent.sync_status(), SyncStatus::Requesting);

            router.gate.notify_one();
        });

        first.unwrap();
        assert_eq!(agent.sync_status(), SyncStatus::Established);
        assert_eq!(router.requests.load(Ordering::SeqCst), 1);
        agent.stop_synchronous_communication().unwrap();
        assert_eq!(agent.sync_status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_death_stops_run_loop() {
        let router = Arc::new(LoopbackRouter::default());
        let (mut agent, handle) = Agent::new(1, router, &config());
        let events = Arc::new(Mutex::new(Vec::new()));
        agent.register_behaviour("rec", Recorder { events: Arc::clone(&events) });
        agent.set_behaviour("rec").unwrap();

        handle.deliver(Message::death());
        tokio::time::timeout(Duration::from_secs(2), agent.run())
            .await
            .unwrap();
        assert!(events.lock().iter().all(|e| !e.starts_with("mail")));
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_agent() {
        let router = Arc::new(LoopbackRouter::default());
        let (mut agent, handle) = Agent::new(1, router, &config());
        drop(handle);
        assert_eq!(agent.step().await, Step::Stopped);
    }
}
