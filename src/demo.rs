//! Ping-pong behaviours used by the CLI demos and the cluster tests.
//!
//! The initiator opens the exchange, answers every reply until it has seen
//! `rounds` of them, then ends it with "Stop !". The responder answers
//! whatever it receives until it sees "Stop !".

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::agent::{Agent, Behaviour};
use crate::container::Container;
use crate::error::Result;
use crate::protocol::{AgentId, Message};

pub const START: &str = "Start !";
pub const SYNC_START: &str = "Let's start !";
pub const PING: &str = "Ping";
pub const PONG: &str = "Pong";
pub const STOP: &str = "Stop !";

/// Default number of exchanges before the initiator stops.
pub const DEFAULT_ROUNDS: u32 = 10;

/// Messages observed by a behaviour, in order.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    pub fn record(&self, line: impl Into<String>) {
        self.0.lock().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.0.lock().iter().filter(|l| l.as_str() == line).count()
    }

    /// Poll until `line` shows up or `timeout` elapses.
    pub async fn wait_for(&self, line: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count(line) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count(line) > 0
    }
}

/// Register `behaviour` as the agent's only behaviour and run it.
pub fn launch<B: Behaviour + 'static>(container: &Container, mut agent: Agent, behaviour: B) -> Result<JoinHandle<()>> {
    agent.register_behaviour("demo", behaviour);
    agent.set_behaviour("demo")?;
    Ok(container.spawn(agent))
}

/// Opens a mailbox exchange with `peer`.
#[derive(Debug)]
pub struct PingInitiator {
    peer: AgentId,
    rounds: u32,
    started: bool,
    received: u32,
    transcript: Transcript,
}

impl PingInitiator {
    pub fn new(peer: AgentId, rounds: u32, transcript: Transcript) -> Self {
        Self {
            peer,
            rounds,
            started: false,
            received: 0,
            transcript,
        }
    }
}

#[async_trait]
impl Behaviour for PingInitiator {
    async fn act(&mut self, agent: &mut Agent) {
        if self.started {
            return;
        }
        match agent.send_mail(Message::mail(START), self.peer).await {
            Ok(()) => self.started = true,
            Err(e) => tracing::warn!(agent_id = agent.id(), peer = self.peer, "Could not start exchange: {}", e),
        }
    }

    async fn handle_mailbox_message(&mut self, agent: &mut Agent, message: Message) {
        tracing::info!(agent_id = agent.id(), "Message received: {}", message.content);
        self.transcript.record(message.content.as_str());
        self.received += 1;

        let reply = if self.received < self.rounds { PONG } else { STOP };
        if let Err(e) = agent.send_mail(Message::mail(reply), self.peer).await {
            tracing::warn!(agent_id = agent.id(), "Could not reply: {}", e);
        }
    }
}

/// Answers mailbox messages with "Ping" until told to stop.
#[derive(Debug, Default)]
pub struct PingResponder {
    transcript: Transcript,
}

impl PingResponder {
    pub fn new(transcript: Transcript) -> Self {
        Self { transcript }
    }
}

#[async_trait]
impl Behaviour for PingResponder {
    async fn handle_mailbox_message(&mut self, agent: &mut Agent, message: Message) {
        tracing::info!(agent_id = agent.id(), "Message received: {}", message.content);
        self.transcript.record(message.content.as_str());
        if message.content == STOP {
            return;
        }

        let Ok(sender) = message.sender.parse::<AgentId>() else {
            tracing::warn!(agent_id = agent.id(), sender = %message.sender, "Cannot reply to non-agent sender");
            return;
        };
        if let Err(e) = agent.send_mail(Message::mail(PING), sender).await {
            tracing::warn!(agent_id = agent.id(), "Could not reply: {}", e);
        }
    }
}

/// Opens a sync channel with `peer` on its first tick and plays ping-pong
/// over it.
#[derive(Debug)]
pub struct SyncInitiator {
    peer: AgentId,
    rounds: u32,
    started: bool,
    received: u32,
    transcript: Transcript,
}

impl SyncInitiator {
    pub fn new(peer: AgentId, rounds: u32, transcript: Transcript) -> Self {
        Self {
            peer,
            rounds,
            started: false,
            received: 0,
            transcript,
        }
    }
}

#[async_trait]
impl Behaviour for SyncInitiator {
    async fn act(&mut self, agent: &mut Agent) {
        if self.started {
            return;
        }
        if let Err(e) = agent.start_sync_communication(self.peer).await {
            // Busy peers are retried on the next tick.
            tracing::warn!(agent_id = agent.id(), peer = self.peer, "Sync communication not started: {}", e);
            return;
        }
        self.started = true;
        if let Err(e) = agent.send_sync_message(Message::sync(SYNC_START)).await {
            tracing::warn!(agent_id = agent.id(), "{}", e);
        }
    }

    async fn handle_mailbox_message(&mut self, agent: &mut Agent, message: Message) {
        tracing::debug!(agent_id = agent.id(), "Ignoring mail: {}", message.content);
    }

    async fn handle_sync_communication(&mut self, agent: &mut Agent, message: Message) {
        tracing::info!(agent_id = agent.id(), "Sync message received: {}", message.content);
        self.transcript.record(message.content.as_str());
        if message.content != PING {
            return;
        }
        self.received += 1;

        let reply = if self.received < self.rounds { PONG } else { STOP };
        if let Err(e) = agent.send_sync_message(Message::sync(reply)).await {
            tracing::warn!(agent_id = agent.id(), "Could not reply: {}", e);
        }
    }
}

/// Answers sync messages with "Ping" and closes the channel on "Stop !".
#[derive(Debug, Default)]
pub struct SyncResponder {
    transcript: Transcript,
}

impl SyncResponder {
    pub fn new(transcript: Transcript) -> Self {
        Self { transcript }
    }
}

#[async_trait]
impl Behaviour for SyncResponder {
    async fn handle_mailbox_message(&mut self, agent: &mut Agent, message: Message) {
        tracing::debug!(agent_id = agent.id(), "Ignoring mail: {}", message.content);
    }

    async fn handle_sync_communication(&mut self, agent: &mut Agent, message: Message) {
        tracing::info!(agent_id = agent.id(), "Sync message received: {}", message.content);
        self.transcript.record(message.content.as_str());

        let result = match message.content.as_str() {
            PONG | SYNC_START => agent.send_sync_message(Message::sync(PING)).await,
            STOP => agent.stop_synchronous_communication(),
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(agent_id = agent.id(), "{}", e);
        }
    }
}

/// Mailbox ping-pong between two agents of one container. Returns the
/// initiator's and responder's transcripts once "Stop !" was delivered.
pub async fn run_async_local(container: &Arc<Container>, rounds: u32, timeout: Duration) -> Result<(Transcript, Transcript)> {
    let initiator = container.add_agent().await?;
    let responder = container.add_agent().await?;
    let (initiator_log, responder_log) = (Transcript::default(), Transcript::default());

    let peer = responder.id();
    launch(container, responder, PingResponder::new(responder_log.clone()))?;
    launch(container, initiator, PingInitiator::new(peer, rounds, initiator_log.clone()))?;

    responder_log.wait_for(STOP, timeout).await;
    Ok((initiator_log, responder_log))
}

/// Sync-channel ping-pong between two agents of one container.
pub async fn run_sync_local(container: &Arc<Container>, rounds: u32, timeout: Duration) -> Result<(Transcript, Transcript)> {
    let initiator = container.add_agent().await?;
    let responder = container.add_agent().await?;
    let (initiator_log, responder_log) = (Transcript::default(), Transcript::default());

    let peer = responder.id();
    launch(container, responder, SyncResponder::new(responder_log.clone()))?;
    launch(container, initiator, SyncInitiator::new(peer, rounds, initiator_log.clone()))?;

    responder_log.wait_for(STOP, timeout).await;
    Ok((initiator_log, responder_log))
}
