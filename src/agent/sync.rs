//! Synchronous channel endpoints.
//!
//! A channel is never shared across a network. Each agent holds its own
//! endpoint: a bounded outbound queue, a bounded inbound queue and a closed
//! flag shared with whatever sits at the far end. For two agents in one
//! container that is the other endpoint. For a remote peer it is a relay task
//! in the transport that performs one network send per message, so ordering
//! holds per direction only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::{Error, Result};
use crate::protocol::{AgentId, Message};

/// One agent's end of a synchronous channel.
#[derive(Debug)]
pub struct SyncChannel {
    peer_id: AgentId,
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
    closed: Arc<AtomicBool>,
}

/// Transport side of a bridged endpoint.
#[derive(Debug)]
pub(crate) struct BridgeEnds {
    /// Messages the local agent wants relayed to the peer.
    pub outbound: mpsc::Receiver<Message>,
    /// Messages arriving from the peer for the local agent.
    pub inbound: mpsc::Sender<Message>,
    pub closed: Arc<AtomicBool>,
}

/// Cloneable send half, usable without holding the agent's sync slot.
#[derive(Debug, Clone)]
pub struct SyncSender {
    outbound: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
}

impl SyncSender {
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SyncChannel("channel is closed".to_string()));
        }
        self.outbound.send(message).await.map_err(|_| {
            self.closed.store(true, Ordering::Release);
            Error::SyncChannel("peer end of the channel is gone".to_string())
        })
    }
}

impl SyncChannel {
    /// Two directly connected endpoints for agents in the same container.
    /// The first endpoint belongs to `first` and talks to `second`.
    pub fn local_pair(first: AgentId, second: AgentId, capacity: usize) -> (SyncChannel, SyncChannel) {
        let (to_first, first_inbox) = mpsc::channel(capacity);
        let (to_second, second_inbox) = mpsc::channel(capacity);
        let closed = Arc::new(AtomicBool::new(false));

        let first_end = SyncChannel {
            peer_id: second,
            outbound: to_second,
            inbound: first_inbox,
            closed: Arc::clone(&closed),
        };
        let second_end = SyncChannel {
            peer_id: first,
            outbound: to_first,
            inbound: second_inbox,
            closed,
        };
        (first_end, second_end)
    }

    /// An endpoint whose far side is driven by the transport.
    pub(crate) fn bridged(peer_id: AgentId, capacity: usize) -> (SyncChannel, BridgeEnds) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let closed = Arc::new(AtomicBool::new(false));

        let endpoint = SyncChannel {
            peer_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
            closed: Arc::clone(&closed),
        };
        let ends = BridgeEnds {
            outbound: outbound_rx,
            inbound: inbound_tx,
            closed,
        };
        (endpoint, ends)
    }

    pub fn peer_id(&self) -> AgentId {
        self.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn sender(&self) -> SyncSender {
        SyncSender {
            outbound: self.outbound.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Next queued message, `Ok(None)` when nothing is pending. Messages
    /// queued before a close are still handed out; once drained, a closed
    /// channel reports an error.
    pub fn try_recv(&mut self) -> Result<Option<Message>> {
        match self.inbound.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) if !self.is_closed() => Ok(None),
            Err(_) => {
                self.closed.store(true, Ordering::Release);
                Err(Error::SyncChannel(format!(
                    "channel with agent {} is closed",
                    self.peer_id
                )))
            }
        }
    }

    /// Close both directions. The endpoint cannot be reopened.
    pub fn close(self) {
        self.closed.store(true, Ordering::Release);
    }
}
