//! Pluggable agent behaviour.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Agent;
use crate::protocol::Message;

/// Application logic driven by an agent's run loop. Only one behaviour method
/// runs at a time for a given agent.
#[async_trait]
pub trait Behaviour: Send + Sync {
    async fn perceive(&mut self, _agent: &mut Agent) {}

    async fn decide(&mut self, _agent: &mut Agent) {}

    async fn act(&mut self, _agent: &mut Agent) {}

    async fn handle_mailbox_message(&mut self, agent: &mut Agent, message: Message);

    async fn handle_sync_communication(&mut self, _agent: &mut Agent, message: Message) {
        tracing::debug!("Ignoring sync message: {}", message);
    }
}

/// Behaviour as stored in an agent's registry.
pub type SharedBehaviour = Arc<Mutex<dyn Behaviour>>;

pub fn shared<B: Behaviour + 'static>(behaviour: B) -> SharedBehaviour {
    Arc::new(Mutex::new(behaviour))
}
