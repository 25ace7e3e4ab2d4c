//! agentmesh library root.

pub mod agent;
pub mod cli;
pub mod config;
pub mod container;
pub mod demo;
pub mod directory;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use agent::{Agent, AgentHandle, AgentRouter, Behaviour, SyncChannel, SyncStatus};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use container::Container;
pub use directory::AddressDirectory;
pub use error::{Error, Result};
pub use protocol::{AgentId, ContainerId, Message, MessageType};
pub use transport::{ContainerOps, MessageTransport};
