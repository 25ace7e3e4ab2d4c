//! Configuration loading for agentmesh.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Get the agentmesh home directory (~/.agentmesh).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentmesh"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.agentmesh/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;
    load_settings_from(&path)
}

/// Load settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.node.listen_address.trim().is_empty() {
        return Err(Error::Config("node.listen_address must not be empty".to_string()));
    }
    if !settings.node.is_main && settings.node.main_address.trim().is_empty() {
        return Err(Error::Config(
            "node.main_address is required for a regular container".to_string(),
        ));
    }
    if settings.transport.request_timeout_ms == 0 {
        return Err(Error::Config("transport.request_timeout_ms must be > 0".to_string()));
    }
    if settings.transport.connect_timeout_ms == 0 {
        return Err(Error::Config("transport.connect_timeout_ms must be > 0".to_string()));
    }
    if settings.agents.mailbox_capacity == 0 {
        return Err(Error::Config("agents.mailbox_capacity must be > 0".to_string()));
    }
    if settings.agents.sync_channel_capacity == 0 {
        return Err(Error::Config("agents.sync_channel_capacity must be > 0".to_string()));
    }
    Ok(())
}

/// Node (container) configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NodeConfig {
    /// Address the container listens on (host:port).
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Address announced to peers and the directory. Defaults to the listen
    /// host with the port actually bound.
    pub advertise_address: Option<String>,
    /// Address of the main container.
    #[serde(default = "default_main_address")]
    pub main_address: String,
    #[serde(default)]
    pub is_main: bool,
}

fn default_listen_address() -> String {
    "localhost:8080".to_string()
}

fn default_main_address() -> String {
    "localhost:8080".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            advertise_address: None,
            main_address: default_main_address(),
            is_main: false,
        }
    }
}

/// Transport configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransportConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Agent runtime configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentRuntimeConfig {
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_sync_channel_capacity")]
    pub sync_channel_capacity: usize,
    /// Pause after an idle perceive/decide/act cycle.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_mailbox_capacity() -> usize {
    50
}

fn default_sync_channel_capacity() -> usize {
    16
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl AgentRuntimeConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            sync_channel_capacity: default_sync_channel_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// agentmesh settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub agents: AgentRuntimeConfig,
}

impl Settings {
    /// Settings for a main container listening on `listen_address`.
    pub fn main(listen_address: impl Into<String>) -> Self {
        let listen_address = listen_address.into();
        Self {
            node: NodeConfig {
                main_address: listen_address.clone(),
                listen_address,
                advertise_address: None,
                is_main: true,
            },
            ..Default::default()
        }
    }

    /// Settings for a regular container that registers with `main_address`.
    pub fn regular(listen_address: impl Into<String>, main_address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                listen_address: listen_address.into(),
                advertise_address: None,
                main_address: main_address.into(),
                is_main: false,
            },
            ..Default::default()
        }
    }
}
