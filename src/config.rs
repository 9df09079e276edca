use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// WebSocket URL of the signaling relay
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// Client-role tag announced with the ready frame
    #[serde(default = "default_role_tag")]
    pub role_tag: String,
    /// Delay before reconnecting after relay loss
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN servers for NAT traversal
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Label of the data channel created toward each peer
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
    /// Eviction window for a negotiation stuck in Connecting
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:3030".to_string()
}

fn default_role_tag() -> String {
    "rust-client".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_channel_label() -> String {
    "chat".to_string()
}

fn default_negotiation_timeout_ms() -> u64 {
    30_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            role_tag: default_role_tag(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            channel_label: default_channel_label(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when no file
    /// exists at the given path.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }
}
