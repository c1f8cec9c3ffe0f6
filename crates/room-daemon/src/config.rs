//! Daemon configuration.
//!
//! An optional JSON file supplies the node's identity, listen address, peers
//! and timing. Missing fields take their defaults; command-line flags
//! override the file.

use anyhow::{anyhow, Context, Result};
use room_core::{MonitorConfig, NodeConfig, PeerId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::outgoing::ReconnectConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Node id (generated if not set)
    pub id: Option<PeerId>,

    /// Player display name
    pub name: Option<String>,

    /// Address to listen on for incoming links
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Known peers; links are dialed to those with a higher id than ours
    #[serde(default)]
    pub peers: Vec<PeerAddress>,

    /// Word list for hosted puzzles, one word per line
    pub words: Option<PathBuf>,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// Where to reach one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: PeerId,
    pub address: String,
}

/// Parses `id=ws://host:port`.
impl FromStr for PeerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, address) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected <id>=<ws url>, got {:?}", s))?;
        let id = id
            .trim()
            .parse()
            .with_context(|| format!("Invalid peer id in {:?}", s))?;
        let address = address.trim();
        if !address.starts_with("ws://") && !address.starts_with("wss://") {
            return Err(anyhow!("Peer address must be a ws:// url, got {:?}", address));
        }
        Ok(Self {
            id,
            address: address.to_string(),
        })
    }
}

/// Timing knobs, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Inactivity before a peer is suspected (default: 3000)
    #[serde(default = "default_tolerance")]
    pub tolerance_ms: u64,

    /// Failure sweep period (default: 1000)
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Sweeps a suspect survives before eviction (default: 3)
    #[serde(default = "default_x_factor")]
    pub x_factor: u32,

    /// Ping period (default: 1000)
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,

    /// Wait for a player operation to deliver (default: 10000)
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_ms: u64,

    /// Wait for a reply over a link (default: 5000)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Cap on the delay between retries of a failed outbound call (default: 1000)
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,

    /// First reconnect delay (default: 1000)
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Cap on the reconnect delay (default: 30000)
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: default_tolerance(),
            check_interval_ms: default_check_interval(),
            x_factor: default_x_factor(),
            heartbeat_ms: default_heartbeat(),
            delivery_timeout_ms: default_delivery_timeout(),
            call_timeout_ms: default_call_timeout(),
            retry_max_ms: default_retry_max(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

impl TimingConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            ..ReconnectConfig::default()
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_tolerance() -> u64 {
    3000
}

fn default_check_interval() -> u64 {
    1000
}

fn default_x_factor() -> u32 {
    3
}

fn default_heartbeat() -> u64 {
    1000
}

fn default_delivery_timeout() -> u64 {
    10_000
}

fn default_call_timeout() -> u64 {
    5000
}

fn default_retry_max() -> u64 {
    1000
}

fn default_reconnect_initial() -> u64 {
    1000
}

fn default_reconnect_max() -> u64 {
    30_000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            listen: default_listen(),
            peers: Vec::new(),
            words: None,
            timing: TimingConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Node configuration for the given identity.
    pub fn node_config(&self, id: PeerId, name: &str) -> NodeConfig {
        let timing = &self.timing;
        let mut config = NodeConfig::new(id, name);
        config.monitor = MonitorConfig {
            tolerance: Duration::from_millis(timing.tolerance_ms),
            check_interval: Duration::from_millis(timing.check_interval_ms),
            x_factor: timing.x_factor,
        };
        config.heartbeat_interval = Duration::from_millis(timing.heartbeat_ms);
        config.delivery_timeout = Duration::from_millis(timing.delivery_timeout_ms);
        config.retry.max_delay = Duration::from_millis(timing.retry_max_ms);
        config
    }

    /// Peers this node dials: one link per pair, opened by the lower id.
    pub fn dial_targets(&self, own: PeerId) -> impl Iterator<Item = &PeerAddress> {
        self.peers.iter().filter(move |peer| peer.id > own)
    }
}
