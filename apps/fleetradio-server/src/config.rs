//! Node configuration.
//!
//! Supports loading from a YAML file with environment-variable overrides,
//! following the core library's flat-tunables/YAML pattern.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleetradio_core::neighborhood::NodeId;
use serde::{Deserialize, Serialize};

/// Node identity, peer addressing, and scenario parameters. Everything in
/// [`fleetradio_core::Config`] is loaded separately and optionally
/// overridden from the same file's `tunables` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id.
    /// Override: `FLEETRADIO_SELF_ID`
    pub self_id: NodeId,

    /// Whether this node may be elected gateway/time master.
    pub is_gateway_capable: bool,

    /// `NodeId -> SocketAddr` table for the internal peer protocol (UDP).
    pub peers: BTreeMap<NodeId, SocketAddr>,

    /// Local address to bind the internal peer protocol's UDP socket to.
    pub internal_bind_addr: SocketAddr,

    /// Broadcast address HELLOs are sent to.
    pub hello_broadcast_addr: SocketAddr,

    /// Local address to bind the HELLO UDP socket to.
    pub hello_bind_addr: SocketAddr,

    /// Local address the remote-control TCP socket listens on.
    /// Override: `FLEETRADIO_CONTROL_ADDR`
    pub control_addr: SocketAddr,

    /// Collaboration-server registration endpoint (ZMQ REQ).
    pub collab_register_addr: Option<String>,

    /// Collaboration-bus push endpoint (ZMQ PUSH), peer reports.
    pub collab_push_addr: Option<String>,

    /// Initial scenario center frequency, in Hz.
    pub initial_frequency: f64,

    /// Initial scenario RF bandwidth, in Hz.
    pub initial_bandwidth: f64,

    /// Channel count of the scheduling grid.
    pub nchannels: usize,

    /// Slot count of the scheduling grid.
    pub nslots: usize,

    /// Directory `score_reported.csv` and other per-node logs are written
    /// under. `None` disables scoring persistence.
    /// Override: `FLEETRADIO_LOG_DIR`
    pub log_dir: Option<PathBuf>,

    /// `fleetradio_core::Config` tunables, loaded as a nested table so a
    /// deployment can override individual periods/thresholds without
    /// repeating every field.
    pub tunables: fleetradio_core::Config,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            self_id: 1,
            is_gateway_capable: true,
            peers: BTreeMap::new(),
            internal_bind_addr: "0.0.0.0:4096".parse().unwrap(),
            hello_broadcast_addr: "255.255.255.255:4097".parse().unwrap(),
            hello_bind_addr: "0.0.0.0:4097".parse().unwrap(),
            control_addr: "127.0.0.1:8888".parse().unwrap(),
            collab_register_addr: None,
            collab_push_addr: None,
            initial_frequency: 915_000_000.0,
            initial_bandwidth: 5_000_000.0,
            nchannels: 1,
            nslots: 8,
            log_dir: None,
            tunables: fleetradio_core::Config::default(),
        }
    }
}

impl NodeConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FLEETRADIO_SELF_ID") {
            if let Ok(id) = val.parse() {
                self.self_id = id;
            }
        }
        if let Ok(val) = std::env::var("FLEETRADIO_CONTROL_ADDR") {
            if let Ok(addr) = val.parse() {
                self.control_addr = addr;
            }
        }
        if let Ok(val) = std::env::var("FLEETRADIO_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(val));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_loopback_control_socket() {
        let config = NodeConfig::default();
        assert_eq!(config.control_addr.port(), 8888);
        assert!(config.control_addr.ip().is_loopback());
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = NodeConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let _: NodeConfig = serde_yaml::from_str(&yaml).unwrap();
    }
}
