//! Configuration types for pylon-node.
//! Parsed from ~/.pylon/config.toml.

use serde::{Deserialize, Serialize};
use std::path::Path;

use pylon_protocol::{PeerInfo, ProtocolDefaults, DEFAULTS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub timers: TimersSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub api: ApiSection,
    /// Statically seeded peers, registered at startup.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Mesh-unique node name; doubles as the path-vector element.
    #[serde(default = "default_name")]
    pub name: String,
    /// RPC endpoint announced to peers so they can dial back. Absent for
    /// nodes that only ever dial out.
    pub endpoint: Option<String>,
    /// Domains this node serves, announced in the identity.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Mesh credential: accepted on /rpc and presented to peers that carry
    /// no per-peer token. Generated into `peer_token_file` when unset.
    pub peer_token: Option<String>,
    #[serde(default = "default_peer_token_file")]
    pub peer_token_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimersSection {
    #[serde(default = "default_90")]
    pub hold_time_secs: u64,
    #[serde(default = "default_3")]
    pub min_hold_time_secs: u64,
}

impl Default for TimersSection {
    fn default() -> Self {
        Self {
            hold_time_secs: 90,
            min_hold_time_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_5")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_10")]
    pub rpc_timeout_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            rpc_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    /// Peer-facing listener (POST /rpc and the WebSocket upgrade).
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: String,
    /// Operator listener; loopback unless deliberately exposed.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
    #[serde(default = "default_admin_token_file")]
    pub admin_token_file: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            rpc_addr: default_rpc_addr(),
            admin_addr: default_admin_addr(),
            admin_token_file: default_admin_token_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Credential presented when dialing this peer; the node-wide token is
    /// the fallback.
    pub peer_token: Option<String>,
}

impl PeerEntry {
    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            domains: self.domains.clone(),
            peer_token: self.peer_token.clone(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "pylon".into()
}
fn default_peer_token_file() -> String {
    "~/.pylon/peer-token".into()
}
fn default_90() -> u64 {
    90
}
fn default_3() -> u64 {
    3
}
fn default_5() -> u64 {
    5
}
fn default_10() -> u64 {
    10
}
fn default_rpc_addr() -> String {
    "0.0.0.0:7100".into()
}
fn default_admin_addr() -> String {
    "127.0.0.1:7101".into()
}
fn default_admin_token_file() -> String {
    "~/.pylon/admin-token".into()
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Protocol timing knobs with the configured overrides applied.
    pub fn protocol_defaults(&self) -> ProtocolDefaults {
        ProtocolDefaults {
            hold_time_secs: self.timers.hold_time_secs,
            min_hold_time_secs: self.timers.min_hold_time_secs,
            connect_timeout_secs: self.transport.connect_timeout_secs,
            rpc_timeout_secs: self.transport.rpc_timeout_secs,
            ..DEFAULTS
        }
    }

    /// This node's identity as announced to peers.
    pub fn local_identity(&self) -> PeerInfo {
        PeerInfo {
            name: self.node.name.clone(),
            endpoint: self.node.endpoint.clone(),
            domains: self.node.domains.clone(),
            peer_token: None,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                name: default_name(),
                endpoint: None,
                domains: Vec::new(),
                peer_token: None,
                peer_token_file: default_peer_token_file(),
            },
            timers: TimersSection::default(),
            transport: TransportSection::default(),
            api: ApiSection::default(),
            peers: Vec::new(),
        }
    }
}
