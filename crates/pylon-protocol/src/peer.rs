//! Peer identity and session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a mesh node. Immutable once created.
///
/// `name` is unique across the mesh and doubles as the path-vector element
/// in route announcements. `peer_token` is the secret used when *this* node
/// initiates a session to the peer; it is stripped before the struct is
/// serialized toward the wire (see [`PeerInfo::wire_identity`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub name: String,
    /// RPC endpoint URL (`http://host:port/rpc` or `ws://host:port/rpc`).
    /// Absent for peers we only ever accept sessions from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Domains this node serves. Informational for route consumers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_token: Option<String>,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        PeerInfo {
            name: name.into(),
            endpoint: None,
            domains: Vec::new(),
            peer_token: None,
        }
    }

    /// Copy safe to send to a peer: the outbound session secret is dropped.
    pub fn wire_identity(&self) -> PeerInfo {
        PeerInfo {
            peer_token: None,
            ..self.clone()
        }
    }
}

/// Session state of a peer as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Registered locally, session not yet established.
    Initializing,
    /// Open handshake completed; receives propagations.
    Connected,
    /// Hold timer expired once; suspect but not torn down.
    Degraded,
    /// Session ended (remote close, hold expiry past grace, or shutdown).
    Closed,
}

impl ConnectionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionStatus::Initializing => "initializing",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Closed => "closed",
        }
    }

    /// Session considered up: keepalives are still exchanged.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Degraded)
    }
}

/// A peer's identity plus session-management attributes.
///
/// Created when a peer is registered locally or learned via an open
/// handshake. Exactly one record per name within a RIB instance; a create
/// with a duplicate name overwrites (last-write-wins, matching BGP peer
/// re-establishment semantics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub info: PeerInfo,
    pub status: ConnectionStatus,
    /// Negotiated hold time: min(local default, peer's proposal).
    pub hold_time_secs: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_message_received: Option<DateTime<Utc>>,
}

impl PeerRecord {
    pub fn new(info: PeerInfo, hold_time_secs: u64) -> Self {
        PeerRecord {
            info,
            status: ConnectionStatus::Initializing,
            hold_time_secs,
            last_connected: None,
            last_message_received: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}
