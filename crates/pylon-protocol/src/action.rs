//! Actions -- the closed union of every state-changing request.
//!
//! Discriminator strings (`local:peer:create`, `internal:protocol:update`,
//! ...) are fixed by the wire protocol. Time-dependent variants carry the
//! timestamp stamped where the action is constructed, so planning against a
//! snapshot stays a pure function of `(state, action)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::peer::PeerInfo;
use crate::route::{Route, RouteProtocol};

/// Add/remove discriminator inside an update batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Add,
    Remove,
}

/// One route change announced by a peer.
///
/// A missing `nodePath` deserializes as the empty path -- absent and empty
/// are the same announcement, normalized here and nowhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEntry {
    pub action: ChangeOp,
    pub route: Route,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_path: Vec<String>,
}

/// A batch of route changes carried by one update message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteUpdateMessage {
    pub updates: Vec<UpdateEntry>,
}

impl RouteUpdateMessage {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Every state-changing request the RIB accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data")]
pub enum Action {
    /// Register a peer. Overwrites an existing record of the same name
    /// (session reset) and initiates the open handshake.
    #[serde(rename = "local:peer:create", rename_all = "camelCase")]
    LocalPeerCreate { peer_info: PeerInfo },

    /// Same semantics as create; kept distinct so operator intent survives
    /// into audit logs.
    #[serde(rename = "local:peer:update", rename_all = "camelCase")]
    LocalPeerUpdate { peer_info: PeerInfo },

    /// Remove a peer and withdraw everything it announced.
    #[serde(rename = "local:peer:delete", rename_all = "camelCase")]
    LocalPeerDelete { name: String },

    /// Advertise a locally served route.
    #[serde(rename = "local:route:create", rename_all = "camelCase")]
    LocalRouteCreate { route: Route },

    /// Withdraw a locally served route.
    #[serde(rename = "local:route:delete", rename_all = "camelCase")]
    LocalRouteDelete { name: String, protocol: RouteProtocol },

    /// Inbound open handshake from a peer (possibly previously unknown).
    #[serde(rename = "internal:protocol:open", rename_all = "camelCase")]
    InternalProtocolOpen {
        peer_info: PeerInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hold_time: Option<u64>,
        #[serde(default = "Utc::now")]
        at: DateTime<Utc>,
    },

    /// Our own open RPC to the named peer succeeded (outbound handshake
    /// half). Never arrives over the wire.
    #[serde(rename = "internal:protocol:connected", rename_all = "camelCase")]
    InternalProtocolConnected {
        name: String,
        #[serde(default = "Utc::now")]
        at: DateTime<Utc>,
    },

    /// Route announcements from a connected peer.
    #[serde(rename = "internal:protocol:update", rename_all = "camelCase")]
    InternalProtocolUpdate {
        peer_info: PeerInfo,
        update: RouteUpdateMessage,
        #[serde(default = "Utc::now")]
        at: DateTime<Utc>,
    },

    /// Liveness refresh from a connected peer.
    #[serde(rename = "internal:protocol:keepalive", rename_all = "camelCase")]
    InternalProtocolKeepalive {
        name: String,
        #[serde(default = "Utc::now")]
        at: DateTime<Utc>,
    },

    /// Peer is closing its side of the session.
    #[serde(rename = "internal:protocol:close", rename_all = "camelCase")]
    InternalProtocolClose {
        name: String,
        code: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Logical clock: evaluates hold timers and emits keepalives.
    #[serde(rename = "tick", rename_all = "camelCase")]
    Tick {
        #[serde(default = "Utc::now")]
        at: DateTime<Utc>,
    },
}

impl Action {
    /// Wire discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::LocalPeerCreate { .. } => "local:peer:create",
            Action::LocalPeerUpdate { .. } => "local:peer:update",
            Action::LocalPeerDelete { .. } => "local:peer:delete",
            Action::LocalRouteCreate { .. } => "local:route:create",
            Action::LocalRouteDelete { .. } => "local:route:delete",
            Action::InternalProtocolOpen { .. } => "internal:protocol:open",
            Action::InternalProtocolConnected { .. } => "internal:protocol:connected",
            Action::InternalProtocolUpdate { .. } => "internal:protocol:update",
            Action::InternalProtocolKeepalive { .. } => "internal:protocol:keepalive",
            Action::InternalProtocolClose { .. } => "internal:protocol:close",
            Action::Tick { .. } => "tick",
        }
    }
}

/// An outbound delivery instruction produced by a committed transition.
///
/// The target identity is captured from the snapshot the plan was computed
/// against, so the transport never reads live state.
#[derive(Debug, Clone, PartialEq)]
pub struct Propagation {
    pub peer: PeerInfo,
    pub payload: PropagationPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropagationPayload {
    /// Open (or re-open) the session, proposing a hold time.
    Open { hold_time_secs: u64 },
    /// Incremental or resync route announcements.
    Update(RouteUpdateMessage),
    /// Liveness probe.
    Keepalive,
    /// Tear down the session.
    Close { code: u32, reason: Option<String> },
}

impl PropagationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            PropagationPayload::Open { .. } => "open",
            PropagationPayload::Update(_) => "update",
            PropagationPayload::Keepalive => "keepalive",
            PropagationPayload::Close { .. } => "close",
        }
    }
}
