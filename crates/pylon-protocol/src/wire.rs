//! Peer RPC wire envelopes.
//!
//! Every call is a JSON discriminated union `{"action": ..., "data": ...}`.
//! Request/response transport sends one envelope per HTTP POST; the
//! persistent-socket transport wraps the same envelope in an id-correlated
//! frame so replies may arrive out of order.

use serde::{Deserialize, Serialize};

use crate::action::{Action, RouteUpdateMessage};
use crate::peer::PeerInfo;
use crate::ProtocolError;
use chrono::{DateTime, Utc};

/// Requests a node's `/rpc` surface accepts from peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data")]
pub enum PeerRequest {
    /// Credential bootstrap. Over the socket transport this must be the
    /// first frame; over HTTP it doubles as a preflight (the bearer header
    /// is checked on every call regardless).
    #[serde(rename = "authorize", rename_all = "camelCase")]
    Authorize { token: String },

    #[serde(rename = "internal:protocol:open", rename_all = "camelCase")]
    Open {
        peer_info: PeerInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hold_time: Option<u64>,
    },

    #[serde(rename = "internal:protocol:update", rename_all = "camelCase")]
    Update {
        peer_info: PeerInfo,
        update: RouteUpdateMessage,
    },

    #[serde(rename = "internal:protocol:keepalive", rename_all = "camelCase")]
    Keepalive { peer_info: PeerInfo },

    #[serde(rename = "internal:protocol:close", rename_all = "camelCase")]
    Close {
        peer_info: PeerInfo,
        code: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl PeerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::Authorize { .. } => "authorize",
            PeerRequest::Open { .. } => "internal:protocol:open",
            PeerRequest::Update { .. } => "internal:protocol:update",
            PeerRequest::Keepalive { .. } => "internal:protocol:keepalive",
            PeerRequest::Close { .. } => "internal:protocol:close",
        }
    }

    /// Convert an inbound request into the action it implies, stamping the
    /// ingest time. `Authorize` carries no action.
    pub fn into_action(self, at: DateTime<Utc>) -> Option<Action> {
        match self {
            PeerRequest::Authorize { .. } => None,
            PeerRequest::Open {
                peer_info,
                hold_time,
            } => Some(Action::InternalProtocolOpen {
                peer_info: peer_info.wire_identity(),
                hold_time,
                at,
            }),
            PeerRequest::Update { peer_info, update } => Some(Action::InternalProtocolUpdate {
                peer_info: peer_info.wire_identity(),
                update,
                at,
            }),
            PeerRequest::Keepalive { peer_info } => Some(Action::InternalProtocolKeepalive {
                name: peer_info.name,
                at,
            }),
            PeerRequest::Close {
                peer_info,
                code,
                reason,
            } => Some(Action::InternalProtocolClose {
                name: peer_info.name,
                code,
                reason,
            }),
        }
    }
}

/// Uniform RPC reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeerResponse {
    pub fn ok() -> Self {
        PeerResponse {
            success: true,
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        PeerResponse {
            success: false,
            error: Some(msg.into()),
        }
    }
}

/// A request with correlation id, for the persistent-socket transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: PeerRequest,
}

/// Reply to a [`SocketFrame`], matched by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketReply {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SocketReply {
    pub fn from_response(id: u64, response: PeerResponse) -> Self {
        SocketReply {
            id,
            success: response.success,
            error: response.error,
        }
    }
}

/// Transport family selected by a peer endpoint's URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// `http://` or `https://`: one envelope per request.
    Http,
    /// `ws://` or `wss://`: persistent socket with id-correlated frames.
    Socket,
}

impl TransportKind {
    pub fn from_endpoint(endpoint: &str) -> Result<TransportKind, ProtocolError> {
        let scheme = endpoint.split("://").next().unwrap_or("");
        match scheme {
            "http" | "https" => Ok(TransportKind::Http),
            "ws" | "wss" => Ok(TransportKind::Socket),
            _ => Err(ProtocolError::UnsupportedScheme {
                endpoint: endpoint.to_string(),
            }),
        }
    }
}
