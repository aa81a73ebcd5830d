//! Pylon protocol -- schema and wire types for the mesh control plane.
//!
//! JSON discriminated unions (`{"action": ..., "data": ...}`) over HTTP
//! POST or a persistent WebSocket, both served at `/rpc`. Field names are
//! camelCase on the wire; that shape predates this implementation and is
//! load-bearing.

pub mod action;
pub mod defaults;
pub mod peer;
pub mod route;
pub mod wire;

pub use action::{
    Action, ChangeOp, Propagation, PropagationPayload, RouteUpdateMessage, UpdateEntry,
};
pub use defaults::{ProtocolDefaults, DEFAULTS};
pub use peer::{ConnectionStatus, PeerInfo, PeerRecord};
pub use route::{InternalRoute, InternalRouteKey, Route, RouteKey, RouteProtocol};
pub use wire::{PeerRequest, PeerResponse, SocketFrame, SocketReply, TransportKind};

/// RPC path every node serves, for both transports.
pub const RPC_PATH: &str = "/rpc";

/// Close code: administrative shutdown (peer deleted locally).
pub const CLOSE_SHUTDOWN: u32 = 1;

/// Close code: hold timer expired past the grace window.
pub const CLOSE_HOLD_EXPIRED: u32 = 2;

/// Close code: the peer violated the protocol.
pub const CLOSE_PROTOCOL_ERROR: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported endpoint scheme: {endpoint} (want http(s):// or ws(s)://)")]
    UnsupportedScheme { endpoint: String },
    #[error("unknown route protocol: {value} (want http, http:graphql, http:gql or http:grpc)")]
    UnknownProtocol { value: String },
}
