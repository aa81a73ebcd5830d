//! Route advertisements -- local service routes and peer-learned routes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer::PeerInfo;

/// Protocol family of an advertised service route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RouteProtocol {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "http:graphql")]
    HttpGraphql,
    #[serde(rename = "http:gql")]
    HttpGql,
    #[serde(rename = "http:grpc")]
    HttpGrpc,
}

impl RouteProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteProtocol::Http => "http",
            RouteProtocol::HttpGraphql => "http:graphql",
            RouteProtocol::HttpGql => "http:gql",
            RouteProtocol::HttpGrpc => "http:grpc",
        }
    }
}

impl fmt::Display for RouteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RouteProtocol {
    type Err = crate::ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(RouteProtocol::Http),
            "http:graphql" => Ok(RouteProtocol::HttpGraphql),
            "http:gql" => Ok(RouteProtocol::HttpGql),
            "http:grpc" => Ok(RouteProtocol::HttpGrpc),
            other => Err(crate::ProtocolError::UnknownProtocol {
                value: other.to_string(),
            }),
        }
    }
}

/// A service advertisement originated by some node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub name: String,
    pub protocol: RouteProtocol,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Route {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            name: self.name.clone(),
            protocol: self.protocol,
        }
    }
}

/// Composite identity of a local route: name + protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey {
    pub name: String,
    pub protocol: RouteProtocol,
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.protocol)
    }
}

/// A route learned from a peer, annotated with provenance and the node path
/// the announcement traversed.
///
/// Invariant: a `node_path` containing the local node's name marks a
/// detected loop -- such entries are kept for record-keeping but never
/// re-propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalRoute {
    pub route: Route,
    /// Identity of the announcing peer as carried on the wire (no token).
    pub peer: PeerInfo,
    pub peer_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_path: Vec<String>,
}

impl InternalRoute {
    pub fn new(route: Route, peer: PeerInfo, node_path: Vec<String>) -> Self {
        let peer_name = peer.name.clone();
        InternalRoute {
            route,
            peer,
            peer_name,
            node_path,
        }
    }

    pub fn key(&self) -> InternalRouteKey {
        InternalRouteKey {
            name: self.route.name.clone(),
            protocol: self.route.protocol,
            peer_name: self.peer_name.clone(),
        }
    }

    /// True when the announcement already traversed the given node.
    pub fn path_contains(&self, node: &str) -> bool {
        self.node_path.iter().any(|hop| hop == node)
    }
}

/// Identity of a learned route: name + protocol + announcing peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternalRouteKey {
    pub name: String,
    pub protocol: RouteProtocol,
    pub peer_name: String,
}

impl fmt::Display for InternalRouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.name, self.protocol, self.peer_name)
    }
}
