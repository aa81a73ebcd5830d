//! Immutable RIB state snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use pylon_protocol::{
    ConnectionStatus, InternalRoute, InternalRouteKey, PeerRecord, Route, RouteKey,
};

/// One committed snapshot of routing state.
///
/// Snapshots are never mutated in place: a commit builds a successor and
/// swaps the `Arc`. Collections hold `Arc`'d values, so a successor shares
/// every peer and route the transition didn't touch -- only the map spines
/// are copied. Ordered maps keep iteration (and therefore propagation
/// order) deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RibState {
    /// Monotonic commit counter; bumped by every changing plan.
    pub version: u64,
    pub local: LocalState,
    pub internal: InternalState,
    /// Reserved for future protocol families.
    pub external: ExternalState,
}

/// Routes this node originates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    pub routes: BTreeMap<RouteKey, Arc<Route>>,
}

/// Peers and the routes learned from them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InternalState {
    pub peers: BTreeMap<String, Arc<PeerRecord>>,
    pub routes: BTreeMap<InternalRouteKey, Arc<InternalRoute>>,
}

/// Empty namespace held for external protocol families.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExternalState {}

impl RibState {
    pub fn peer(&self, name: &str) -> Option<&Arc<PeerRecord>> {
        self.internal.peers.get(name)
    }

    /// Peers eligible to receive propagations.
    pub fn connected_peers(&self) -> impl Iterator<Item = &Arc<PeerRecord>> {
        self.internal
            .peers
            .values()
            .filter(|p| p.status == ConnectionStatus::Connected)
    }

    /// Routes learned from the named peer.
    pub fn routes_from<'a>(
        &'a self,
        peer_name: &'a str,
    ) -> impl Iterator<Item = &'a Arc<InternalRoute>> + 'a {
        self.internal
            .routes
            .values()
            .filter(move |r| r.peer_name == peer_name)
    }

    /// (local routes, peers, learned routes) -- for logs and the status API.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.local.routes.len(),
            self.internal.peers.len(),
            self.internal.routes.len(),
        )
    }
}
