//! Path-vector export rules.
//!
//! Loop freedom comes entirely from the accumulated node path, the way BGP
//! uses the AS path: the exporter prepends the local node name exactly once
//! per hop and refuses to emit anything whose stored path already contains
//! it. The RIB carries no topology model.

use pylon_protocol::{
    ChangeOp, Propagation, PropagationPayload, Route, RouteUpdateMessage, UpdateEntry,
};

use crate::state::RibState;

/// A route change that was accepted into the successor state and is a
/// candidate for export. `node_path` is the stored path (import side), not
/// the outbound one.
#[derive(Debug, Clone)]
pub(crate) struct AcceptedChange {
    pub op: ChangeOp,
    pub route: Route,
    pub node_path: Vec<String>,
}

/// Build the outbound entry for one accepted change, or `None` when the
/// stored path already contains the local node (detected loop -- stored for
/// bookkeeping, never re-announced).
pub(crate) fn export_entry(
    local_name: &str,
    op: ChangeOp,
    route: &Route,
    stored_path: &[String],
) -> Option<UpdateEntry> {
    if stored_path.iter().any(|hop| hop == local_name) {
        tracing::debug!(
            route = %route.key(),
            path = ?stored_path,
            "loop detected, suppressing announcement"
        );
        return None;
    }
    let mut node_path = Vec::with_capacity(stored_path.len() + 1);
    node_path.push(local_name.to_string());
    node_path.extend_from_slice(stored_path);
    Some(UpdateEntry {
        action: op,
        route: route.clone(),
        node_path,
    })
}

/// Fan a set of accepted changes out to every connected peer except the
/// originator. All targets receive the same entry list; one empty export
/// (all changes loop-suppressed) yields no propagations at all.
pub(crate) fn propagate_changes(
    next: &RibState,
    local_name: &str,
    originator: Option<&str>,
    changes: &[AcceptedChange],
) -> Vec<Propagation> {
    let updates: Vec<UpdateEntry> = changes
        .iter()
        .filter_map(|c| export_entry(local_name, c.op, &c.route, &c.node_path))
        .collect();
    if updates.is_empty() {
        return Vec::new();
    }

    next.connected_peers()
        .filter(|p| originator != Some(p.name()))
        .map(|p| Propagation {
            peer: p.info.clone(),
            payload: PropagationPayload::Update(RouteUpdateMessage {
                updates: updates.clone(),
            }),
        })
        .collect()
}

/// Full-table resend for a peer entering `connected`: every local route plus
/// every learned route (stored paths, loop and echo rules applied). Empty
/// when this node has nothing to announce.
pub(crate) fn resync_update(
    state: &RibState,
    local_name: &str,
    target: &str,
) -> RouteUpdateMessage {
    let mut updates = Vec::new();
    for route in state.local.routes.values() {
        if let Some(entry) = export_entry(local_name, ChangeOp::Add, route, &[]) {
            updates.push(entry);
        }
    }
    for learned in state.internal.routes.values() {
        if learned.peer_name == target {
            continue; // no echo
        }
        if let Some(entry) = export_entry(local_name, ChangeOp::Add, &learned.route, &learned.node_path)
        {
            updates.push(entry);
        }
    }
    RouteUpdateMessage { updates }
}
