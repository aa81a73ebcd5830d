//! The plan/commit state machine.
//!
//! `plan` computes a successor snapshot plus the outbound propagations the
//! transition implies, as a pure function of `(current snapshot, action)`.
//! `commit` swaps the held snapshot -- the only side effect in the crate.
//! Everything session-related (handshakes, hold timers, withdrawals on peer
//! loss) is expressed as transitions here; the transport layer only ever
//! executes the propagation instructions a commit hands it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pylon_protocol::{
    Action, ChangeOp, ConnectionStatus, InternalRoute, InternalRouteKey, PeerInfo, PeerRecord,
    Propagation, PropagationPayload, ProtocolDefaults, Route, RouteKey, RouteProtocol,
    RouteUpdateMessage, TransportKind, CLOSE_SHUTDOWN,
};

use crate::propagate::{propagate_changes, resync_update, AcceptedChange};
use crate::state::RibState;

/// Rejection produced by [`Rib::plan`]. The snapshot is untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("invalid action payload: {0}")]
    Validation(String),
    #[error("unknown peer: {0}")]
    PeerNotFound(String),
    #[error("unknown route: {0}")]
    RouteNotFound(RouteKey),
}

/// A plan was computed against a snapshot that has since been replaced.
/// Callers re-plan against the current snapshot. The single-writer RIB task
/// never hits this; it guards embedders driving a [`Rib`] directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("plan is stale: computed against version {planned}, RIB is at {current}")]
pub struct StalePlan {
    pub planned: u64,
    pub current: u64,
}

/// Outcome of the plan phase: the successor snapshot and the deliveries the
/// transition implies. Holding a `Plan` changes nothing until it is
/// committed.
#[derive(Debug, Clone)]
pub struct Plan {
    pub next: Arc<RibState>,
    pub propagations: Vec<Propagation>,
    /// Version of the snapshot this plan was computed against.
    pub base_version: u64,
}

/// The Routing Information Base of one node.
///
/// Owns the current snapshot. Planning borrows it immutably and may run
/// concurrently; committing requires `&mut self`, so write serialization is
/// enforced by ownership rather than locks.
#[derive(Debug)]
pub struct Rib {
    node_name: String,
    defaults: ProtocolDefaults,
    state: Arc<RibState>,
}

impl Rib {
    pub fn new(node_name: impl Into<String>, defaults: ProtocolDefaults) -> Self {
        Rib {
            node_name: node_name.into(),
            defaults,
            state: Arc::new(RibState::default()),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn defaults(&self) -> &ProtocolDefaults {
        &self.defaults
    }

    /// The current committed snapshot.
    pub fn state(&self) -> Arc<RibState> {
        Arc::clone(&self.state)
    }

    /// Compute the transition an action implies. Pure: no I/O, no partial
    /// mutation, repeatable against the same snapshot.
    pub fn plan(&self, action: &Action) -> Result<Plan, PlanError> {
        let base = self.state.as_ref();
        let (next, propagations) = match action {
            Action::LocalPeerCreate { peer_info } | Action::LocalPeerUpdate { peer_info } => {
                self.plan_peer_upsert(base, peer_info)?
            }
            Action::LocalPeerDelete { name } => self.plan_peer_delete(base, name)?,
            Action::LocalRouteCreate { route } => self.plan_route_create(base, route)?,
            Action::LocalRouteDelete { name, protocol } => {
                self.plan_route_delete(base, name, *protocol)?
            }
            Action::InternalProtocolOpen {
                peer_info,
                hold_time,
                at,
            } => self.plan_open(base, peer_info, *hold_time, *at)?,
            Action::InternalProtocolConnected { name, at } => {
                self.plan_connected(base, name, *at)?
            }
            Action::InternalProtocolUpdate {
                peer_info,
                update,
                at,
            } => self.plan_update(base, peer_info, update, *at)?,
            Action::InternalProtocolKeepalive { name, at } => {
                self.plan_keepalive(base, name, *at)?
            }
            Action::InternalProtocolClose { name, code, reason } => {
                self.plan_close(base, name, *code, reason.as_deref())?
            }
            Action::Tick { at } => self.plan_tick(base, *at),
        };

        let next = match next {
            Some(mut state) => {
                state.version = base.version + 1;
                Arc::new(state)
            }
            // Nothing changed (a quiet tick): reuse the current snapshot so
            // downstream consumers can skip publication by Arc identity.
            None => Arc::clone(&self.state),
        };
        Ok(Plan {
            next,
            propagations,
            base_version: base.version,
        })
    }

    /// Swap in a planned successor. Does not re-validate; rejects plans
    /// computed against a snapshot that has since been replaced.
    pub fn commit(&mut self, plan: Plan) -> Result<Arc<RibState>, StalePlan> {
        if plan.base_version != self.state.version {
            return Err(StalePlan {
                planned: plan.base_version,
                current: self.state.version,
            });
        }
        self.state = plan.next;
        Ok(Arc::clone(&self.state))
    }

    /// Plan and commit in one step. Under `&mut self` the plan cannot go
    /// stale between the two phases, so only plan errors are possible.
    pub fn apply(&mut self, action: &Action) -> Result<(Arc<RibState>, Vec<Propagation>), PlanError> {
        let mut plan = self.plan(action)?;
        let propagations = std::mem::take(&mut plan.propagations);
        self.state = plan.next;
        Ok((Arc::clone(&self.state), propagations))
    }

    fn negotiate_hold_time(&self, proposed: Option<u64>) -> u64 {
        let negotiated = match proposed {
            Some(p) => self.defaults.hold_time_secs.min(p),
            None => self.defaults.hold_time_secs,
        };
        negotiated.max(self.defaults.min_hold_time_secs)
    }

    fn validate_peer_info(&self, info: &PeerInfo) -> Result<(), PlanError> {
        if info.name.trim().is_empty() {
            return Err(PlanError::Validation("peer name must not be empty".into()));
        }
        if info.name == self.node_name {
            return Err(PlanError::Validation(format!(
                "peer name {} matches the local node name",
                info.name
            )));
        }
        if let Some(endpoint) = &info.endpoint {
            TransportKind::from_endpoint(endpoint)
                .map_err(|e| PlanError::Validation(e.to_string()))?;
        }
        Ok(())
    }

    fn plan_peer_upsert(
        &self,
        base: &RibState,
        info: &PeerInfo,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        self.validate_peer_info(info)?;

        let mut next = base.clone();
        // Re-registering an existing name is a session reset: the old
        // session's routes are withdrawn as if the peer had closed.
        let stripped = strip_peer_routes(&mut next, &info.name);
        let record = PeerRecord::new(info.clone(), self.defaults.hold_time_secs);
        next.internal.peers.insert(info.name.clone(), Arc::new(record));

        let mut propagations = vec![Propagation {
            peer: info.clone(),
            payload: PropagationPayload::Open {
                hold_time_secs: self.defaults.hold_time_secs,
            },
        }];
        propagations.extend(propagate_changes(
            &next,
            &self.node_name,
            Some(&info.name),
            &stripped,
        ));
        Ok((Some(next), propagations))
    }

    fn plan_peer_delete(
        &self,
        base: &RibState,
        name: &str,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        let record = base
            .peer(name)
            .ok_or_else(|| PlanError::PeerNotFound(name.to_string()))?;
        let target = record.info.clone();

        let mut next = base.clone();
        next.internal.peers.remove(name);
        let stripped = strip_peer_routes(&mut next, name);

        // Tell the peer we are going away while we still know how to reach
        // it, then withdraw everything it announced from the survivors.
        let mut propagations = vec![Propagation {
            peer: target,
            payload: PropagationPayload::Close {
                code: CLOSE_SHUTDOWN,
                reason: Some("peer deleted".into()),
            },
        }];
        propagations.extend(propagate_changes(
            &next,
            &self.node_name,
            Some(name),
            &stripped,
        ));
        Ok((Some(next), propagations))
    }

    fn plan_route_create(
        &self,
        base: &RibState,
        route: &Route,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        validate_route(route)?;

        let mut next = base.clone();
        next.local.routes.insert(route.key(), Arc::new(route.clone()));

        let changes = [AcceptedChange {
            op: ChangeOp::Add,
            route: route.clone(),
            node_path: Vec::new(),
        }];
        let propagations = propagate_changes(&next, &self.node_name, None, &changes);
        Ok((Some(next), propagations))
    }

    fn plan_route_delete(
        &self,
        base: &RibState,
        name: &str,
        protocol: RouteProtocol,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        let key = RouteKey {
            name: name.to_string(),
            protocol,
        };
        let mut next = base.clone();
        let removed = next
            .local
            .routes
            .remove(&key)
            .ok_or(PlanError::RouteNotFound(key))?;

        let changes = [AcceptedChange {
            op: ChangeOp::Remove,
            route: (*removed).clone(),
            node_path: Vec::new(),
        }];
        let propagations = propagate_changes(&next, &self.node_name, None, &changes);
        Ok((Some(next), propagations))
    }

    fn plan_open(
        &self,
        base: &RibState,
        info: &PeerInfo,
        proposed_hold: Option<u64>,
        at: DateTime<Utc>,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        self.validate_peer_info(info)?;

        let existing = base.peer(&info.name);
        let was_connected =
            existing.is_some_and(|p| p.status == ConnectionStatus::Connected);

        // The wire identity is merged over what we already know: a sparser
        // inbound identity must not erase a locally configured endpoint or
        // outbound secret.
        let mut merged = info.clone();
        if let Some(prev) = existing {
            if merged.endpoint.is_none() {
                merged.endpoint = prev.info.endpoint.clone();
            }
            if merged.peer_token.is_none() {
                merged.peer_token = prev.info.peer_token.clone();
            }
        }

        let mut record = PeerRecord::new(merged, self.negotiate_hold_time(proposed_hold));
        record.status = ConnectionStatus::Connected;
        record.last_connected = Some(at);
        record.last_message_received = Some(at);
        let info_for_send = record.info.clone();

        let mut next = base.clone();
        next.internal
            .peers
            .insert(info.name.clone(), Arc::new(record));

        // Open back plus a full-table resync, but only on the transition
        // into connected. The damping on redundant opens is what lets the
        // symmetric handshake terminate.
        let mut propagations = Vec::new();
        if !was_connected {
            propagations.push(Propagation {
                peer: info_for_send.clone(),
                payload: PropagationPayload::Open {
                    hold_time_secs: self.defaults.hold_time_secs,
                },
            });
            let resync = resync_update(&next, &self.node_name, &info.name);
            if !resync.is_empty() {
                propagations.push(Propagation {
                    peer: info_for_send,
                    payload: PropagationPayload::Update(resync),
                });
            }
        }
        Ok((Some(next), propagations))
    }

    fn plan_connected(
        &self,
        base: &RibState,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        let record = base
            .peer(name)
            .ok_or_else(|| PlanError::PeerNotFound(name.to_string()))?;
        let was_connected = record.status == ConnectionStatus::Connected;

        let mut updated = (**record).clone();
        updated.status = ConnectionStatus::Connected;
        updated.last_connected = Some(at);
        updated.last_message_received = Some(at);
        let info_for_send = updated.info.clone();

        let mut next = base.clone();
        next.internal
            .peers
            .insert(name.to_string(), Arc::new(updated));

        let mut propagations = Vec::new();
        if !was_connected {
            let resync = resync_update(&next, &self.node_name, name);
            if !resync.is_empty() {
                propagations.push(Propagation {
                    peer: info_for_send,
                    payload: PropagationPayload::Update(resync),
                });
            }
        }
        Ok((Some(next), propagations))
    }

    fn plan_update(
        &self,
        base: &RibState,
        info: &PeerInfo,
        update: &RouteUpdateMessage,
        at: DateTime<Utc>,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        let record = base
            .peer(&info.name)
            .ok_or_else(|| PlanError::PeerNotFound(info.name.clone()))?;
        for entry in &update.updates {
            validate_route(&entry.route)?;
        }

        let (touched, recovered) = touch_peer(record, at);
        let sender_info = touched.info.clone();
        let sender = info.name.clone();

        let mut next = base.clone();
        next.internal
            .peers
            .insert(sender.clone(), Arc::new(touched));

        let mut changes = Vec::with_capacity(update.updates.len());
        for entry in &update.updates {
            match entry.action {
                ChangeOp::Add => {
                    let learned = InternalRoute::new(
                        entry.route.clone(),
                        info.wire_identity(),
                        entry.node_path.clone(),
                    );
                    if learned.path_contains(&self.node_name) {
                        tracing::debug!(
                            route = %learned.key(),
                            path = ?learned.node_path,
                            "loop-flagged announcement stored for record-keeping"
                        );
                    }
                    next.internal.routes.insert(learned.key(), Arc::new(learned));
                    changes.push(AcceptedChange {
                        op: ChangeOp::Add,
                        route: entry.route.clone(),
                        node_path: entry.node_path.clone(),
                    });
                }
                ChangeOp::Remove => {
                    let key = InternalRouteKey {
                        name: entry.route.name.clone(),
                        protocol: entry.route.protocol,
                        peer_name: sender.clone(),
                    };
                    // Withdrawing something we never stored is a no-op; we
                    // also never announced it downstream.
                    if let Some(removed) = next.internal.routes.remove(&key) {
                        changes.push(AcceptedChange {
                            op: ChangeOp::Remove,
                            route: removed.route.clone(),
                            node_path: removed.node_path.clone(),
                        });
                    }
                }
            }
        }

        let mut propagations = Vec::new();
        if recovered {
            // The peer was degraded and may have missed propagations.
            let resync = resync_update(&next, &self.node_name, &sender);
            if !resync.is_empty() {
                propagations.push(Propagation {
                    peer: sender_info,
                    payload: PropagationPayload::Update(resync),
                });
            }
        }
        propagations.extend(propagate_changes(
            &next,
            &self.node_name,
            Some(&sender),
            &changes,
        ));
        Ok((Some(next), propagations))
    }

    fn plan_keepalive(
        &self,
        base: &RibState,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        let record = base
            .peer(name)
            .ok_or_else(|| PlanError::PeerNotFound(name.to_string()))?;

        let (touched, recovered) = touch_peer(record, at);
        let sender_info = touched.info.clone();

        let mut next = base.clone();
        next.internal
            .peers
            .insert(name.to_string(), Arc::new(touched));

        let mut propagations = Vec::new();
        if recovered {
            let resync = resync_update(&next, &self.node_name, name);
            if !resync.is_empty() {
                propagations.push(Propagation {
                    peer: sender_info,
                    payload: PropagationPayload::Update(resync),
                });
            }
        }
        Ok((Some(next), propagations))
    }

    fn plan_close(
        &self,
        base: &RibState,
        name: &str,
        code: u32,
        reason: Option<&str>,
    ) -> Result<(Option<RibState>, Vec<Propagation>), PlanError> {
        let record = base
            .peer(name)
            .ok_or_else(|| PlanError::PeerNotFound(name.to_string()))?;

        let mut closed = (**record).clone();
        closed.status = ConnectionStatus::Closed;

        let mut next = base.clone();
        next.internal
            .peers
            .insert(name.to_string(), Arc::new(closed));
        let stripped = strip_peer_routes(&mut next, name);

        tracing::debug!(
            peer = %name,
            code,
            reason = reason.unwrap_or("none"),
            routes_stripped = stripped.len(),
            "peer closed its session"
        );
        // The record is retained (only a local delete removes it); the
        // session may reopen later.
        let propagations = propagate_changes(&next, &self.node_name, Some(name), &stripped);
        Ok((Some(next), propagations))
    }

    fn plan_tick(&self, base: &RibState, at: DateTime<Utc>) -> (Option<RibState>, Vec<Propagation>) {
        let mut next = base.clone();
        let mut changed = false;
        let mut stripped = Vec::new();

        for record in base.internal.peers.values() {
            if !record.status.is_active() {
                continue;
            }
            let Some(last_seen) = record.last_message_received.or(record.last_connected) else {
                continue;
            };
            let silent_secs = (at - last_seen).num_seconds();
            if silent_secs < 0 {
                continue;
            }
            let silent_secs = silent_secs as u64;
            let close_after =
                record.hold_time_secs * self.defaults.hold_grace_multiplier as u64;

            if silent_secs > close_after {
                // Past the grace window the close is folded in locally: the
                // peer is unresponsive, no close RPC is sent.
                let mut rec = (**record).clone();
                rec.status = ConnectionStatus::Closed;
                next.internal
                    .peers
                    .insert(record.name().to_string(), Arc::new(rec));
                stripped.extend(strip_peer_routes(&mut next, record.name()));
                changed = true;
                tracing::warn!(
                    peer = %record.name(),
                    silent_secs,
                    "hold timer expired past grace, closing session"
                );
            } else if silent_secs > record.hold_time_secs
                && record.status == ConnectionStatus::Connected
            {
                let mut rec = (**record).clone();
                rec.status = ConnectionStatus::Degraded;
                next.internal
                    .peers
                    .insert(record.name().to_string(), Arc::new(rec));
                changed = true;
                tracing::warn!(
                    peer = %record.name(),
                    silent_secs,
                    hold_time_secs = record.hold_time_secs,
                    "hold timer expired, marking degraded"
                );
            }
        }

        let mut propagations = propagate_changes(&next, &self.node_name, None, &stripped);
        // Keepalive every session still being kept alive, degraded included.
        for record in next.internal.peers.values() {
            if record.status.is_active() {
                propagations.push(Propagation {
                    peer: record.info.clone(),
                    payload: PropagationPayload::Keepalive,
                });
            }
        }

        (changed.then_some(next), propagations)
    }
}

/// Remove every InternalRoute announced by `peer_name`, returning the
/// removals as withdrawal candidates carrying their stored paths.
fn strip_peer_routes(state: &mut RibState, peer_name: &str) -> Vec<AcceptedChange> {
    let keys: Vec<InternalRouteKey> = state
        .internal
        .routes
        .values()
        .filter(|r| r.peer_name == peer_name)
        .map(|r| r.key())
        .collect();
    let mut stripped = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(route) = state.internal.routes.remove(&key) {
            stripped.push(AcceptedChange {
                op: ChangeOp::Remove,
                route: route.route.clone(),
                node_path: route.node_path.clone(),
            });
        }
    }
    stripped
}

/// Refresh liveness on an inbound message. A degraded peer recovers to
/// connected; the caller owes it a resync.
fn touch_peer(record: &PeerRecord, at: DateTime<Utc>) -> (PeerRecord, bool) {
    let mut touched = record.clone();
    touched.last_message_received = Some(at);
    let recovered = record.status == ConnectionStatus::Degraded;
    if recovered {
        touched.status = ConnectionStatus::Connected;
        touched.last_connected = Some(at);
    }
    (touched, recovered)
}

fn validate_route(route: &Route) -> Result<(), PlanError> {
    if route.name.trim().is_empty() {
        return Err(PlanError::Validation("route name must not be empty".into()));
    }
    if route.endpoint.trim().is_empty() {
        return Err(PlanError::Validation(format!(
            "route {} has an empty endpoint",
            route.name
        )));
    }
    Ok(())
}
